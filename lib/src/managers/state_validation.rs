// Copyright 2025 The GridCQ Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::channels::CqState;
use crate::error::{CqError, Result};

/// Lifecycle operations a caller can request on a CQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Close,
    Mutate,
}

/// Outcome of validating an operation against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The operation changes state and must be carried out
    Apply,
    /// The operation is already satisfied; nothing to do
    NoOp,
}

pub fn validate_operation(name: &str, state: CqState, operation: Operation) -> Result<Transition> {
    match (state, operation) {
        // Stopped: start and close move the query on, stop is already satisfied
        (CqState::Stopped, Operation::Start) => Ok(Transition::Apply),
        (CqState::Stopped, Operation::Stop) => Ok(Transition::NoOp),
        (CqState::Stopped, Operation::Close) => Ok(Transition::Apply),
        (CqState::Stopped, Operation::Mutate) => Ok(Transition::Apply),

        // Running
        (CqState::Running, Operation::Start) => Err(CqError::already_running(name)),
        (CqState::Running, Operation::Stop) => Ok(Transition::Apply),
        (CqState::Running, Operation::Close) => Ok(Transition::Apply),
        (CqState::Running, Operation::Mutate) => Ok(Transition::Apply),

        // Closed is terminal; closing again is a no-op
        (CqState::Closed, Operation::Close) => Ok(Transition::NoOp),
        (CqState::Closed, _) => Err(CqError::closed(name)),
    }
}
