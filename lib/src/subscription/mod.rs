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

//! Server-side plumbing of a running CQ: its streams and their failover.

pub mod channel;
pub mod failover;

pub use channel::{ChannelParams, ChannelSignal, StreamPosition, SubscriptionChannel};
pub use failover::{FailoverCoordinator, MigrationToken, PromotionOutcome};
