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

//! Shutdown guard for the query registry
//!
//! Once the registry begins shutting down, every new registration must be
//! rejected with `CqError::RegistryClosed`, including registrations racing
//! with the shutdown call itself.

use crate::error::CqError;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Guards registry operations against use after shutdown
///
/// `StateGuard` is cloneable; all clones share the same underlying flag.
#[derive(Clone)]
pub struct StateGuard {
    closed: Arc<RwLock<bool>>,
}

impl StateGuard {
    /// Create a new guard in the open state
    pub fn new() -> Self {
        Self {
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// Mark the registry as closed. Returns false if it already was.
    pub async fn mark_closed(&self) -> bool {
        let mut closed = self.closed.write().await;
        let was_open = !*closed;
        *closed = true;
        was_open
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Require that the registry is still open
    ///
    /// # Errors
    ///
    /// Returns `CqError::RegistryClosed` once `mark_closed` has been called.
    pub async fn require_open(&self) -> crate::error::Result<()> {
        if *self.closed.read().await {
            return Err(CqError::RegistryClosed);
        }
        Ok(())
    }
}

impl Default for StateGuard {
    fn default() -> Self {
        Self::new()
    }
}
