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

//! Error types for continuous query operations.
//!
//! Public API returns `crate::error::Result<T>` with structured `CqError`
//! variants. Collaborator traits (discovery, transport) return
//! `anyhow::Result<T>`; those errors are carried through the transparent
//! `Internal` variant so the chain is preserved.
//!
//! # Example
//!
//! ```ignore
//! use gridcq_lib::error::{CqError, Result};
//!
//! async fn restart(registry: &QueryRegistry) -> Result<()> {
//!     match registry.register("MyCq", attributes).await {
//!         Err(CqError::DuplicateName { name }) => {
//!             println!("CQ '{}' is already registered", name);
//!         }
//!         Err(e) => return Err(e),
//!         Ok(cq) => cq.start().await?,
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Main error type for continuous query operations.
///
/// Operation-level errors (`DuplicateName`, `AlreadyRunning`, `Closed`) reject
/// only the offending call. Stream-level errors (`CqDisconnected`,
/// `FailoverExhausted`, `CqEventGap`) are also surfaced to the listener's
/// `on_error` while the query stays `Running`.
#[derive(Error, Debug)]
pub enum CqError {
    /// A CQ with this name is already registered.
    #[error("CQ '{name}' is already registered")]
    DuplicateName { name: String },

    /// The registry has been shut down and accepts no new registrations.
    #[error("Query registry is closed")]
    RegistryClosed,

    /// No CQ with this name is registered.
    #[error("CQ '{name}' not found")]
    NotFound { name: String },

    /// `start()` was called on a query that is already running.
    #[error("CQ '{name}' is already running")]
    AlreadyRunning { name: String },

    /// The query has been closed; closed is terminal.
    #[error("CQ '{name}' is closed")]
    Closed { name: String },

    /// The query lost its primary stream and has no path to the grid.
    #[error("CQ '{name}' is disconnected: {reason}")]
    CqDisconnected { name: String, reason: String },

    /// Primary was lost and no secondary was available to promote.
    #[error("Failover exhausted for CQ '{name}': no secondary available")]
    FailoverExhausted { name: String },

    /// A sequence id never arrived within the grace interval.
    #[error("Event gap on CQ '{name}': expected sequence {expected}, received {received}")]
    CqEventGap {
        name: String,
        expected: u64,
        received: u64,
    },

    /// Another promotion holds the migration token for this query.
    #[error("Migration already in progress for CQ '{name}'")]
    MigrationInProgress { name: String },

    /// The operation was aborted because the query was stopped or closed.
    #[error("Operation on CQ '{name}' cancelled")]
    Cancelled { name: String },

    /// No stream could be established to any candidate server.
    #[error("Failed to establish CQ '{name}': {reason}")]
    Establish { name: String, reason: String },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Internal error - wraps collaborator errors while preserving the chain.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// ============================================================================
// Constructor helpers
// ============================================================================

impl CqError {
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        CqError::DuplicateName { name: name.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        CqError::NotFound { name: name.into() }
    }

    pub fn already_running(name: impl Into<String>) -> Self {
        CqError::AlreadyRunning { name: name.into() }
    }

    pub fn closed(name: impl Into<String>) -> Self {
        CqError::Closed { name: name.into() }
    }

    pub fn disconnected(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CqError::CqDisconnected {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn failover_exhausted(name: impl Into<String>) -> Self {
        CqError::FailoverExhausted { name: name.into() }
    }

    pub fn event_gap(name: impl Into<String>, expected: u64, received: u64) -> Self {
        CqError::CqEventGap {
            name: name.into(),
            expected,
            received,
        }
    }

    pub fn migration_in_progress(name: impl Into<String>) -> Self {
        CqError::MigrationInProgress { name: name.into() }
    }

    pub fn cancelled(name: impl Into<String>) -> Self {
        CqError::Cancelled { name: name.into() }
    }

    pub fn establish(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CqError::Establish {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    ///
    /// # Example
    /// ```ignore
    /// CqError::invalid_config("redundancy_level must be <= 8")
    /// ```
    pub fn invalid_config(message: impl Into<String>) -> Self {
        CqError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error is reported to listeners while the query keeps running.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            CqError::CqDisconnected { .. }
                | CqError::FailoverExhausted { .. }
                | CqError::CqEventGap { .. }
        )
    }
}

/// Result type for continuous query operations.
pub type Result<T> = std::result::Result<T, CqError>;
