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

//! Listener capability set invoked by the event dispatcher.
//!
//! Callbacks for one CQ are never invoked concurrently: a single dispatcher
//! task per query calls `on_event` and `on_error` in sequence order, and
//! `close` runs once after that task has stopped. A panicking callback is
//! caught at the dispatch boundary and does not stop delivery.

use std::fmt;
use std::sync::Arc;

use crate::channels::CqEvent;
use crate::error::CqError;

/// Error delivered to `CqListener::on_error`
#[derive(Debug, Clone)]
pub enum ListenerError {
    /// The server reported an error for this CQ
    Server(Arc<CqEvent>),
    /// The client lost ordering or connectivity for this CQ
    Stream(Arc<CqError>),
}

impl ListenerError {
    pub fn stream(error: CqError) -> Self {
        ListenerError::Stream(Arc::new(error))
    }

    /// The client-side error, if this is a stream error
    pub fn as_cq_error(&self) -> Option<&CqError> {
        match self {
            ListenerError::Stream(error) => Some(error),
            ListenerError::Server(_) => None,
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Server(event) => write!(
                f,
                "server error at sequence {}: {}",
                event.sequence_id,
                event.server_error.as_deref().unwrap_or("unknown")
            ),
            ListenerError::Stream(error) => write!(f, "{error}"),
        }
    }
}

/// Application callbacks for a continuous query
///
/// # Example
///
/// ```ignore
/// struct PortfolioListener;
///
/// impl CqListener for PortfolioListener {
///     fn on_event(&self, event: &CqEvent) {
///         println!("{} -> {:?}", event.region_key, event.value_after);
///     }
///
///     fn on_error(&self, error: &ListenerError) {
///         eprintln!("cq error: {error}");
///     }
/// }
/// ```
pub trait CqListener: Send + Sync + 'static {
    fn on_event(&self, event: &CqEvent);

    fn on_error(&self, error: &ListenerError) {
        log::warn!("CQ listener error: {error}");
    }

    /// Called exactly once when the CQ is closed
    fn close(&self) {}
}

/// Adapter that wraps a closure into a [`CqListener`]
struct FnListener<F>(F);

impl<F> CqListener for FnListener<F>
where
    F: Fn(&CqEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CqEvent) {
        (self.0)(event);
    }
}

/// A listener plus the id it was registered under
#[derive(Clone)]
pub struct ListenerHandle {
    id: String,
    listener: Arc<dyn CqListener>,
}

impl ListenerHandle {
    pub fn new(id: impl Into<String>, listener: Arc<dyn CqListener>) -> Self {
        Self {
            id: id.into(),
            listener,
        }
    }

    /// Register a listener under a generated id
    pub fn anonymous(listener: Arc<dyn CqListener>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), listener)
    }

    /// Register a closure that only handles data events
    pub fn from_fn<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CqEvent) + Send + Sync + 'static,
    {
        Self::new(id, Arc::new(FnListener(f)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn listener(&self) -> &Arc<dyn CqListener> {
        &self.listener
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
