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

//! Fire-and-forget diagnostics sink.
//!
//! Gap detection, promotions, failed establishments, listener panics and
//! registry errors are reported here. Sinks must not block: they are called
//! from the dispatch loop and the failover path.

use chrono::{DateTime, Utc};
use log::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    GapDetected { expected: u64, received: u64 },
    Promotion {
        from: String,
        to: String,
        resume_from: u64,
    },
    FailoverExhausted,
    StandbyAdded { address: String },
    StandbyLost { address: String },
    EstablishFailed { address: String, reason: String },
    ListenerPanic { message: String },
    RegistryError { message: String },
}

#[derive(Debug, Clone)]
pub struct DiagnosticRecord {
    pub cq_name: String,
    pub kind: DiagnosticKind,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticRecord {
    pub fn new(cq_name: impl Into<String>, kind: DiagnosticKind) -> Self {
        Self {
            cq_name: cq_name.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

pub trait ObservabilitySink: Send + Sync {
    fn record(&self, record: DiagnosticRecord);
}

/// Default sink: writes every record to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ObservabilitySink for LogSink {
    fn record(&self, record: DiagnosticRecord) {
        let cq = &record.cq_name;
        match &record.kind {
            DiagnosticKind::GapDetected { expected, received } => {
                warn!("[{cq}] Sequence gap: expected {expected}, received {received}");
            }
            DiagnosticKind::Promotion {
                from,
                to,
                resume_from,
            } => {
                info!("[{cq}] Promoted {to} (retired {from}), resume after {resume_from}");
            }
            DiagnosticKind::FailoverExhausted => {
                error!("[{cq}] Primary lost with no standby available");
            }
            DiagnosticKind::StandbyAdded { address } => {
                info!("[{cq}] Standby established on {address}");
            }
            DiagnosticKind::StandbyLost { address } => {
                warn!("[{cq}] Standby on {address} lost");
            }
            DiagnosticKind::EstablishFailed { address, reason } => {
                warn!("[{cq}] Failed to open stream on {address}: {reason}");
            }
            DiagnosticKind::ListenerPanic { message } => {
                error!("[{cq}] Listener panicked: {message}");
            }
            DiagnosticKind::RegistryError { message } => {
                error!("[{cq}] Registry error: {message}");
            }
        }
    }
}
