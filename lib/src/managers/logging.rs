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

use log::{error, info, warn};

pub fn log_cq_start(name: &str, predicate: &str) {
    info!("Starting CQ '{name}': {predicate}");
}

pub fn log_cq_stop(name: &str) {
    info!("Stopping CQ '{name}'");
}

pub fn log_cq_close(name: &str) {
    info!("Closing CQ '{name}'");
}

pub fn log_cq_error(name: &str, error: &str) {
    error!("Error in CQ '{name}': {error}");
}

pub fn log_cq_warning(name: &str, warning: &str) {
    warn!("Warning in CQ '{name}': {warning}");
}

pub fn log_promotion(name: &str, from: &str, to: &str, resume_from: u64) {
    info!("CQ '{name}' promoted {to} to primary (was {from}), resuming after sequence {resume_from}");
}
