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

pub mod attributes;
pub mod cq_query;
pub mod listener;
pub mod registry;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use attributes::{CqAttributes, CqAttributesBuilder};
pub use cq_query::{CqAttributesMutator, CqQuery};
pub use listener::{CqListener, ListenerError, ListenerHandle};
pub use registry::{QueryRegistry, QueryRegistryBuilder};
pub use statistics::{CqServiceCounters, CqServiceStatistics, CqStatistics, CqStatisticsSnapshot};
