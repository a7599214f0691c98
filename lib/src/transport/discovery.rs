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

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use super::traits::{EndpointDiscovery, ServerAddress};
use crate::config::CqClientConfig;

/// Endpoint discovery backed by a fixed region → servers table
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    regions: HashMap<String, Vec<ServerAddress>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CqClientConfig) -> Self {
        let regions = config
            .static_endpoints
            .iter()
            .map(|endpoint| {
                let servers = endpoint
                    .servers
                    .iter()
                    .map(|s| ServerAddress::new(s.as_str()))
                    .collect();
                (endpoint.region.clone(), servers)
            })
            .collect();
        Self { regions }
    }

    pub fn with_region<I, S>(mut self, region: impl Into<String>, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerAddress>,
    {
        self.regions
            .insert(region.into(), servers.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl EndpointDiscovery for StaticDiscovery {
    async fn candidates(&self, region: &str) -> Result<Vec<ServerAddress>> {
        Ok(self.regions.get(region).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticEndpointConfig;

    #[tokio::test]
    async fn test_candidates_keep_configured_order() {
        let discovery = StaticDiscovery::new().with_region("Portfolios", ["b:1", "a:1", "c:1"]);
        let candidates = discovery.candidates("Portfolios").await.unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["b:1", "a:1", "c:1"]);
    }

    #[tokio::test]
    async fn test_unknown_region_has_no_candidates() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.candidates("Nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = CqClientConfig {
            static_endpoints: vec![StaticEndpointConfig {
                region: "Positions".to_string(),
                servers: vec!["cache-1:40404".to_string(), "cache-2:40404".to_string()],
            }],
            ..Default::default()
        };
        let discovery = StaticDiscovery::from_config(&config);
        assert_eq!(discovery.candidates("Positions").await.unwrap().len(), 2);
    }
}
