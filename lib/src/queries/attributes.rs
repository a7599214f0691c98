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

use std::sync::Arc;

use super::listener::ListenerHandle;

/// Immutable configuration snapshot of one CQ.
///
/// Shared by reference between the query, its dispatcher and any stream
/// re-registration. Reconfiguration builds a new snapshot and swaps it in
/// atomically; a snapshot is never modified after `build()`.
#[derive(Debug, Clone)]
pub struct CqAttributes {
    predicate: String,
    region: Option<String>,
    listeners: Vec<ListenerHandle>,
    is_durable: bool,
}

impl CqAttributes {
    pub fn builder(predicate: impl Into<String>) -> CqAttributesBuilder {
        CqAttributesBuilder::new(predicate)
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// Listeners in registration order
    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn is_durable(&self) -> bool {
        self.is_durable
    }

    /// Region the CQ runs over: the explicit one if set, otherwise the one
    /// named by the predicate's `FROM /Region` clause
    pub fn region(&self) -> Option<String> {
        self.region
            .clone()
            .or_else(|| region_from_predicate(&self.predicate))
    }

    pub(crate) fn with_listeners(&self, listeners: Vec<ListenerHandle>) -> Arc<CqAttributes> {
        Arc::new(CqAttributes {
            predicate: self.predicate.clone(),
            region: self.region.clone(),
            listeners,
            is_durable: self.is_durable,
        })
    }
}

/// Builder for [`CqAttributes`]
///
/// ```ignore
/// let attributes = CqAttributes::builder("SELECT * FROM /Portfolios WHERE ID != 1")
///     .listener(ListenerHandle::anonymous(Arc::new(MyListener)))
///     .durable(false)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct CqAttributesBuilder {
    predicate: String,
    region: Option<String>,
    listeners: Vec<ListenerHandle>,
    is_durable: bool,
}

impl CqAttributesBuilder {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            region: None,
            listeners: Vec::new(),
            is_durable: false,
        }
    }

    /// Set the region explicitly, for predicates without a `FROM` clause
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn listener(mut self, listener: ListenerHandle) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listeners(mut self, listeners: impl IntoIterator<Item = ListenerHandle>) -> Self {
        self.listeners.extend(listeners);
        self
    }

    pub fn durable(mut self, is_durable: bool) -> Self {
        self.is_durable = is_durable;
        self
    }

    pub fn build(self) -> Arc<CqAttributes> {
        Arc::new(CqAttributes {
            predicate: self.predicate,
            region: self.region,
            listeners: self.listeners,
            is_durable: self.is_durable,
        })
    }
}

fn region_from_predicate(predicate: &str) -> Option<String> {
    let mut tokens = predicate.split_whitespace();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("from") {
            let path = tokens.next()?;
            let name = path
                .trim_start_matches('/')
                .split(|c: char| c == '/' || c == '.' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            return (!name.is_empty()).then(|| name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::CqEvent;

    fn noop(id: &str) -> ListenerHandle {
        ListenerHandle::from_fn(id, |_event: &CqEvent| {})
    }

    #[test]
    fn test_builder_keeps_listener_order() {
        let attributes = CqAttributes::builder("SELECT * FROM /Portfolios")
            .listener(noop("first"))
            .listener(noop("second"))
            .build();

        let ids: Vec<&str> = attributes.listeners().iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert!(!attributes.is_durable());
    }

    #[test]
    fn test_region_from_predicate() {
        let attributes = CqAttributes::builder("select * from /Portfolios p where p.ID != 1").build();
        assert_eq!(attributes.region().as_deref(), Some("Portfolios"));

        let nested = CqAttributes::builder("SELECT * FROM /Positions/sub").build();
        assert_eq!(nested.region().as_deref(), Some("Positions"));

        let none = CqAttributes::builder("ID != 1").build();
        assert!(none.region().is_none());

        let explicit = CqAttributes::builder("ID != 1").region("Portfolios").build();
        assert_eq!(explicit.region().as_deref(), Some("Portfolios"));
    }

    #[test]
    fn test_with_listeners_produces_new_snapshot() {
        let original = CqAttributes::builder("SELECT * FROM /Portfolios")
            .listener(noop("a"))
            .durable(true)
            .build();
        let replaced = original.with_listeners(vec![noop("b")]);

        assert_eq!(original.listeners()[0].id(), "a");
        assert_eq!(replaced.listeners()[0].id(), "b");
        assert!(replaced.is_durable());
        assert_eq!(replaced.predicate(), original.predicate());
    }
}
