use std::collections::HashMap;

use crate::messaging::events::EventKind;

/// Read-only mapping from symbolic route keys to physical topic names.
///
/// Built once from configuration; unmapped keys resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
}

impl TopicRouter {
    pub fn new(routes: HashMap<String, String>) -> Self {
        let routes = routes
            .into_iter()
            .filter(|(_, topic)| !topic.trim().is_empty())
            .collect();
        Self { routes }
    }

    /// Physical topic for an event kind
    pub fn topic_for(&self, kind: EventKind) -> &str {
        self.resolve(kind.route_key())
    }

    /// Physical topic for a route key (or a physical name passed through)
    pub fn resolve<'a>(&'a self, key: &'a str) -> &'a str {
        self.routes.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Every event kind with its resolved topic
    pub fn table(&self) -> Vec<(EventKind, String)> {
        EventKind::ALL
            .iter()
            .map(|kind| (*kind, self.topic_for(*kind).to_string()))
            .collect()
    }
}
