//! Topic registry mapping subscribed topics to caller identifiers.

use std::collections::HashMap;

/// Remembers which caller-facing identifier a topic was last associated with.
///
/// Lookup is by exact topic string. Wildcard matching belongs to the broker
/// subscription itself; the registry only routes concrete topics back to the
/// identifier the caller chose for them. Entries survive disconnects.
///
/// # Example
///
/// ```
/// use mqtt_adapter::transport::mqtt::TopicRegistry;
///
/// let mut registry = TopicRegistry::new();
/// registry.add("sensors/temp", 42);
/// assert_eq!(registry.lookup("sensors/temp"), Some(42));
/// assert!(registry.remove("sensors/temp"));
/// assert!(!registry.remove("sensors/temp"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct TopicRegistry {
    topics: HashMap<String, i32>,
}

impl TopicRegistry {
    /// Create a new empty topic registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `topic` with `id`, replacing any previous identifier.
    ///
    /// Returns the identifier that was replaced, if any.
    pub fn add(&mut self, topic: &str, id: i32) -> Option<i32> {
        self.topics.insert(topic.to_string(), id)
    }

    /// Remove `topic`. Returns `true` if it was present.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    /// Exact-match lookup of the identifier registered for `topic`.
    pub fn lookup(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).copied()
    }

    /// Get an iterator over the registered topics and identifiers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.topics.iter().map(|(topic, id)| (topic.as_str(), *id))
    }

    /// Get the number of registered topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Clear all registered topics.
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}
