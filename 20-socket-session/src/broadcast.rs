//! Local listeners for server-pushed broadcasts.
//!
//! Listeners are grouped by subject and called in the order they subscribed.
//! They are removed only through their own [`SubscriptionId`]; connection
//! state never touches this registry, so subscriptions survive reconnects.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ServerError;

/// Callback for pushes on one subject.
pub type Listener = Box<dyn FnMut(Result<Value, ServerError>) + Send + 'static>;

/// Handle returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub struct BroadcastRegistry {
    subjects: HashMap<String, Vec<(SubscriptionId, Listener)>>,
    next_id: u64,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subject: impl Into<String>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subjects
            .entry(subject.into())
            .or_default()
            .push((id, listener));
        id
    }

    /// Removes the listener registered under `id`. Returns whether it existed.
    pub fn unsubscribe(&mut self, subject: &str, id: SubscriptionId) -> bool {
        let Some(listeners) = self.subjects.get_mut(subject) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(own, _)| *own != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.subjects.remove(subject);
        }
        removed
    }

    /// Calls every listener of `subject` in subscription order.
    ///
    /// Returns how many listeners ran; zero when nobody listens.
    pub fn dispatch(&mut self, subject: &str, outcome: Result<Value, ServerError>) -> usize {
        let Some(listeners) = self.subjects.get_mut(subject) else {
            return 0;
        };
        for (_, listener) in listeners.iter_mut() {
            listener(outcome.clone());
        }
        listeners.len()
    }

    pub fn listener_count(&self, subject: &str) -> usize {
        self.subjects.get(subject).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = Arc::clone(log);
        Box::new(move |outcome| {
            log.lock().unwrap().push(format!("{tag}:{outcome:?}"));
        })
    }

    #[test]
    fn dispatch_runs_listeners_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = BroadcastRegistry::new();
        registry.subscribe("news", recording(&log, "first"));
        registry.subscribe("news", recording(&log, "second"));
        registry.subscribe("other", recording(&log, "other"));

        assert_eq!(registry.dispatch("news", Ok(json!(1))), 2);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("first:"));
        assert!(log[1].starts_with("second:"));
    }

    #[test]
    fn unsubscribed_listener_gets_nothing_more() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = BroadcastRegistry::new();
        let first = registry.subscribe("news", recording(&log, "first"));
        registry.subscribe("news", recording(&log, "second"));

        assert!(registry.unsubscribe("news", first));
        registry.dispatch("news", Ok(json!(2)));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("second:"));
    }

    #[test]
    fn unknown_subjects_and_handles_are_no_ops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = BroadcastRegistry::new();
        let id = registry.subscribe("news", recording(&log, "only"));

        assert_eq!(registry.dispatch("nobody", Ok(Value::Null)), 0);
        assert!(!registry.unsubscribe("nobody", id));
        assert!(registry.unsubscribe("news", id));
        assert!(!registry.unsubscribe("news", id));
        assert_eq!(registry.listener_count("news"), 0);
        assert!(log.lock().unwrap().is_empty());
    }
}
