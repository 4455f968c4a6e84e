//! One optimistic toggle mechanism for likes, saves and follows.

use std::{collections::HashMap, hash::Hash};

#[derive(Debug, Clone)]
pub struct OptimisticToggles<K> {
    confirmed: HashMap<K, bool>,
    in_flight: HashMap<K, bool>,
}

impl<K> Default for OptimisticToggles<K> {
    fn default() -> Self {
        Self {
            confirmed: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> OptimisticToggles<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records server state learned elsewhere (feed payloads, profiles).
    pub fn seed(&mut self, key: K, active: bool) {
        self.confirmed.insert(key, active);
    }

    /// State to render: the in-flight value if any, else the confirmed one.
    pub fn current(&self, key: &K) -> bool {
        self.in_flight
            .get(key)
            .or_else(|| self.confirmed.get(key))
            .copied()
            .unwrap_or(false)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Flips the key locally. Returns the new desired state, or `None` while a
    /// previous toggle for the same key is still in flight.
    pub fn begin(&mut self, key: K) -> Option<bool> {
        if self.in_flight.contains_key(&key) {
            return None;
        }
        let desired = !self.current(&key);
        self.in_flight.insert(key, desired);
        Some(desired)
    }

    pub fn confirm(&mut self, key: K, active: bool) {
        self.in_flight.remove(&key);
        self.confirmed.insert(key, active);
    }

    /// Drops the in-flight value and returns the state to fall back to.
    pub fn rollback(&mut self, key: &K) -> bool {
        self.in_flight.remove(key);
        self.current(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_applies_then_confirms() {
        let mut likes = OptimisticToggles::new();
        likes.seed("p1", false);

        assert_eq!(likes.begin("p1"), Some(true));
        assert!(likes.current(&"p1"));
        assert_eq!(likes.begin("p1"), None);

        likes.confirm("p1", true);
        assert!(!likes.is_in_flight(&"p1"));
        assert!(likes.current(&"p1"));
    }

    #[test]
    fn rollback_restores_confirmed_state() {
        let mut follows = OptimisticToggles::new();
        follows.seed("u1", true);

        assert_eq!(follows.begin("u1"), Some(false));
        assert!(!follows.current(&"u1"));
        assert!(follows.rollback(&"u1"));
        assert!(follows.current(&"u1"));
    }
}
