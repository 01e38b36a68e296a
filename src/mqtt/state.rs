//! Last known on/off state of every relay seen on the broker side.

use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchState {
    pub switch_id: String,
    pub on: bool,
}

/// Outcome of [`SwitchStateCache::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// First time this switch was seen.
    New,
    Changed,
    Unchanged,
}

/// Thread-safe switch state map.
///
/// Written only through [`Self::update`]; the refresh loop reads it through
/// [`Self::snapshot`].
#[derive(Debug, Default)]
pub struct SwitchStateCache {
    switches: Mutex<BTreeMap<String, bool>>,
}

impl SwitchStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, switch_id: &str, on: bool) -> Update {
        let mut switches = self.switches.lock();
        match switches.insert(switch_id.to_string(), on) {
            None => Update::New,
            Some(previous) if previous == on => Update::Unchanged,
            Some(_) => Update::Changed,
        }
    }

    pub fn get(&self, switch_id: &str) -> Option<bool> {
        self.switches.lock().get(switch_id).copied()
    }

    pub fn snapshot(&self) -> Vec<SwitchState> {
        self.switches
            .lock()
            .iter()
            .map(|(switch_id, on)| SwitchState {
                switch_id: switch_id.clone(),
                on: *on,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.switches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_new_changed_unchanged() {
        let cache = SwitchStateCache::new();
        assert!(cache.is_empty());

        assert_eq!(cache.update("1", true), Update::New);
        assert_eq!(cache.update("1", true), Update::Unchanged);
        assert_eq!(cache.update("1", false), Update::Changed);
        assert_eq!(cache.get("1"), Some(false));
        assert_eq!(cache.get("2"), None);
    }

    #[test]
    fn test_snapshot() {
        let cache = SwitchStateCache::new();
        cache.update("2", false);
        cache.update("1", true);
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.snapshot(),
            vec![
                SwitchState {
                    switch_id: "1".to_string(),
                    on: true
                },
                SwitchState {
                    switch_id: "2".to_string(),
                    on: false
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_updates() {
        let cache = std::sync::Arc::new(SwitchStateCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        cache.update(&format!("{}", i * 100 + n), n % 2 == 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
