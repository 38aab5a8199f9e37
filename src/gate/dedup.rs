use std::collections::{BTreeMap, HashMap};

/// Rolling set of signal ids seen recently. An id is remembered for its
/// TTL, held inside `[min_window, max_window]`, after its first sighting.
#[derive(Debug)]
pub struct DedupWindow {
    min_window_ms: u64,
    max_window_ms: u64,
    expiry: HashMap<String, u64>,
    by_expiry: BTreeMap<u64, Vec<String>>,
}

impl DedupWindow {
    pub fn new(min_window_ms: u64, max_window_ms: u64) -> Self {
        Self {
            min_window_ms,
            max_window_ms: max_window_ms.max(min_window_ms),
            expiry: HashMap::new(),
            by_expiry: BTreeMap::new(),
        }
    }

    pub fn set_bounds(&mut self, min_window_ms: u64, max_window_ms: u64) {
        self.min_window_ms = min_window_ms;
        self.max_window_ms = max_window_ms.max(min_window_ms);
    }

    fn window_for(&self, ttl_ms: u64) -> u64 {
        ttl_ms.clamp(self.min_window_ms, self.max_window_ms)
    }

    /// True the first time `id` is seen inside its window.
    pub fn first_sighting(&mut self, id: &str, ttl_ms: u64, now_ms: u64) -> bool {
        self.evict(now_ms);
        if let Some(&expires) = self.expiry.get(id) {
            if expires > now_ms {
                return false;
            }
        }
        let expires = now_ms.saturating_add(self.window_for(ttl_ms));
        self.expiry.insert(id.to_string(), expires);
        self.by_expiry.entry(expires).or_default().push(id.to_string());
        true
    }

    fn evict(&mut self, now_ms: u64) {
        // Everything with expiry <= now_ms, in expiry order.
        let live = self.by_expiry.split_off(&now_ms.saturating_add(1));
        let expired = std::mem::replace(&mut self.by_expiry, live);
        for (expires, ids) in expired {
            for id in ids {
                if self.expiry.get(&id) == Some(&expires) {
                    self.expiry.remove(&id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

    #[test]
    fn test_duplicate_inside_window() {
        let mut w = DedupWindow::new(1_000, DAY_MS);
        assert!(w.first_sighting("a", 100, 0));
        assert!(!w.first_sighting("a", 100, 500));
        assert!(!w.first_sighting("a", 100, 999));
        assert!(w.first_sighting("a", 100, 1_000));
    }

    #[test]
    fn test_window_is_at_least_ttl() {
        let mut w = DedupWindow::new(10, DAY_MS);
        assert!(w.first_sighting("a", 5_000, 0));
        assert!(!w.first_sighting("a", 5_000, 4_999));
    }

    #[test]
    fn test_eviction_bounds_memory() {
        let mut w = DedupWindow::new(10, DAY_MS);
        for i in 0..100u64 {
            assert!(w.first_sighting(&format!("s{}", i), 0, i * 100));
        }
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_long_ttl_does_not_pin_short_ids() {
        let mut w = DedupWindow::new(10, 2 * DAY_MS);
        assert!(w.first_sighting("long", 365 * DAY_MS, 0));
        for i in 1..=1_000u64 {
            assert!(w.first_sighting(&format!("s{}", i), 0, i * 100));
        }
        // "long" plus the one short id still inside its window.
        assert_eq!(w.len(), 2);
        assert!(!w.first_sighting("long", 0, 1_000 * 100));
    }

    #[test]
    fn test_ttl_is_clamped_to_max_window() {
        let mut w = DedupWindow::new(10, DAY_MS);
        assert!(w.first_sighting("a", 365 * DAY_MS, 0));
        assert!(!w.first_sighting("a", 0, DAY_MS - 1));
        assert!(w.first_sighting("a", 0, DAY_MS));
    }

    #[test]
    fn test_bounds_follow_tuning() {
        let mut w = DedupWindow::new(10, DAY_MS);
        w.set_bounds(10, 1_000);
        assert!(w.first_sighting("a", DAY_MS, 0));
        assert!(w.first_sighting("a", DAY_MS, 1_000));
        assert_eq!(w.len(), 1);
    }
}
