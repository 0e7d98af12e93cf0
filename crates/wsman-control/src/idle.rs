use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use wsman_model::InstanceName;

/// Last-touched timestamps per instance.
///
/// An instance that was never touched is never considered timed out.
#[derive(Debug, Default)]
pub struct IdleTracker {
    touched: Mutex<HashMap<InstanceName, Instant>>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, instance: &InstanceName) {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.clone(), Instant::now());
    }

    pub fn last_touched(&self, instance: &InstanceName) -> Option<Instant> {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance)
            .copied()
    }

    pub fn is_timed_out(&self, instance: &InstanceName, ttl: Duration) -> bool {
        self.last_touched(instance)
            .is_some_and(|at| at.elapsed() > ttl)
    }

    pub fn forget(&self, instance: &InstanceName) {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance);
    }

    /// Drops every entry for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&InstanceName) -> bool) {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| keep(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> InstanceName {
        InstanceName(s.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_only_after_ttl() {
        let tracker = IdleTracker::new();
        let a = name("a");
        assert!(!tracker.is_timed_out(&a, Duration::from_secs(1)));

        tracker.touch(&a);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!tracker.is_timed_out(&a, Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(tracker.is_timed_out(&a, Duration::from_secs(60)));

        tracker.touch(&a);
        assert!(!tracker.is_timed_out(&a, Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_instances_are_not_timed_out() {
        let tracker = IdleTracker::new();
        tracker.touch(&name("a"));
        tracker.touch(&name("b"));
        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.forget(&name("a"));
        tracker.retain(|n| n.as_str() != "b");
        assert!(!tracker.is_timed_out(&name("a"), Duration::from_secs(1)));
        assert!(tracker.last_touched(&name("b")).is_none());
    }
}
