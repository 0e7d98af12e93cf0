//! Single-slot, latest-wins wake-up channel.
//!
//! Firing overwrites whatever is pending instead of queueing behind it, so any
//! burst of fires between two `wait()` calls collapses into one wake-up that
//! carries the most recent value.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct Trigger<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Trigger<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T> Trigger<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any pending one. Returns `true` if nothing was
    /// pending before.
    pub fn fire(&self, value: T) -> bool {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(value);
        self.notify.notify_one();
        previous.is_none()
    }

    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Waits until a value is pending and takes it.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.try_take() {
                return value;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn bursts_collapse_into_the_latest_value() {
        let trigger = Trigger::new();
        assert!(trigger.fire(1));
        for i in 2..=100 {
            assert!(!trigger.fire(i));
        }
        assert_eq!(trigger.try_take(), Some(100));
        assert_eq!(trigger.try_take(), None);
        assert!(!trigger.is_pending());
    }

    #[tokio::test]
    async fn fire_before_wait_is_not_lost() {
        let trigger = Trigger::new();
        trigger.fire("dirty");
        assert_eq!(trigger.wait().await, "dirty");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_wakes_a_waiter_once() {
        let trigger = Arc::new(Trigger::new());
        for i in 0..10 {
            trigger.fire(i);
        }

        let waiter = trigger.clone();
        let first = tokio::spawn(async move { waiter.wait().await });
        assert_eq!(first.await.unwrap(), 9);

        let waiter = trigger.clone();
        let second = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(1), waiter.wait()).await
        });
        assert!(second.await.unwrap().is_err(), "no backlog may remain");
    }

    #[tokio::test]
    async fn waiter_receives_a_later_fire() {
        let trigger = Arc::new(Trigger::new());
        let waiter = trigger.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        trigger.fire(5u8);
        assert_eq!(handle.await.unwrap(), 5);
    }
}
