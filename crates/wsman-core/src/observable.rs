//! Shared value with change listeners.
//!
//! Updates are compare-and-swap against a version counter: the update closure
//! runs outside the lock and the write is retried if another writer got in
//! first. Listeners are fixed at construction and run synchronously after each
//! successful change. A panicking listener is logged and skipped; the stored
//! value is never rolled back.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

pub struct ObservableCell<T> {
    state: Mutex<Versioned<T>>,
    listeners: Vec<Listener<T>>,
}

pub struct ObservableCellBuilder<T> {
    initial: T,
    listeners: Vec<Listener<T>>,
}

impl<T> ObservableCellBuilder<T> {
    pub fn on_change(mut self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn build(self) -> ObservableCell<T> {
        ObservableCell {
            state: Mutex::new(Versioned {
                version: 0,
                value: Arc::new(self.initial),
            }),
            listeners: self.listeners,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableCell")
            .field("value", &self.get())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<T> ObservableCell<T> {
    pub fn builder(initial: T) -> ObservableCellBuilder<T> {
        ObservableCellBuilder {
            initial,
            listeners: Vec::new(),
        }
    }

    pub fn new(initial: T) -> Self {
        Self::builder(initial).build()
    }

    pub fn get(&self) -> Arc<T> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .value
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).version
    }

    fn snapshot(&self) -> (u64, Arc<T>) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.version, state.value.clone())
    }

    fn notify(&self, old: &T, new: &T) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(old, new)));
            if outcome.is_err() {
                tracing::warn!(listener = index, "observable listener panicked");
            }
        }
    }
}

impl<T: PartialEq> ObservableCell<T> {
    /// Applies `f` to the current value. Returns `false` (and notifies nobody)
    /// when the result equals the current value.
    pub fn update(&self, f: impl Fn(&T) -> T) -> bool {
        loop {
            let (version, current) = self.snapshot();
            let next = f(&current);
            if next == *current {
                return false;
            }
            let next = Arc::new(next);
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.version != version {
                    continue;
                }
                state.version += 1;
                state.value = next.clone();
            }
            self.notify(&current, &next);
            return true;
        }
    }

    pub fn set(&self, value: T) -> bool
    where
        T: Clone,
    {
        self.update(|_| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_see_old_and_new() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cell = ObservableCell::builder(1)
            .on_change(move |old, new| sink.lock().unwrap().push((*old, *new)))
            .build();

        assert!(cell.update(|v| v + 1));
        assert!(!cell.update(|v| *v));
        assert!(cell.set(10));
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 10)]);
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn panicking_listener_does_not_corrupt_the_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = ObservableCell::builder(BTreeSet::<String>::new())
            .on_change(|_, _| panic!("listener failure"))
            .on_change(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(cell.update(|set| {
            let mut set = set.clone();
            set.insert("wsinst-a".to_string());
            set
        }));
        assert!(cell.get().contains("wsinst-a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let cell = Arc::new(ObservableCell::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cell.update(|v| v + 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*cell.get(), 800);
    }
}
