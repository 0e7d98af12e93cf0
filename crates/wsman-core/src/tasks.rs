//! Launch-once, await-many units of work.
//!
//! A [`TaskHandle`] wraps a single asynchronous computation. The computation is
//! started at most once (on the first [`TaskHandle::launch`] or
//! [`TaskHandle::await_result`]) and every awaiter observes the same result.
//! [`ReusableTasks`] keys handles so that concurrent callers asking for the same
//! work share one execution and later callers get the cached outcome.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex},
};

use futures_util::FutureExt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Active,
    Completed,
    Cancelled,
    Unknown,
}

/// Failure captured from a unit of work. Cheap to clone so it can be replayed
/// to every awaiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: Arc<str>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type TaskResult<R> = Result<R, TaskFailure>;

type Work<R> = Pin<Box<dyn Future<Output = anyhow::Result<R>> + Send + 'static>>;

enum Phase<R> {
    Created(Work<R>),
    Active,
    Finished(TaskState),
}

struct Shared<R> {
    phase: Mutex<Phase<R>>,
    result: watch::Sender<Option<TaskResult<R>>>,
}

impl<R> Shared<R> {
    fn publish(&self, state: TaskState, result: TaskResult<R>) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = Phase::Finished(state);
        self.result.send_replace(Some(result));
    }
}

/// Publishes `Unknown` if the driver future is dropped before it reports.
struct PublishGuard<R> {
    shared: Option<Arc<Shared<R>>>,
}

impl<R> PublishGuard<R> {
    fn complete(mut self, result: TaskResult<R>) {
        if let Some(shared) = self.shared.take() {
            shared.publish(TaskState::Completed, result);
        }
    }
}

impl<R> Drop for PublishGuard<R> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.publish(
                TaskState::Unknown,
                Err(TaskFailure::new("task was dropped before completion")),
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

pub struct TaskHandle<K, R> {
    key: K,
    shared: Arc<Shared<R>>,
}

impl<K: Clone, R> Clone for TaskHandle<K, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<K: std::fmt::Debug, R> std::fmt::Debug for TaskHandle<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl<K, R> TaskHandle<K, R> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        match &*self.shared.phase.lock().unwrap_or_else(|e| e.into_inner()) {
            Phase::Created(_) => TaskState::Created,
            Phase::Active => TaskState::Active,
            Phase::Finished(state) => *state,
        }
    }

    /// Cancels the handle if it was never launched. Work that already started
    /// always runs to completion.
    pub fn cancel(&self) -> bool {
        let mut phase = self.shared.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*phase, Phase::Created(_)) {
            return false;
        }
        *phase = Phase::Finished(TaskState::Cancelled);
        drop(phase);
        self.shared
            .result
            .send_replace(Some(Err(TaskFailure::new("task was cancelled"))));
        true
    }
}

impl<K, R> TaskHandle<K, R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new<F>(key: K, work: F) -> Self
    where
        F: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let (result, _) = watch::channel(None);
        Self {
            key,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Created(Box::pin(work))),
                result,
            }),
        }
    }

    /// Starts the work. Returns `true` only for the call that actually started it.
    pub fn launch(&self) -> bool {
        let work = {
            let mut phase = self.shared.phase.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *phase, Phase::Active) {
                Phase::Created(work) => work,
                other => {
                    *phase = other;
                    return false;
                }
            }
        };

        let guard = PublishGuard {
            shared: Some(self.shared.clone()),
        };
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(work).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskFailure::new(format!("{e:#}"))),
                Err(panic) => Err(TaskFailure::new(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            guard.complete(result);
        });
        true
    }

    /// The outcome, if the task already finished.
    pub fn try_result(&self) -> Option<TaskResult<R>> {
        self.shared.result.borrow().clone()
    }

    /// Launches the task if needed and waits for its outcome.
    pub async fn await_result(&self) -> TaskResult<R> {
        self.launch();
        let mut rx = self.shared.result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| Err(TaskFailure::new("task result missing"))),
            Err(_) => Err(TaskFailure::new("task result channel closed")),
        }
    }
}

/// Registry guaranteeing at most one live, non-cancelled handle per key.
pub struct ReusableTasks<K, R> {
    tasks: Mutex<HashMap<K, TaskHandle<K, R>>>,
}

impl<K, R> Default for ReusableTasks<K, R> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, R> ReusableTasks<K, R>
where
    K: Clone + Eq + Hash,
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing handle for `key`, or builds one from `factory`.
    /// The factory only constructs the future; nothing runs until launch.
    pub fn get_or_create<F, Fut>(&self, key: K, factory: F) -> TaskHandle<K, R>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tasks.get(&key)
            && existing.state() != TaskState::Cancelled
        {
            return existing.clone();
        }
        let handle = TaskHandle::new(key.clone(), factory(&key));
        tasks.insert(key, handle.clone());
        handle
    }

    pub fn get(&self, key: &K) -> Option<TaskHandle<K, R>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Drops the cached handle so the next `get_or_create` starts over.
    /// Awaiters already holding the old handle still get its result.
    pub fn invalidate(&self, key: &K) -> Option<TaskHandle<K, R>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<TaskHandle<K, R>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_awaiters_share_one_execution() {
        let tasks: Arc<ReusableTasks<String, u32>> = Arc::new(ReusableTasks::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let make = |tasks: Arc<ReusableTasks<String, u32>>,
                    runs: Arc<AtomicUsize>,
                    factory_calls: Arc<AtomicUsize>| async move {
            let handle = tasks.get_or_create("build".to_string(), |_| {
                factory_calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42)
                }
            });
            handle.await_result().await
        };

        let a = tokio::spawn(make(tasks.clone(), runs.clone(), factory_calls.clone()));
        let b = tokio::spawn(make(tasks.clone(), runs.clone(), factory_calls.clone()));
        assert_eq!(a.await.unwrap(), Ok(42));
        assert_eq!(b.await.unwrap(), Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let third = make(tasks.clone(), runs.clone(), factory_calls.clone()).await;
        assert_eq!(third, Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_replayed_until_invalidated() {
        let tasks: ReusableTasks<&'static str, u32> = ReusableTasks::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            let handle = tasks.get_or_create("import", move |_| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("remote unreachable"))
            });
            let err = handle.await_result().await.unwrap_err();
            assert_eq!(err.message(), "remote unreachable");
            assert_eq!(handle.state(), TaskState::Completed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(tasks.invalidate(&"import").is_some());
        let handle = tasks.get_or_create("import", |_| async { Ok(7) });
        assert_eq!(handle.await_result().await, Ok(7));
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let handle: TaskHandle<u8, u8> = TaskHandle::new(1, async {
            if true {
                panic!("boom");
            }
            Ok(0)
        });
        let err = handle.await_result().await.unwrap_err();
        assert!(err.message().contains("boom"), "{err}");
        assert_eq!(handle.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn launch_is_idempotent() {
        let handle: TaskHandle<u8, u8> = TaskHandle::new(1, async { Ok(3) });
        assert_eq!(handle.state(), TaskState::Created);
        assert!(handle.try_result().is_none());
        assert!(handle.launch());
        assert!(!handle.launch());
        assert_eq!(handle.await_result().await, Ok(3));
        assert_eq!(handle.try_result(), Some(Ok(3)));
    }

    #[tokio::test]
    async fn cancelled_handles_are_replaced() {
        let tasks: ReusableTasks<u8, &'static str> = ReusableTasks::new();
        let first = tasks.get_or_create(1, |_| async { Ok("first") });
        assert!(first.cancel());
        assert_eq!(first.state(), TaskState::Cancelled);
        assert!(first.await_result().await.is_err());

        let second = tasks.get_or_create(1, |_| async { Ok("second") });
        assert_eq!(second.await_result().await, Ok("second"));
        assert!(!second.cancel());
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_the_running_work() {
        let handle: TaskHandle<u8, u8> = TaskHandle::new(1, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        });
        handle.launch();
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), TaskState::Active);
        assert_eq!(handle.await_result().await, Ok(1));
        assert_eq!(handle.state(), TaskState::Completed);
    }
}
