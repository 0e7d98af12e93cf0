//! Concurrency building blocks shared by the workspace manager.

pub mod observable;
pub mod tasks;
pub mod trigger;

pub use observable::{ObservableCell, ObservableCellBuilder};
pub use tasks::{ReusableTasks, TaskFailure, TaskHandle, TaskResult, TaskState};
pub use trigger::Trigger;
