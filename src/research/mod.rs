//! The research pipeline: task records, their store, step executors, the
//! supervisor that drives them and the progress notifier.

mod notifier;
pub mod steps;
pub mod store;
mod supervisor;
pub mod task;

pub use notifier::{ProgressEvent, ProgressNotifier, ProgressPhase};
pub use store::{SqliteTaskStore, StoreError, TaskStore};
pub use supervisor::{ResearchError, StopAck, Supervisor, DEFAULT_STALE_LOCK_AFTER};
pub use task::{
    DerivedState, FailureReason, ResearchTask, Step, StepFailure, StepState, StepStatus,
    TaskHandle, STEP_TOTAL,
};
