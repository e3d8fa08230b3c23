//! Pipeline runtime: runs stage workers in order, hands their output on as
//! stored artifacts, and folds question-bearing output into the working set.

pub mod coordinator;
pub mod reconcile;
pub mod worker;

pub use coordinator::{
    Coordinator, FailureReason, InputSelection, PipelineConfig, RunReport, RunRequest, StageEvent,
    StageOutcome, StageState,
};
pub use reconcile::{ReconcileEngine, ReconcileError, ReconcileReport};
pub use worker::{MediaRef, StageInput, StageWorker, WorkerError};
