//! Pipeline engine: per-workflow phases, record processors and the tick
//! scheduler.

pub mod guard;
pub mod pipeline;
pub mod processor;
pub mod scheduler;

pub use guard::{PhaseGuard, PhaseGuards, PhaseToken};
pub use pipeline::{
    AlertReport, Collaborators, Phase, Pipeline, PipelineSettings, ProcessReport, SkippedRecord,
    StageReport, TickReport,
};
pub use processor::{HookProcessor, RecordProcessor, Rejection};
pub use scheduler::Scheduler;
