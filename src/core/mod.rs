pub mod audit;
pub mod clock;
pub mod engine;
pub mod mirror;
pub mod naming;
pub mod outcome;
pub mod resolver;
pub mod retry;

pub use audit::{AuditEntry, AuditLog};
pub use clock::{Clock, Sleeper, SystemClock, TokioSleeper};
pub use engine::{
    OrchestratorConfig, RecordReport, RecordSelection, RunReport, RunSummary,
    TransferOrchestrator,
};
pub use mirror::{AttemptOutcome, AttemptTarget, TransferAttempt, TransferError, TreeMirror};
pub use naming::{collision_name, NamingError, NamingPolicy};
pub use outcome::{OutcomeAggregator, RecordProgress, RecordResult, RecordStatus};
pub use resolver::{DirectoryResolver, ResolutionError, ResolvedFolder};
pub use retry::{decide, CallError, Decision, RetryExecutor, RetryPolicy};
