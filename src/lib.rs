pub mod arbiter;
pub mod config;
pub mod error;
pub mod host;
pub mod inventory;
pub mod mapping;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod trust;

pub use error::{CaravanError, ConnectFailure};

pub type Result<T> = std::result::Result<T, CaravanError>;

// Convenience re-exports for the orchestration surface
pub use inventory::{ComputeUnit, RunState, UnitKind};
pub use mapping::{BridgeTarget, IdTarget, StorageTarget, TargetResources, UnitMapping};
pub use orchestrator::{MigrationOptions, MigrationRequest, Orchestrator, UnitSpec};
pub use registry::{MigrationTask, Step, StepStatus, TaskStatus};
pub use scheduler::{JobKind, ScheduledJob, Scheduler, Trigger};
