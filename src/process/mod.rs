// Process module - Instance lifecycle, restart policy, resource monitoring and supervision

mod manager;
pub mod monitor;
pub mod restart;
pub mod spawner;
mod supervisor;
mod types;

pub use manager::{InstanceManager, LiveInstance, StartSummary};
pub use monitor::{ResourceMonitor, UsageSample};
pub use restart::{BackoffStrategy, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_instance, SpawnedInstance};
pub use supervisor::{ReloadReport, StopSummary, Supervisor, SupervisorOptions, Target};
pub use types::{
    ExitCause, ExitEvent, ExitOutcome, Instance, InstanceId, InstanceSnapshot, InstanceState,
    SupervisorEvent,
};
