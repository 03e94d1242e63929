use crate::plan::PlanError;
use crate::scheduler::SchedulerError;
use crate::tree::TreeError;
use crate::types::*;
use uuid::Uuid;

/// Failure of one migration step. Every variant leaves the instance bound to
/// its source definition with its stored state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Execution {execution_id} is active at unmapped activity {activity_id}")]
    UnmappedActiveActivity {
        execution_id: ExecutionId,
        activity_id: ActivityId,
    },

    #[error("Unsupported shape change: {0}")]
    UnsupportedShapeChange(String),

    #[error("Timer scheduler unavailable: {0}")]
    SchedulerUnavailable(#[source] SchedulerError),

    #[error("Inconsistent execution tree: {0}")]
    InconsistentTreeInvariant(String),

    #[error("Invalid migration plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Unknown process instance: {0}")]
    UnknownInstance(Uuid),

    #[error("Unknown process definition: {0}")]
    UnknownDefinition(DefinitionId),

    #[error("Instance {instance_id} is bound to {actual}, plan expects {expected}")]
    DefinitionMismatch {
        instance_id: Uuid,
        expected: DefinitionId,
        actual: DefinitionId,
    },

    #[error("Process instance {0} is not running")]
    NotRunning(Uuid),

    #[error("Process instance {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<TreeError> for MigrationError {
    fn from(e: TreeError) -> Self {
        MigrationError::InconsistentTreeInvariant(e.to_string())
    }
}

impl MigrationError {
    /// The step may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::SchedulerUnavailable(_) | MigrationError::ConcurrentModification(_)
        )
    }
}
