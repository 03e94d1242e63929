use crate::types::*;
use serde::{Deserialize, Serialize};

/// Audit trail of a migration step, appended through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MigrationEvent {
    MigrationStarted {
        source_definition_id: DefinitionId,
        target_definition_id: DefinitionId,
        plan_fingerprint: String,
        at: Timestamp,
    },
    PhaseEntered {
        phase: MigrationPhase,
    },

    // ── Executions ──
    ExecutionReused {
        execution_id: ExecutionId,
        activity_id: Option<ActivityId>,
    },
    ExecutionCreated {
        execution_id: ExecutionId,
        activity_id: Option<ActivityId>,
    },
    ExecutionRemoved {
        execution_id: ExecutionId,
        activity_id: Option<ActivityId>,
    },

    // ── Event subscriptions ──
    SubscriptionRetained {
        subscription_id: SubscriptionId,
        activity_id: ActivityId,
    },
    SubscriptionCreated {
        subscription_id: SubscriptionId,
        activity_id: ActivityId,
    },
    SubscriptionRemoved {
        subscription_id: SubscriptionId,
        activity_id: ActivityId,
    },

    // ── Timer jobs ──
    TimerRetained {
        timer_job_id: TimerJobId,
        activity_id: ActivityId,
    },
    TimerScheduled {
        timer_job_id: TimerJobId,
        activity_id: ActivityId,
    },
    TimerCancelled {
        timer_job_id: TimerJobId,
        activity_id: ActivityId,
    },

    MigrationCompleted {
        target_definition_id: DefinitionId,
        revision: u64,
        at: Timestamp,
    },
    MigrationFailed {
        plan_fingerprint: String,
        error: String,
        at: Timestamp,
    },
}

impl MigrationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationEvent::MigrationCompleted { .. } | MigrationEvent::MigrationFailed { .. }
        )
    }
}
