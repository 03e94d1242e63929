use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Execution node identifier. The root execution shares the process instance id.
pub type ExecutionId = Uuid;

/// Activity identifier as declared in a process definition.
pub type ActivityId = String;

/// Process definition identifier (`"{key}:{version}"`).
pub type DefinitionId = String;

pub type SubscriptionId = Uuid;

pub type TimerJobId = Uuid;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

// ─── Boundary event definitions ───────────────────────────────

/// The closed set of boundary event trigger kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Message,
    Signal,
    Timer,
    Error,
    Escalation,
}

impl TriggerKind {
    /// The runtime artifact an execution holds while it waits on this trigger.
    pub fn artifact(self) -> RuntimeArtifact {
        match self {
            TriggerKind::Message | TriggerKind::Signal => RuntimeArtifact::Subscription,
            TriggerKind::Timer => RuntimeArtifact::TimerJob,
            // Resolved by activity-graph lookup at throw time.
            TriggerKind::Error | TriggerKind::Escalation => RuntimeArtifact::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeArtifact {
    Subscription,
    TimerJob,
    None,
}

/// Due expression of a timer boundary event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerSchedule {
    /// Absolute due date.
    Date { due_ms: u64 },
    /// Relative to the moment the host activity is entered.
    Duration { duration_ms: u64 },
    /// Repeating (ISO 8601 `R<n>/PT<duration>`). `max_fires == 0` means unbounded.
    Cycle { interval_ms: u64, max_fires: u32 },
}

/// Trigger-specific payload of a boundary event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryTrigger {
    Message {
        name: String,
    },
    Signal {
        name: String,
    },
    Timer {
        schedule: TimerSchedule,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    Escalation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation_code: Option<String>,
    },
}

impl BoundaryTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            BoundaryTrigger::Message { .. } => TriggerKind::Message,
            BoundaryTrigger::Signal { .. } => TriggerKind::Signal,
            BoundaryTrigger::Timer { .. } => TriggerKind::Timer,
            BoundaryTrigger::Error { .. } => TriggerKind::Error,
            BoundaryTrigger::Escalation { .. } => TriggerKind::Escalation,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryEventDefinition {
    pub id: ActivityId,
    #[serde(default = "default_true")]
    pub interrupting: bool,
    pub trigger: BoundaryTrigger,
}

impl BoundaryEventDefinition {
    pub fn message(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, BoundaryTrigger::Message { name: name.into() })
    }

    pub fn signal(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, BoundaryTrigger::Signal { name: name.into() })
    }

    pub fn timer(id: impl Into<String>, schedule: TimerSchedule) -> Self {
        Self::new(id, BoundaryTrigger::Timer { schedule })
    }

    pub fn error(id: impl Into<String>, error_code: Option<&str>) -> Self {
        Self::new(
            id,
            BoundaryTrigger::Error {
                error_code: error_code.map(str::to_string),
            },
        )
    }

    pub fn escalation(id: impl Into<String>, escalation_code: Option<&str>) -> Self {
        Self::new(
            id,
            BoundaryTrigger::Escalation {
                escalation_code: escalation_code.map(str::to_string),
            },
        )
    }

    fn new(id: impl Into<String>, trigger: BoundaryTrigger) -> Self {
        Self {
            id: id.into(),
            interrupting: true,
            trigger,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.trigger.kind()
    }
}

// ─── Activity ─────────────────────────────────────────────────

/// One node of a process definition's activity graph. Immutable per definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    /// Entering this activity creates a dedicated scope execution.
    pub is_scope: bool,
    /// Enclosing activity (sub process). `None` = the process itself.
    pub parent: Option<ActivityId>,
    pub boundary_events: Vec<BoundaryEventDefinition>,
}

// ─── Execution ────────────────────────────────────────────────

/// A runtime node of the execution tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: Uuid,
    /// `None` only for the root.
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    /// `None` for pure structural executions (fork roots, scope hosts of a child scope).
    pub activity_id: Option<ActivityId>,
    pub process_definition_id: DefinitionId,
}

impl Execution {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// A leaf positioned at an activity.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && self.activity_id.is_some()
    }
}

// ─── Event subscriptions & timer jobs ─────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Message,
    Signal,
}

impl SubscriptionKind {
    pub fn from_trigger(kind: TriggerKind) -> Option<Self> {
        match kind {
            TriggerKind::Message => Some(SubscriptionKind::Message),
            TriggerKind::Signal => Some(SubscriptionKind::Signal),
            TriggerKind::Timer | TriggerKind::Error | TriggerKind::Escalation => None,
        }
    }

    pub fn trigger_kind(self) -> TriggerKind {
        match self {
            SubscriptionKind::Message => TriggerKind::Message,
            SubscriptionKind::Signal => TriggerKind::Signal,
        }
    }
}

/// A message/signal subscription held by the scope execution hosting a boundary event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub process_instance_id: Uuid,
    pub execution_id: ExecutionId,
    /// Boundary event the subscription was created for.
    pub activity_id: ActivityId,
    pub kind: SubscriptionKind,
    /// Message or signal name (the trigger key).
    pub event_name: String,
}

/// A timer registered with the external scheduler for a timer boundary event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerJob {
    pub id: TimerJobId,
    pub process_instance_id: Uuid,
    pub execution_id: ExecutionId,
    pub activity_id: ActivityId,
    pub schedule: TimerSchedule,
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Completed { at: Timestamp },
    Cancelled { reason: String, at: Timestamp },
}

impl ProcessState {
    /// Returns true if the process is in a terminal state (no further progress possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed { .. } | ProcessState::Cancelled { .. }
        )
    }
}

/// Instance-level record: which definition the tree is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub process_definition_id: DefinitionId,
    pub state: ProcessState,
    /// Optimistic concurrency token. `commit_migration` bumps it; the
    /// per-table `save_*` writes do not, so any other writer that must
    /// invalidate an in-flight migration saves the instance with a bumped
    /// revision.
    pub revision: u64,
    /// Fingerprint of the last migration plan applied to this instance.
    pub last_migration: Option<String>,
    pub created_at: Timestamp,
}

// ─── Migration step state machine ─────────────────────────────

/// Phase of a migration step for one process instance.
///
/// `Running(source) → Matching → Reconciling → Applying → Running(target)`;
/// a failure in any intermediate phase returns to `Running(source)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Running { definition_id: DefinitionId },
    Matching,
    Reconciling,
    Applying,
}

impl MigrationPhase {
    pub fn can_transition_to(&self, next: &MigrationPhase) -> bool {
        matches!(
            (self, next),
            (MigrationPhase::Running { .. }, MigrationPhase::Matching)
                | (MigrationPhase::Matching, MigrationPhase::Reconciling)
                | (MigrationPhase::Reconciling, MigrationPhase::Applying)
                | (MigrationPhase::Matching, MigrationPhase::Running { .. })
                | (MigrationPhase::Reconciling, MigrationPhase::Running { .. })
                | (MigrationPhase::Applying, MigrationPhase::Running { .. })
        )
    }
}

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
