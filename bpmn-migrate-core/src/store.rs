use crate::error::MigrationError;
use crate::events::MigrationEvent;
use crate::tree::ExecutionTree;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Everything a migration step writes, applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCommit {
    pub process_definition_id: DefinitionId,
    pub plan_fingerprint: String,
    /// Replaces every execution of the instance.
    pub executions: Vec<Execution>,
    /// Replaces every event subscription of the instance.
    pub subscriptions: Vec<EventSubscription>,
    /// Replaces every timer job of the instance.
    pub timer_jobs: Vec<TimerJob>,
    pub events: Vec<MigrationEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { revision: u64 },
    RevisionConflict { actual: u64 },
}

/// Persistence for process instances under migration. Every read and write
/// is keyed by process instance id.
///
/// Only `commit_migration` checks and bumps `ProcessInstance::revision`. The
/// `save_*` methods write rows as given and leave the revision alone.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    // ── Instance ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;

    // ── Executions ──

    async fn save_executions(&self, instance_id: Uuid, executions: &[Execution]) -> Result<()>;
    async fn load_executions(&self, instance_id: Uuid) -> Result<Vec<Execution>>;

    // ── Event subscriptions ──

    async fn save_subscription(&self, subscription: &EventSubscription) -> Result<()>;
    async fn load_subscriptions(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>>;

    // ── Timer jobs ──

    async fn save_timer_job(&self, job: &TimerJob) -> Result<()>;
    async fn load_timer_jobs(&self, instance_id: Uuid) -> Result<Vec<TimerJob>>;

    // ── Migration ──

    /// Apply `commit` atomically if the instance is still at
    /// `expected_revision`; bumps the revision and rebinds the instance.
    async fn commit_migration(
        &self,
        instance_id: Uuid,
        expected_revision: u64,
        commit: MigrationCommit,
    ) -> Result<CommitOutcome>;

    // ── Audit ──

    async fn append_events(&self, instance_id: Uuid, events: &[MigrationEvent]) -> Result<()>;
    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<MigrationEvent>>;
}

/// Consistent read of one instance's migration-relevant state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub instance: ProcessInstance,
    pub tree: ExecutionTree,
    pub subscriptions: Vec<EventSubscription>,
    pub timer_jobs: Vec<TimerJob>,
}

pub async fn load_snapshot(
    store: &dyn MigrationStore,
    instance_id: Uuid,
) -> Result<InstanceSnapshot, MigrationError> {
    let instance = store
        .load_instance(instance_id)
        .await?
        .ok_or(MigrationError::UnknownInstance(instance_id))?;
    let tree = ExecutionTree::from_executions(store.load_executions(instance_id).await?)?;
    if tree.process_instance_id() != instance_id {
        return Err(MigrationError::InconsistentTreeInvariant(format!(
            "executions of {instance_id} are rooted at {}",
            tree.process_instance_id()
        )));
    }
    let subscriptions = store.load_subscriptions(instance_id).await?;
    let timer_jobs = store.load_timer_jobs(instance_id).await?;
    Ok(InstanceSnapshot {
        instance,
        tree,
        subscriptions,
        timer_jobs,
    })
}
