use crate::events::MigrationEvent;
use crate::store::{CommitOutcome, MigrationCommit, MigrationStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct InstanceRows {
    executions: BTreeMap<ExecutionId, Execution>,
    subscriptions: BTreeMap<SubscriptionId, EventSubscription>,
    timer_jobs: BTreeMap<TimerJobId, TimerJob>,
    events: Vec<MigrationEvent>,
}

/// In-memory store for tests and the CLI. One lock guards all instances so a
/// commit is observed entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<Uuid, ProcessInstance>>,
    rows: RwLock<HashMap<Uuid, InstanceRows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().map(|i| i.len()).unwrap_or_default()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    // ── Instance ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let mut instances = self.instances.write().map_err(|e| anyhow!("Lock: {}", e))?;
        instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let instances = self.instances.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(instances.get(&id).cloned())
    }

    // ── Executions ──

    async fn save_executions(&self, instance_id: Uuid, executions: &[Execution]) -> Result<()> {
        let mut rows = self.rows.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let entry = rows.entry(instance_id).or_default();
        entry.executions = executions.iter().map(|e| (e.id, e.clone())).collect();
        Ok(())
    }

    async fn load_executions(&self, instance_id: Uuid) -> Result<Vec<Execution>> {
        let rows = self.rows.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows
            .get(&instance_id)
            .map(|r| r.executions.values().cloned().collect())
            .unwrap_or_default())
    }

    // ── Event subscriptions ──

    async fn save_subscription(&self, subscription: &EventSubscription) -> Result<()> {
        let mut rows = self.rows.write().map_err(|e| anyhow!("Lock: {}", e))?;
        rows.entry(subscription.process_instance_id)
            .or_default()
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn load_subscriptions(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>> {
        let rows = self.rows.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows
            .get(&instance_id)
            .map(|r| r.subscriptions.values().cloned().collect())
            .unwrap_or_default())
    }

    // ── Timer jobs ──

    async fn save_timer_job(&self, job: &TimerJob) -> Result<()> {
        let mut rows = self.rows.write().map_err(|e| anyhow!("Lock: {}", e))?;
        rows.entry(job.process_instance_id)
            .or_default()
            .timer_jobs
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn load_timer_jobs(&self, instance_id: Uuid) -> Result<Vec<TimerJob>> {
        let rows = self.rows.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows
            .get(&instance_id)
            .map(|r| r.timer_jobs.values().cloned().collect())
            .unwrap_or_default())
    }

    // ── Migration ──

    async fn commit_migration(
        &self,
        instance_id: Uuid,
        expected_revision: u64,
        commit: MigrationCommit,
    ) -> Result<CommitOutcome> {
        let mut instances = self.instances.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut rows = self.rows.write().map_err(|e| anyhow!("Lock: {}", e))?;

        let instance = instances
            .get_mut(&instance_id)
            .ok_or_else(|| anyhow!("Unknown process instance: {}", instance_id))?;
        if instance.revision != expected_revision {
            return Ok(CommitOutcome::RevisionConflict {
                actual: instance.revision,
            });
        }

        let entry = rows.entry(instance_id).or_default();
        entry.executions = commit.executions.into_iter().map(|e| (e.id, e)).collect();
        entry.subscriptions = commit
            .subscriptions
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        entry.timer_jobs = commit.timer_jobs.into_iter().map(|j| (j.id, j)).collect();
        entry.events.extend(commit.events);

        instance.process_definition_id = commit.process_definition_id;
        instance.last_migration = Some(commit.plan_fingerprint);
        instance.revision += 1;
        Ok(CommitOutcome::Committed {
            revision: instance.revision,
        })
    }

    // ── Audit ──

    async fn append_events(&self, instance_id: Uuid, events: &[MigrationEvent]) -> Result<()> {
        let mut rows = self.rows.write().map_err(|e| anyhow!("Lock: {}", e))?;
        rows.entry(instance_id)
            .or_default()
            .events
            .extend_from_slice(events);
        Ok(())
    }

    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<MigrationEvent>> {
        let rows = self.rows.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(rows
            .get(&instance_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }
}
