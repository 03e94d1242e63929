//! Migration engine: the entry point that migrates live process instances
//! from one definition to another.

use crate::activity_tree::{project, ActivityInstance};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::events::MigrationEvent;
use crate::executor::MigrationExecutor;
use crate::matcher::{MigrationInstanceTree, MigrationMatcher, Resolution};
use crate::model::ProcessModel;
use crate::plan::MigrationPlan;
use crate::reconcile::{EventReconciler, ReconciliationDelta};
use crate::scheduler::TimerScheduler;
use crate::store::{load_snapshot, InstanceSnapshot, MigrationStore};
use crate::types::*;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Outcome of one migration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub process_instance_id: Uuid,
    pub target_definition_id: DefinitionId,
    pub plan_fingerprint: String,
    /// The plan had already been applied; nothing changed.
    pub already_applied: bool,
    pub phases: Vec<MigrationPhase>,
    pub revision: u64,
    pub reused_executions: usize,
    pub created_executions: usize,
    pub removed_executions: usize,
    pub delta: ReconciliationDelta,
    pub scheduled_timers: Vec<TimerJob>,
}

/// One async mutex per process instance; steps on distinct instances never
/// wait on each other. An entry lives only while a step holds or awaits it.
#[derive(Default)]
struct InstanceLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    async fn acquire(&self, instance_id: Uuid) -> Result<InstanceGuard<'_>, MigrationError> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .map_err(|e| MigrationError::Store(anyhow!("Lock: {}", e)))?;
            locks.entry(instance_id).or_default().clone()
        };
        Ok(InstanceGuard {
            locks: self,
            instance_id,
            guard: Some(lock.lock_owned().await),
        })
    }

    fn release(&self, instance_id: Uuid) {
        if let Ok(mut locks) = self.inner.lock() {
            if locks
                .get(&instance_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&instance_id);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|l| l.len()).unwrap_or_default()
    }
}

struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.instance_id);
    }
}

/// Phase bookkeeping for one step.
struct PhaseTracker {
    instance_id: Uuid,
    current: MigrationPhase,
    visited: Vec<MigrationPhase>,
}

impl PhaseTracker {
    fn new(instance_id: Uuid, definition_id: &str) -> Self {
        let start = MigrationPhase::Running {
            definition_id: definition_id.to_string(),
        };
        Self {
            instance_id,
            current: start.clone(),
            visited: vec![start],
        }
    }

    fn enter(&mut self, next: MigrationPhase) -> Result<(), MigrationError> {
        if !self.current.can_transition_to(&next) {
            return Err(MigrationError::InconsistentTreeInvariant(format!(
                "illegal phase transition {:?} -> {:?}",
                self.current, next
            )));
        }
        tracing::debug!(process_instance_id = %self.instance_id, phase = ?next, "Migration phase");
        self.current = next.clone();
        self.visited.push(next);
        Ok(())
    }
}

pub struct MigrationEngine {
    store: Arc<dyn MigrationStore>,
    scheduler: Arc<dyn TimerScheduler>,
    definitions: HashMap<DefinitionId, Arc<dyn ProcessModel>>,
    config: MigrationConfig,
    locks: InstanceLocks,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        scheduler: Arc<dyn TimerScheduler>,
        definitions: Vec<Arc<dyn ProcessModel>>,
        config: MigrationConfig,
    ) -> Self {
        let definitions = definitions
            .into_iter()
            .map(|d| (d.definition_id().to_string(), d))
            .collect();
        Self {
            store,
            scheduler,
            definitions,
            config,
            locks: InstanceLocks::default(),
        }
    }

    pub fn register_definition(&mut self, definition: Arc<dyn ProcessModel>) {
        self.definitions
            .insert(definition.definition_id().to_string(), definition);
    }

    pub fn definition(&self, definition_id: &str) -> Result<&dyn ProcessModel, MigrationError> {
        self.definitions
            .get(definition_id)
            .map(|d| d.as_ref())
            .ok_or_else(|| MigrationError::UnknownDefinition(definition_id.to_string()))
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub async fn snapshot(&self, instance_id: Uuid) -> Result<InstanceSnapshot, MigrationError> {
        load_snapshot(self.store.as_ref(), instance_id).await
    }

    pub async fn activity_instance_tree(
        &self,
        instance_id: Uuid,
    ) -> Result<ActivityInstance, MigrationError> {
        let snapshot = self.snapshot(instance_id).await?;
        let model = self.definition(&snapshot.instance.process_definition_id)?;
        Ok(project(&snapshot.tree, model)?)
    }

    /// Migrate one instance. Either the instance ends bound to the plan's
    /// target with its tree, subscriptions and timers rewritten, or it keeps
    /// every piece of stored state it had.
    pub async fn migrate(
        &self,
        instance_id: Uuid,
        plan: &MigrationPlan,
    ) -> Result<MigrationReport, MigrationError> {
        let _guard = self.locks.acquire(instance_id).await?;
        let snapshot = self.snapshot(instance_id).await?;
        let fingerprint = plan.fingerprint();
        let instance = &snapshot.instance;

        if instance.state.is_terminal() {
            return Err(MigrationError::NotRunning(instance_id));
        }
        if instance.process_definition_id == plan.target_definition_id()
            && instance.last_migration.as_deref() == Some(fingerprint.as_str())
        {
            tracing::info!(
                process_instance_id = %instance_id,
                plan_fingerprint = %fingerprint,
                "Migration already applied"
            );
            return Ok(MigrationReport {
                process_instance_id: instance_id,
                target_definition_id: instance.process_definition_id.clone(),
                plan_fingerprint: fingerprint,
                already_applied: true,
                phases: vec![MigrationPhase::Running {
                    definition_id: instance.process_definition_id.clone(),
                }],
                revision: instance.revision,
                reused_executions: snapshot.tree.len(),
                created_executions: 0,
                removed_executions: 0,
                delta: ReconciliationDelta::default(),
                scheduled_timers: Vec::new(),
            });
        }
        if instance.process_definition_id != plan.source_definition_id() {
            return Err(MigrationError::DefinitionMismatch {
                instance_id,
                expected: plan.source_definition_id().to_string(),
                actual: instance.process_definition_id.clone(),
            });
        }

        let source = self.definition(plan.source_definition_id())?;
        let target = self.definition(plan.target_definition_id())?;
        plan.validate(source, target)?;

        tracing::info!(
            process_instance_id = %instance_id,
            source_definition_id = %plan.source_definition_id(),
            target_definition_id = %plan.target_definition_id(),
            plan_fingerprint = %fingerprint,
            "Migrating process instance"
        );
        let mut phases = PhaseTracker::new(instance_id, plan.source_definition_id());
        match self
            .run(&snapshot, plan, source, target, &fingerprint, &mut phases)
            .await
        {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(
                    process_instance_id = %instance_id,
                    phase = ?phases.current,
                    error = %e,
                    "Migration failed"
                );
                if self.config.record_events {
                    let failed = MigrationEvent::MigrationFailed {
                        plan_fingerprint: fingerprint,
                        error: e.to_string(),
                        at: now_ms(),
                    };
                    if let Err(store_err) = self.store.append_events(instance_id, &[failed]).await {
                        tracing::warn!(
                            process_instance_id = %instance_id,
                            error = %store_err,
                            "Failed to record migration failure"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Migrate several instances concurrently. Each result is independent.
    pub async fn migrate_batch(
        &self,
        instance_ids: &[Uuid],
        plan: &MigrationPlan,
    ) -> Vec<(Uuid, Result<MigrationReport, MigrationError>)> {
        futures::future::join_all(
            instance_ids
                .iter()
                .map(|id| async move { (*id, self.migrate(*id, plan).await) }),
        )
        .await
    }

    async fn run(
        &self,
        snapshot: &InstanceSnapshot,
        plan: &MigrationPlan,
        source: &dyn ProcessModel,
        target: &dyn ProcessModel,
        fingerprint: &str,
        phases: &mut PhaseTracker,
    ) -> Result<MigrationReport, MigrationError> {
        let instance_id = snapshot.instance.instance_id;
        let executor =
            MigrationExecutor::new(self.store.as_ref(), self.scheduler.as_ref(), &self.config);

        phases.enter(MigrationPhase::Matching)?;
        let matched = MigrationMatcher::new(source, target, plan).match_tree(&snapshot.tree)?;

        phases.enter(MigrationPhase::Reconciling)?;
        let delta = EventReconciler::new(target, plan).reconcile(
            &matched,
            &snapshot.subscriptions,
            &snapshot.timer_jobs,
        );
        let prepared = executor.prepare(snapshot, &matched, target)?;
        let sync = executor.synchronize_timers(instance_id, &delta).await?;

        phases.enter(MigrationPhase::Applying)?;
        let revision = snapshot.instance.revision + 1;
        let events = if self.config.record_events {
            audit_events(plan, fingerprint, phases, &matched, &delta, &sync.scheduled, revision)
        } else {
            Vec::new()
        };
        let committed = match executor
            .commit(snapshot, &matched, &prepared, &delta, &sync, events)
            .await
        {
            Ok(revision) => revision,
            Err(e) => {
                executor.roll_back(instance_id, &sync).await;
                return Err(e);
            }
        };
        phases.enter(MigrationPhase::Running {
            definition_id: plan.target_definition_id().to_string(),
        })?;

        tracing::info!(
            process_instance_id = %instance_id,
            target_definition_id = %plan.target_definition_id(),
            revision = committed,
            reused = matched.count(Resolution::Reuse),
            created = matched.count(Resolution::Create),
            removed = matched.count(Resolution::Remove),
            "Migrated process instance"
        );
        Ok(MigrationReport {
            process_instance_id: instance_id,
            target_definition_id: plan.target_definition_id().to_string(),
            plan_fingerprint: fingerprint.to_string(),
            already_applied: false,
            phases: phases.visited.clone(),
            revision: committed,
            reused_executions: matched.count(Resolution::Reuse),
            created_executions: matched.count(Resolution::Create),
            removed_executions: matched.count(Resolution::Remove),
            delta,
            scheduled_timers: sync.scheduled,
        })
    }
}

fn audit_events(
    plan: &MigrationPlan,
    fingerprint: &str,
    phases: &PhaseTracker,
    matched: &MigrationInstanceTree,
    delta: &ReconciliationDelta,
    scheduled: &[TimerJob],
    revision: u64,
) -> Vec<MigrationEvent> {
    let at = now_ms();
    let mut events = vec![MigrationEvent::MigrationStarted {
        source_definition_id: plan.source_definition_id().to_string(),
        target_definition_id: plan.target_definition_id().to_string(),
        plan_fingerprint: fingerprint.to_string(),
        at,
    }];
    events.extend(
        phases.visited[1..]
            .iter()
            .map(|phase| MigrationEvent::PhaseEntered {
                phase: phase.clone(),
            }),
    );

    for node in matched.nodes() {
        let execution_id = node.execution_id;
        let activity_id = node.activity_id.clone();
        events.push(match node.resolution {
            Resolution::Reuse => MigrationEvent::ExecutionReused {
                execution_id,
                activity_id,
            },
            Resolution::Create => MigrationEvent::ExecutionCreated {
                execution_id,
                activity_id,
            },
            Resolution::Remove => MigrationEvent::ExecutionRemoved {
                execution_id,
                activity_id,
            },
        });
    }

    let subscription = |s: &EventSubscription| (s.id, s.activity_id.clone());
    for (subscription_id, activity_id) in delta.retained_subscriptions.iter().map(subscription) {
        events.push(MigrationEvent::SubscriptionRetained {
            subscription_id,
            activity_id,
        });
    }
    for (subscription_id, activity_id) in delta.removed_subscriptions.iter().map(subscription) {
        events.push(MigrationEvent::SubscriptionRemoved {
            subscription_id,
            activity_id,
        });
    }
    for (subscription_id, activity_id) in delta.created_subscriptions.iter().map(subscription) {
        events.push(MigrationEvent::SubscriptionCreated {
            subscription_id,
            activity_id,
        });
    }

    for job in &delta.retained_timers {
        events.push(MigrationEvent::TimerRetained {
            timer_job_id: job.id,
            activity_id: job.activity_id.clone(),
        });
    }
    for job in &delta.removed_timers {
        events.push(MigrationEvent::TimerCancelled {
            timer_job_id: job.id,
            activity_id: job.activity_id.clone(),
        });
    }
    for job in scheduled {
        events.push(MigrationEvent::TimerScheduled {
            timer_job_id: job.id,
            activity_id: job.activity_id.clone(),
        });
    }

    events.push(MigrationEvent::MigrationCompleted {
        target_definition_id: plan.target_definition_id().to_string(),
        revision,
        at,
    });
    events
}
