//! Migration executor.
//!
//! `prepare` builds the post-migration tree without side effects,
//! `synchronize_timers` performs the scheduler calls, and `commit` writes
//! tree, artifacts and audit events in one store transaction.

use crate::activity_tree::project;
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::events::MigrationEvent;
use crate::matcher::{MigrationInstanceTree, Resolution};
use crate::model::ProcessModel;
use crate::reconcile::ReconciliationDelta;
use crate::scheduler::{SchedulerError, TimerScheduler};
use crate::store::{CommitOutcome, InstanceSnapshot, MigrationCommit, MigrationStore};
use crate::tree::ExecutionTree;
use crate::types::*;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use uuid::Uuid;

/// Scheduler calls that succeeded during one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerSync {
    /// New registrations, ordered by execution and boundary activity.
    pub scheduled: Vec<TimerJob>,
    /// Source timers no longer registered.
    pub cancelled: Vec<TimerJob>,
}

/// The post-migration tree and every source execution it no longer holds.
#[derive(Debug, Clone)]
pub struct PreparedMigration {
    pub tree: ExecutionTree,
    pub discarded: Vec<Execution>,
}

pub struct MigrationExecutor<'a> {
    store: &'a dyn MigrationStore,
    scheduler: &'a dyn TimerScheduler,
    config: &'a MigrationConfig,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(
        store: &'a dyn MigrationStore,
        scheduler: &'a dyn TimerScheduler,
        config: &'a MigrationConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    /// Build the target tree from the matched layout and discard removed
    /// executions from a working copy of the source tree. A discarded
    /// execution that is still active without its position being carried
    /// elsewhere is a matcher defect and fails the step.
    pub fn prepare(
        &self,
        snapshot: &InstanceSnapshot,
        matched: &MigrationInstanceTree,
        target: &dyn ProcessModel,
    ) -> Result<PreparedMigration, MigrationError> {
        let source = &snapshot.tree;
        let surviving: HashSet<ExecutionId> =
            matched.surviving().map(|n| n.execution_id).collect();
        let carried: HashSet<ExecutionId> = matched.surviving().filter_map(|n| n.carries).collect();

        for node in matched.surviving() {
            let exists = source.contains(node.execution_id);
            match node.resolution {
                Resolution::Reuse if !exists => {
                    return Err(MigrationError::InconsistentTreeInvariant(format!(
                        "reused execution {} is not part of the instance",
                        node.execution_id
                    )))
                }
                Resolution::Create if exists => {
                    return Err(MigrationError::InconsistentTreeInvariant(format!(
                        "created execution {} already exists",
                        node.execution_id
                    )))
                }
                _ => {}
            }
        }

        let mut working = source.clone();
        let mut discarded = Vec::new();
        for node in matched.removed() {
            let id = node.execution_id;
            let Some(execution) = working.get(id).cloned() else {
                continue;
            };
            if working.descendants(id).iter().any(|d| surviving.contains(d)) {
                // Collapsed level: its surviving descendants are re-parented.
                discarded.push(execution);
                continue;
            }
            for dropped in working.remove_subtree(id)? {
                if dropped.is_active() && !carried.contains(&dropped.id) {
                    return Err(MigrationError::InconsistentTreeInvariant(format!(
                        "removed execution {} is still active at {}",
                        dropped.id,
                        dropped.activity_id.as_deref().unwrap_or_default()
                    )));
                }
                discarded.push(dropped);
            }
        }
        for leaf in source.active_leaves() {
            if !carried.contains(&leaf) {
                return Err(MigrationError::InconsistentTreeInvariant(format!(
                    "active execution {leaf} would be lost"
                )));
            }
        }

        let mut tree = ExecutionTree::new(matched.process_instance_id, &matched.target_definition_id);
        for node in matched.surviving() {
            match node.parent {
                None if node.execution_id == tree.root_id() => {
                    tree.set_activity(node.execution_id, node.activity_id.clone())?
                }
                None => {
                    return Err(MigrationError::InconsistentTreeInvariant(format!(
                        "{} is not the process instance execution",
                        node.execution_id
                    )))
                }
                Some(parent) => {
                    tree.add_child(
                        parent,
                        node.execution_id,
                        node.is_scope,
                        node.is_concurrent,
                        node.activity_id.clone(),
                    )?;
                }
            }
        }

        if self.config.verify_projection {
            tree.validate(target)?;
            project(&tree, target)?;
        }
        Ok(PreparedMigration { tree, discarded })
    }

    /// Schedule new timers, then cancel removed ones. Calls within each group
    /// run concurrently. On any failure the step is rolled back at the
    /// scheduler and fails with `SchedulerUnavailable`.
    pub async fn synchronize_timers(
        &self,
        process_instance_id: Uuid,
        delta: &ReconciliationDelta,
    ) -> Result<TimerSync, MigrationError> {
        let concurrency = self.config.scheduler_concurrency.max(1);

        let outcomes: Vec<Result<TimerJob, SchedulerError>> =
            stream::iter(&delta.timers_to_schedule)
                .map(|timer| async move {
                    let id = self
                        .scheduler
                        .schedule_timer(timer.execution_id, &timer.activity_id, &timer.schedule)
                        .await?;
                    tracing::debug!(
                        process_instance_id = %process_instance_id,
                        timer_job_id = %id,
                        activity_id = %timer.activity_id,
                        "Scheduled timer"
                    );
                    Ok::<_, SchedulerError>(TimerJob {
                        id,
                        process_instance_id,
                        execution_id: timer.execution_id,
                        activity_id: timer.activity_id.clone(),
                        schedule: timer.schedule.clone(),
                    })
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut sync = TimerSync::default();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(job) => sync.scheduled.push(job),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        sync.scheduled.sort_by(|a, b| {
            (a.execution_id, &a.activity_id).cmp(&(b.execution_id, &b.activity_id))
        });
        if let Some(e) = failure {
            self.roll_back(process_instance_id, &sync).await;
            return Err(MigrationError::SchedulerUnavailable(e));
        }

        let outcomes: Vec<(&TimerJob, Result<(), SchedulerError>)> =
            stream::iter(&delta.removed_timers)
                .map(|job| async move { (job, self.scheduler.cancel_timer(job.id).await) })
                .buffer_unordered(concurrency)
                .collect()
                .await;
        for (job, outcome) in outcomes {
            match outcome {
                Ok(()) => sync.cancelled.push(job.clone()),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        sync.cancelled.sort_by_key(|job| job.id);
        if let Some(e) = failure {
            self.roll_back(process_instance_id, &sync).await;
            return Err(MigrationError::SchedulerUnavailable(e));
        }

        tracing::info!(
            process_instance_id = %process_instance_id,
            scheduled = sync.scheduled.len(),
            cancelled = sync.cancelled.len(),
            "Synchronized timers"
        );
        Ok(sync)
    }

    /// Undo the scheduler side of an aborted step: re-register cancelled
    /// source timers under their stored ids and cancel the timers scheduled
    /// for the target. Best effort; a call that fails here is logged and the
    /// stored timer rows still describe the pre-migration registrations, so
    /// a retried step converges.
    pub async fn roll_back(&self, process_instance_id: Uuid, sync: &TimerSync) {
        for job in &sync.cancelled {
            if let Err(e) = self.scheduler.restore_timer(job).await {
                tracing::error!(
                    process_instance_id = %process_instance_id,
                    timer_job_id = %job.id,
                    activity_id = %job.activity_id,
                    error = %e,
                    "Failed to restore timer cancelled by aborted migration"
                );
            }
        }
        for job in &sync.scheduled {
            if let Err(e) = self.scheduler.cancel_timer(job.id).await {
                tracing::warn!(
                    process_instance_id = %process_instance_id,
                    timer_job_id = %job.id,
                    error = %e,
                    "Failed to cancel timer scheduled by aborted migration"
                );
            }
        }
    }

    /// Write everything as one unit, guarded by the snapshot's revision.
    pub async fn commit(
        &self,
        snapshot: &InstanceSnapshot,
        matched: &MigrationInstanceTree,
        prepared: &PreparedMigration,
        delta: &ReconciliationDelta,
        sync: &TimerSync,
        events: Vec<MigrationEvent>,
    ) -> Result<u64, MigrationError> {
        let instance_id = snapshot.instance.instance_id;
        let mut timer_jobs = delta.retained_timers.clone();
        timer_jobs.extend_from_slice(&sync.scheduled);

        let commit = MigrationCommit {
            process_definition_id: matched.target_definition_id.clone(),
            plan_fingerprint: matched.plan_fingerprint.clone(),
            executions: prepared.tree.executions().cloned().collect(),
            subscriptions: delta.subscriptions_after(),
            timer_jobs,
            events,
        };
        match self
            .store
            .commit_migration(instance_id, snapshot.instance.revision, commit)
            .await?
        {
            CommitOutcome::Committed { revision } => Ok(revision),
            CommitOutcome::RevisionConflict { actual } => {
                tracing::warn!(
                    process_instance_id = %instance_id,
                    expected = snapshot.instance.revision,
                    actual,
                    "Instance changed during migration"
                );
                Err(MigrationError::ConcurrentModification(instance_id))
            }
        }
    }
}
