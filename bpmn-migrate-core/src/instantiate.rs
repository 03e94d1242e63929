//! Direct instantiation: replay "enter activity" from the root for a set of
//! activities. Used to start instances and as the reference shape migrated
//! trees are compared with.

use crate::activity_tree::scope_assignments;
use crate::model::{ModelError, ProcessModel};
use crate::reconcile::artifacts_for_scope;
use crate::scheduler::TimerScheduler;
use crate::shape::{FrameExecution, Frames, ROOT_FRAME};
use crate::store::{InstanceSnapshot, MigrationStore};
use crate::tree::ExecutionTree;
use crate::types::*;
use anyhow::{Context, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// Build the execution tree of an instance positioned at `leaves`. Leaves
/// share enclosing container scopes; each leaf at a scope activity gets its
/// own scope execution.
pub fn instantiate(
    model: &dyn ProcessModel,
    process_instance_id: Uuid,
    leaves: &[&str],
) -> Result<ExecutionTree> {
    let mut frames = Frames::new(process_instance_id);
    for activity in leaves {
        if model.activity(activity).is_none() {
            return Err(ModelError::UnknownActivity(activity.to_string()).into());
        }
        let mut current = ROOT_FRAME;
        for scope in model.scope_chain(activity).iter().rev() {
            current = match frames.child_scope(current, scope) {
                Some(shared) if scope != activity => shared,
                _ => frames.push(current, scope, FrameExecution::Fresh, None),
            };
        }
        frames.add_token(current, activity, None, None);
    }

    let layout = frames.materialize(&mut |_: &str| Uuid::now_v7())?;
    let mut tree = ExecutionTree::new(process_instance_id, model.definition_id());
    for planned in layout {
        match planned.parent {
            None => tree.set_activity(planned.id, planned.activity_id)?,
            Some(parent) => {
                tree.add_child(
                    parent,
                    planned.id,
                    planned.is_scope,
                    planned.is_concurrent,
                    planned.activity_id,
                )?;
            }
        }
    }
    Ok(tree)
}

/// Create and persist a running instance at `leaves`, with the event
/// subscriptions and scheduler-registered timers its scopes require.
pub async fn start_instance(
    store: &dyn MigrationStore,
    scheduler: &dyn TimerScheduler,
    model: &dyn ProcessModel,
    leaves: &[&str],
) -> Result<InstanceSnapshot> {
    if leaves.is_empty() {
        anyhow::bail!("An instance needs at least one active activity");
    }
    let instance_id = Uuid::now_v7();
    let tree = instantiate(model, instance_id, leaves)?;

    let assigned = scope_assignments(&tree, model);
    let mut subscriptions = Vec::new();
    let mut timer_jobs = Vec::new();
    let mut fresh = |_: ExecutionId, _: &str| Uuid::now_v7();
    for execution in tree.pre_order() {
        let Some(scope) = assigned.get(&execution) else {
            continue;
        };
        let (created, timers) = artifacts_for_scope(
            model,
            instance_id,
            execution,
            scope,
            &HashSet::new(),
            &mut fresh,
        );
        subscriptions.extend(created);
        for timer in timers {
            let id = scheduler
                .schedule_timer(timer.execution_id, &timer.activity_id, &timer.schedule)
                .await
                .with_context(|| format!("Failed to schedule timer {}", timer.activity_id))?;
            timer_jobs.push(TimerJob {
                id,
                process_instance_id: instance_id,
                execution_id: timer.execution_id,
                activity_id: timer.activity_id,
                schedule: timer.schedule,
            });
        }
    }

    let instance = ProcessInstance {
        instance_id,
        process_definition_id: model.definition_id().to_string(),
        state: ProcessState::Running,
        revision: 0,
        last_migration: None,
        created_at: now_ms(),
    };
    store.save_instance(&instance).await?;
    let executions: Vec<Execution> = tree.executions().cloned().collect();
    store.save_executions(instance_id, &executions).await?;
    for subscription in &subscriptions {
        store.save_subscription(subscription).await?;
    }
    for job in &timer_jobs {
        store.save_timer_job(job).await?;
    }

    tracing::info!(
        process_instance_id = %instance_id,
        process_definition_id = %instance.process_definition_id,
        executions = tree.len(),
        subscriptions = subscriptions.len(),
        timer_jobs = timer_jobs.len(),
        "Started process instance"
    );
    Ok(InstanceSnapshot {
        instance,
        tree,
        subscriptions,
        timer_jobs,
    })
}
