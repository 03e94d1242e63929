//! Event & timer reconciliation.
//!
//! Subscriptions and timer jobs belong to the scope execution hosting their
//! boundary event. After matching, an artifact survives only when its owner
//! survives as an instance of a target scope declaring a corresponding
//! boundary event of the same trigger kind. Target boundary events without a
//! surviving counterpart get fresh artifacts.

use crate::matcher::{MigrationInstanceTree, MigrationNode, Resolution};
use crate::model::ProcessModel;
use crate::plan::MigrationPlan;
use crate::types::*;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A timer the scheduler still has to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub execution_id: ExecutionId,
    pub activity_id: ActivityId,
    pub schedule: TimerSchedule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationDelta {
    /// Kept with their identity, rebound to the target boundary event.
    pub retained_subscriptions: Vec<EventSubscription>,
    pub removed_subscriptions: Vec<EventSubscription>,
    pub created_subscriptions: Vec<EventSubscription>,
    pub retained_timers: Vec<TimerJob>,
    pub removed_timers: Vec<TimerJob>,
    pub timers_to_schedule: Vec<PendingTimer>,
}

impl ReconciliationDelta {
    /// No artifact is removed or added.
    pub fn is_noop(&self) -> bool {
        self.removed_subscriptions.is_empty()
            && self.created_subscriptions.is_empty()
            && self.removed_timers.is_empty()
            && self.timers_to_schedule.is_empty()
    }

    pub fn subscriptions_after(&self) -> Vec<EventSubscription> {
        self.retained_subscriptions
            .iter()
            .chain(&self.created_subscriptions)
            .cloned()
            .collect()
    }
}

/// Runtime artifact a boundary trigger needs while its host is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BoundaryArtifact {
    Subscription {
        kind: SubscriptionKind,
        event_name: String,
    },
    Timer(TimerSchedule),
}

pub(crate) fn boundary_artifact(trigger: &BoundaryTrigger) -> Option<BoundaryArtifact> {
    match trigger {
        BoundaryTrigger::Message { name } => Some(BoundaryArtifact::Subscription {
            kind: SubscriptionKind::Message,
            event_name: name.clone(),
        }),
        BoundaryTrigger::Signal { name } => Some(BoundaryArtifact::Subscription {
            kind: SubscriptionKind::Signal,
            event_name: name.clone(),
        }),
        BoundaryTrigger::Timer { schedule } => Some(BoundaryArtifact::Timer(schedule.clone())),
        // Caught by activity-graph lookup when thrown.
        BoundaryTrigger::Error { .. } | BoundaryTrigger::Escalation { .. } => None,
    }
}

/// Artifacts for every boundary event of `scope_activity` not in `existing`.
pub(crate) fn artifacts_for_scope(
    model: &dyn ProcessModel,
    process_instance_id: Uuid,
    execution_id: ExecutionId,
    scope_activity: &str,
    existing: &HashSet<(ExecutionId, ActivityId)>,
    subscription_id: &mut dyn FnMut(ExecutionId, &str) -> SubscriptionId,
) -> (Vec<EventSubscription>, Vec<PendingTimer>) {
    let mut subscriptions = Vec::new();
    let mut timers = Vec::new();
    for definition in model.boundary_definitions(scope_activity) {
        if existing.contains(&(execution_id, definition.id.clone())) {
            continue;
        }
        match boundary_artifact(&definition.trigger) {
            Some(BoundaryArtifact::Subscription { kind, event_name }) => {
                subscriptions.push(EventSubscription {
                    id: subscription_id(execution_id, &definition.id),
                    process_instance_id,
                    execution_id,
                    activity_id: definition.id.clone(),
                    kind,
                    event_name,
                })
            }
            Some(BoundaryArtifact::Timer(schedule)) => timers.push(PendingTimer {
                execution_id,
                activity_id: definition.id.clone(),
                schedule,
            }),
            None => {}
        }
    }
    (subscriptions, timers)
}

pub struct EventReconciler<'a> {
    target: &'a dyn ProcessModel,
    plan: &'a MigrationPlan,
}

impl<'a> EventReconciler<'a> {
    pub fn new(target: &'a dyn ProcessModel, plan: &'a MigrationPlan) -> Self {
        Self { target, plan }
    }

    pub fn reconcile(
        &self,
        matched: &MigrationInstanceTree,
        subscriptions: &[EventSubscription],
        timer_jobs: &[TimerJob],
    ) -> ReconciliationDelta {
        let instance_id = matched.process_instance_id;
        let owners: HashMap<ExecutionId, &MigrationNode> = matched
            .surviving()
            .map(|n| (n.execution_id, n))
            .collect();
        let mut delta = ReconciliationDelta::default();
        let mut kept: HashSet<(ExecutionId, ActivityId)> = HashSet::new();

        for subscription in subscriptions {
            let counterpart = owners.get(&subscription.execution_id).and_then(|owner| {
                self.counterpart(
                    owner,
                    &subscription.activity_id,
                    subscription.kind.trigger_kind(),
                )
            });
            let claimed = counterpart
                .filter(|d| kept.insert((subscription.execution_id, d.id.clone())));
            match claimed {
                Some(definition) => {
                    let mut rebound = subscription.clone();
                    rebound.activity_id = definition.id.clone();
                    if let Some(BoundaryArtifact::Subscription { event_name, .. }) =
                        boundary_artifact(&definition.trigger)
                    {
                        rebound.event_name = event_name;
                    }
                    delta.retained_subscriptions.push(rebound);
                }
                None => {
                    tracing::info!(
                        process_instance_id = %instance_id,
                        subscription_id = %subscription.id,
                        activity_id = %subscription.activity_id,
                        "Removing event subscription"
                    );
                    delta.removed_subscriptions.push(subscription.clone());
                }
            }
        }

        for job in timer_jobs {
            let counterpart = owners
                .get(&job.execution_id)
                .and_then(|owner| self.counterpart(owner, &job.activity_id, TriggerKind::Timer));
            let claimed = counterpart.filter(|d| kept.insert((job.execution_id, d.id.clone())));
            match claimed {
                Some(definition) => {
                    let mut rebound = job.clone();
                    rebound.activity_id = definition.id.clone();
                    delta.retained_timers.push(rebound);
                }
                None => {
                    tracing::info!(
                        process_instance_id = %instance_id,
                        timer_job_id = %job.id,
                        activity_id = %job.activity_id,
                        "Removing timer job"
                    );
                    delta.removed_timers.push(job.clone());
                }
            }
        }

        let fingerprint = matched.plan_fingerprint.as_str();
        let mut subscription_id = |execution: ExecutionId, boundary: &str| {
            Uuid::new_v5(
                &instance_id,
                format!("{fingerprint}/subscription/{execution}/{boundary}").as_bytes(),
            )
        };
        for node in matched.surviving() {
            let Some(scope) = node.scope_activity.as_deref() else {
                continue;
            };
            let (created, timers) = artifacts_for_scope(
                self.target,
                instance_id,
                node.execution_id,
                scope,
                &kept,
                &mut subscription_id,
            );
            delta.created_subscriptions.extend(created);
            delta.timers_to_schedule.extend(timers);
        }

        tracing::debug!(
            process_instance_id = %instance_id,
            removed_subscriptions = delta.removed_subscriptions.len(),
            created_subscriptions = delta.created_subscriptions.len(),
            removed_timers = delta.removed_timers.len(),
            timers_to_schedule = delta.timers_to_schedule.len(),
            "Reconciled boundary events"
        );
        delta
    }

    /// Target boundary event corresponding to `boundary_id` on `owner`'s
    /// target scope: the plan's mapping or the same id, with the same trigger
    /// kind.
    fn counterpart(
        &self,
        owner: &MigrationNode,
        boundary_id: &str,
        kind: TriggerKind,
    ) -> Option<&'a BoundaryEventDefinition> {
        if owner.resolution == Resolution::Remove {
            return None;
        }
        let scope = owner.scope_activity.as_deref()?;
        let target_id = self.plan.boundary_counterpart(boundary_id);
        if self.target.boundary_host(target_id) != Some(scope) {
            return None;
        }
        self.target
            .boundary_definition(target_id)
            .filter(|d| d.kind() == kind)
    }
}
