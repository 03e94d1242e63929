//! Shared harness for the migration integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use bpmn_migrate_core::{
    instantiate, project, start_instance, ExecutionTree, InstanceSnapshot, MemoryScheduler,
    MemoryStore, MigrationConfig, MigrationEngine, MigrationPlan, ProcessDefinition,
    ProcessModel,
};
use uuid::Uuid;

pub struct Rig {
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<MemoryScheduler>,
    pub engine: MigrationEngine,
}

impl Rig {
    pub fn new(definitions: &[&ProcessDefinition]) -> Self {
        Self::with_config(definitions, MigrationConfig::default())
    }

    pub fn with_config(definitions: &[&ProcessDefinition], config: MigrationConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MemoryScheduler::new());
        let engine = MigrationEngine::new(
            store.clone(),
            scheduler.clone(),
            definitions
                .iter()
                .map(|d| Arc::new((*d).clone()) as Arc<dyn ProcessModel>)
                .collect(),
            config,
        );
        Self {
            store,
            scheduler,
            engine,
        }
    }

    pub async fn start(&self, model: &ProcessDefinition, leaves: &[&str]) -> InstanceSnapshot {
        start_instance(self.store.as_ref(), self.scheduler.as_ref(), model, leaves)
            .await
            .unwrap()
    }

    pub async fn snapshot(&self, instance_id: Uuid) -> InstanceSnapshot {
        self.engine.snapshot(instance_id).await.unwrap()
    }
}

/// Map every listed activity onto the activity of the same id.
pub fn identity_plan(
    source: &ProcessDefinition,
    target: &ProcessDefinition,
    activities: &[&str],
) -> MigrationPlan {
    activities
        .iter()
        .fold(MigrationPlan::builder(source.id(), target.id()), |b, a| {
            b.map_activities(a, a)
        })
        .build()
        .unwrap()
}

/// Projection of `tree` equals the projection of a fresh instance of `model`
/// positioned at `leaves`.
pub fn assert_same_shape(tree: &ExecutionTree, model: &ProcessDefinition, leaves: &[&str]) {
    let fresh = instantiate(model, Uuid::now_v7(), leaves).unwrap();
    let expected = project(&fresh, model).unwrap().shape();
    let actual = project(tree, model).unwrap().shape();
    assert_eq!(
        actual,
        expected,
        "migrated:\n{}expected:\n{}",
        actual.describe(),
        expected.describe()
    );
}

/// Complete active leaves one at a time until the process ends.
pub fn complete_all(tree: &mut ExecutionTree) -> bool {
    while let Some(leaf) = tree.active_leaves().first().copied() {
        if tree.complete_leaf(leaf).unwrap().process_ended {
            return true;
        }
    }
    false
}
