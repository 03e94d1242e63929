//! Migrations that drop boundary events from the activities an instance is
//! waiting in, across the canonical process shapes.

mod common;

use bpmn_migrate_core::fixtures;
use bpmn_migrate_core::*;
use common::{assert_same_shape, complete_all, identity_plan, Rig};

struct Shape {
    name: &'static str,
    model: ProcessDefinitionDto,
    host: &'static str,
    leaves: &'static [&'static str],
    /// The host's boundary scope collapses and its token moves to the parent
    /// execution.
    collapses: bool,
}

fn shapes() -> Vec<Shape> {
    vec![
        Shape {
            name: "task",
            model: fixtures::one_task(),
            host: "userTask",
            leaves: &["userTask"],
            collapses: true,
        },
        Shape {
            name: "scope task",
            model: fixtures::scope_task(),
            host: "userTask",
            leaves: &["userTask"],
            collapses: false,
        },
        Shape {
            name: "concurrent task",
            model: fixtures::parallel_gateway(),
            host: "userTask1",
            leaves: &["userTask1", "userTask2"],
            collapses: true,
        },
        Shape {
            name: "concurrent scope task",
            model: fixtures::parallel_scope_tasks(),
            host: "userTask1",
            leaves: &["userTask1", "userTask2"],
            collapses: false,
        },
        Shape {
            name: "sub process",
            model: fixtures::sub_process(),
            host: "subProcess",
            leaves: &["userTask"],
            collapses: false,
        },
        Shape {
            name: "task in sub process",
            model: fixtures::sub_process(),
            host: "userTask",
            leaves: &["userTask"],
            collapses: true,
        },
        Shape {
            name: "scope task in sub process",
            model: fixtures::scope_task_sub_process(),
            host: "userTask",
            leaves: &["userTask"],
            collapses: false,
        },
        Shape {
            name: "parallel sub process",
            model: fixtures::parallel_sub_process(),
            host: "subProcess1",
            leaves: &["userTask1", "userTask2"],
            collapses: false,
        },
        Shape {
            name: "sub process with concurrent tasks",
            model: fixtures::parallel_tasks_in_sub_process(),
            host: "subProcess",
            leaves: &["userTask1", "userTask2"],
            collapses: false,
        },
        Shape {
            name: "concurrent task in sub process",
            model: fixtures::parallel_tasks_in_sub_process(),
            host: "userTask1",
            leaves: &["userTask1", "userTask2"],
            collapses: true,
        },
    ]
}

async fn remove_boundary(shape: Shape, boundary: BoundaryEventDefinition) {
    let source = shape
        .model
        .clone()
        .boundary(shape.host, boundary.clone())
        .build()
        .unwrap();
    let target = shape.model.with_version(2).build().unwrap();
    let rig = Rig::new(&[&source, &target]);
    let started = rig.start(&source, shape.leaves).await;
    let instance_id = started.instance.instance_id;

    let plan = identity_plan(&source, &target, shape.leaves);
    let report = rig
        .engine
        .migrate(instance_id, &plan)
        .await
        .unwrap_or_else(|e| panic!("{}: {e}", shape.name));
    assert_eq!(report.revision, 1, "{}", shape.name);

    let mut migrated = rig.snapshot(instance_id).await;
    assert_eq!(migrated.instance.process_definition_id, target.id());
    assert!(
        migrated
            .subscriptions
            .iter()
            .all(|s| s.activity_id != boundary.id),
        "{}: subscription left for {}",
        shape.name,
        boundary.id
    );
    assert!(migrated.timer_jobs.is_empty(), "{}", shape.name);
    assert!(migrated.subscriptions.is_empty(), "{}", shape.name);
    for job in &started.timer_jobs {
        assert!(!rig.scheduler.is_registered(job.id), "{}", shape.name);
    }

    assert_eq!(report.created_executions, 0, "{}", shape.name);
    for execution in migrated.tree.executions() {
        assert!(
            started.tree.contains(execution.id),
            "{}: {} was not part of the instance",
            shape.name,
            execution.id
        );
    }
    for leaf in shape.leaves {
        let before = active_execution(&started.tree, leaf);
        let expected = match before.parent {
            Some(parent) if shape.collapses && *leaf == shape.host => parent,
            _ => before.id,
        };
        assert_eq!(
            active_execution(&migrated.tree, leaf).id,
            expected,
            "{}: {leaf}",
            shape.name
        );
    }

    migrated.tree.validate(&target).unwrap();
    assert_same_shape(&migrated.tree, &target, shape.leaves);
    assert!(complete_all(&mut migrated.tree), "{}", shape.name);
}

fn active_execution<'a>(tree: &'a ExecutionTree, activity_id: &str) -> &'a Execution {
    tree.executions()
        .find(|e| e.is_active() && e.activity_id.as_deref() == Some(activity_id))
        .unwrap_or_else(|| panic!("no active execution at {activity_id}"))
}

async fn remove_from_every_shape(boundary: BoundaryEventDefinition) {
    for shape in shapes() {
        remove_boundary(shape, boundary.clone()).await;
    }
}

#[tokio::test]
async fn test_remove_message_boundary() {
    remove_from_every_shape(BoundaryEventDefinition::message("boundary", "Message")).await;
}

#[tokio::test]
async fn test_remove_signal_boundary() {
    remove_from_every_shape(BoundaryEventDefinition::signal("boundary", "Signal")).await;
}

#[tokio::test]
async fn test_remove_timer_boundary() {
    remove_from_every_shape(BoundaryEventDefinition::timer(
        "boundary",
        TimerSchedule::Duration {
            duration_ms: 3_600_000,
        },
    ))
    .await;
}

#[tokio::test]
async fn test_remove_error_boundary() {
    remove_from_every_shape(BoundaryEventDefinition::error("boundary", Some("E42"))).await;
}

#[tokio::test]
async fn test_remove_escalation_boundary() {
    remove_from_every_shape(BoundaryEventDefinition::escalation("boundary", None)).await;
}

#[tokio::test]
async fn test_remove_message_boundary_from_task() {
    let source = fixtures::one_task()
        .boundary("userTask", BoundaryEventDefinition::message("boundary", "Message"))
        .build()
        .unwrap();
    let target = fixtures::one_task().with_version(2).build().unwrap();
    let rig = Rig::new(&[&source, &target]);
    let started = rig.start(&source, &["userTask"]).await;
    assert_eq!(started.tree.describe(), "<root>\n  userTask scope\n");
    assert_eq!(started.subscriptions.len(), 1);

    let plan = identity_plan(&source, &target, &["userTask"]);
    let report = rig
        .engine
        .migrate(started.instance.instance_id, &plan)
        .await
        .unwrap();
    assert_eq!(report.removed_executions, 1);
    assert_eq!(report.delta.removed_subscriptions, started.subscriptions);

    let migrated = rig.snapshot(started.instance.instance_id).await;
    assert_eq!(migrated.tree.describe(), "userTask\n");
    assert_eq!(migrated.tree.len(), 1);
    assert!(migrated.subscriptions.is_empty());
}

#[tokio::test]
async fn test_remove_multiple_boundaries() {
    let source = fixtures::one_task()
        .boundary("userTask", BoundaryEventDefinition::message("message", "Message"))
        .boundary("userTask", BoundaryEventDefinition::signal("signal", "Signal"))
        .boundary(
            "userTask",
            BoundaryEventDefinition::timer("timer", TimerSchedule::Date { due_ms: 1_000 }),
        )
        .boundary("userTask", BoundaryEventDefinition::error("error", None))
        .build()
        .unwrap();
    let target = fixtures::one_task().with_version(2).build().unwrap();
    let rig = Rig::new(&[&source, &target]);
    let started = rig.start(&source, &["userTask"]).await;
    assert_eq!(started.subscriptions.len(), 2);
    assert_eq!(started.timer_jobs.len(), 1);

    let plan = identity_plan(&source, &target, &["userTask"]);
    let report = rig
        .engine
        .migrate(started.instance.instance_id, &plan)
        .await
        .unwrap();
    assert_eq!(report.delta.removed_subscriptions.len(), 2);
    assert_eq!(report.delta.removed_timers.len(), 1);
    assert!(rig.scheduler.registered().is_empty());

    let migrated = rig.snapshot(started.instance.instance_id).await;
    assert!(migrated.subscriptions.is_empty());
    assert!(migrated.timer_jobs.is_empty());
}

#[tokio::test]
async fn test_remove_one_of_two_boundaries_keeps_the_other() {
    let source = fixtures::scope_task()
        .boundary("userTask", BoundaryEventDefinition::message("message", "Message"))
        .boundary("userTask", BoundaryEventDefinition::signal("signal", "Signal"))
        .build()
        .unwrap();
    let target = fixtures::scope_task()
        .with_version(2)
        .boundary("userTask", BoundaryEventDefinition::signal("signal", "Signal"))
        .build()
        .unwrap();
    let rig = Rig::new(&[&source, &target]);
    let started = rig.start(&source, &["userTask"]).await;
    let signal = started
        .subscriptions
        .iter()
        .find(|s| s.activity_id == "signal")
        .cloned()
        .unwrap();

    let plan = identity_plan(&source, &target, &["userTask"]);
    rig.engine
        .migrate(started.instance.instance_id, &plan)
        .await
        .unwrap();

    let migrated = rig.snapshot(started.instance.instance_id).await;
    assert_eq!(migrated.subscriptions, vec![signal]);
    let rebound = started
        .tree
        .clone()
        .into_executions()
        .into_iter()
        .map(|mut e| {
            e.process_definition_id = target.id().to_string();
            e
        })
        .collect();
    assert_eq!(migrated.tree, ExecutionTree::from_executions(rebound).unwrap());
}

#[tokio::test]
async fn test_remove_signal_boundaries_from_parallel_sub_processes() {
    let source = fixtures::parallel_sub_process()
        .boundary("subProcess1", BoundaryEventDefinition::signal("signal1", "Signal"))
        .boundary("subProcess2", BoundaryEventDefinition::signal("signal2", "Signal"))
        .build()
        .unwrap();
    let target = fixtures::parallel_sub_process().with_version(2).build().unwrap();
    let rig = Rig::new(&[&source, &target]);
    let leaves = ["userTask1", "userTask2"];
    let started = rig.start(&source, &leaves).await;
    assert_eq!(started.subscriptions.len(), 2);

    let plan = identity_plan(&source, &target, &leaves);
    rig.engine
        .migrate(started.instance.instance_id, &plan)
        .await
        .unwrap();

    let mut migrated = rig.snapshot(started.instance.instance_id).await;
    assert!(migrated.subscriptions.is_empty());
    let root = migrated.tree.root().clone();
    assert_eq!(root.children.len(), 2);
    for branch in &root.children {
        let branch = migrated.tree.get(*branch).unwrap();
        assert!(branch.is_concurrent);
        let scope = migrated.tree.get(branch.children[0]).unwrap();
        assert!(scope.is_scope);
        assert!(started.tree.contains(scope.id));
    }

    // each branch completes on its own
    let first = migrated.tree.active_leaves()[0];
    assert!(!migrated.tree.complete_leaf(first).unwrap().process_ended);
    assert_eq!(migrated.tree.active_leaves().len(), 1);
    assert!(complete_all(&mut migrated.tree));
}

#[tokio::test]
async fn test_added_boundary_gets_a_fresh_subscription() {
    let source = fixtures::one_task().build().unwrap();
    let target = fixtures::one_task()
        .with_version(2)
        .boundary("userTask", BoundaryEventDefinition::message("boundary", "Message"))
        .build()
        .unwrap();
    let rig = Rig::new(&[&source, &target]);
    let started = rig.start(&source, &["userTask"]).await;

    let plan = identity_plan(&source, &target, &["userTask"]);
    let report = rig
        .engine
        .migrate(started.instance.instance_id, &plan)
        .await
        .unwrap();
    assert_eq!(report.created_executions, 1);

    let migrated = rig.snapshot(started.instance.instance_id).await;
    assert_eq!(migrated.tree.describe(), "<root>\n  userTask scope\n");
    assert_eq!(migrated.subscriptions.len(), 1);
    let subscription = &migrated.subscriptions[0];
    assert_eq!(subscription.activity_id, "boundary");
    assert_eq!(subscription.event_name, "Message");
    let host = migrated.tree.get(subscription.execution_id).unwrap();
    assert_eq!(host.activity_id.as_deref(), Some("userTask"));
    assert_same_shape(&migrated.tree, &target, &["userTask"]);
}
