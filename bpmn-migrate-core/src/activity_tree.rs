//! Activity instance tree: a pure projection of the execution tree, grouping
//! executions by the scope activity they instantiate. Never stored.

use crate::model::ProcessModel;
use crate::tree::{ExecutionTree, TreeError};
use crate::types::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityInstance {
    /// `"{activityId}:{executionId}"`; the process instance id for the root.
    /// Derived from the hosting execution, so a collapsed scope hands its
    /// activity a new id even though the activity keeps running.
    pub id: String,
    /// The definition id for the root.
    pub activity_id: ActivityId,
    pub execution_id: ExecutionId,
    pub children: Vec<ActivityInstance>,
}

/// Id-free structure of an activity instance tree, children sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActivityShape {
    pub activity_id: ActivityId,
    pub children: Vec<ActivityShape>,
}

impl ActivityInstance {
    fn new(activity_id: &str, execution_id: ExecutionId) -> Self {
        Self {
            id: format!("{activity_id}:{execution_id}"),
            activity_id: activity_id.to_string(),
            execution_id,
            children: Vec::new(),
        }
    }

    pub fn shape(&self) -> ActivityShape {
        let mut children: Vec<_> = self.children.iter().map(Self::shape).collect();
        children.sort();
        ActivityShape {
            activity_id: self.activity_id.clone(),
            children,
        }
    }

    /// All instances of `activity_id` in this subtree, pre-order.
    pub fn instances_of(&self, activity_id: &str) -> Vec<&ActivityInstance> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(next) = stack.pop() {
            if next.activity_id == activity_id {
                found.push(next);
            }
            stack.extend(next.children.iter().rev());
        }
        found
    }

    pub fn describe(&self) -> String {
        self.shape().describe()
    }
}

impl ActivityShape {
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(0, &mut out);
        out
    }

    fn describe_into(&self, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.activity_id);
        for child in &self.children {
            child.describe_into(depth + 1, out);
        }
    }
}

/// Scope activity each non-root scope execution instantiates, read off the
/// active leaves' scope chains. Executions without active descendants are
/// absent.
pub fn scope_assignments(
    tree: &ExecutionTree,
    model: &dyn ProcessModel,
) -> HashMap<ExecutionId, ActivityId> {
    let mut assigned = HashMap::new();
    for leaf in tree.active_leaves() {
        let Some(activity) = tree.get(leaf).and_then(|e| e.activity_id.as_deref()) else {
            continue;
        };
        let Ok(scopes) = tree.scope_path(leaf) else {
            continue;
        };
        for (execution, scope) in scopes.into_iter().zip(model.scope_chain(activity)) {
            assigned.entry(execution).or_insert(scope);
        }
    }
    assigned
}

/// Project `tree` under `model`.
pub fn project(
    tree: &ExecutionTree,
    model: &dyn ProcessModel,
) -> Result<ActivityInstance, TreeError> {
    let assigned = scope_assignments(tree, model);
    let root = tree.root_id();
    let mut instance = ActivityInstance::new(model.definition_id(), root);
    instance.id = tree.process_instance_id().to_string();
    collect(tree, &assigned, root, &mut instance)?;
    Ok(instance)
}

/// Add the activity instances below `execution` to `into`. Concurrent
/// executions are transparent; nested scope executions open a child
/// instance.
fn collect(
    tree: &ExecutionTree,
    assigned: &HashMap<ExecutionId, ActivityId>,
    execution: ExecutionId,
    into: &mut ActivityInstance,
) -> Result<(), TreeError> {
    let node = tree
        .get(execution)
        .ok_or(TreeError::UnknownExecution(execution))?;

    if let Some(activity) = node.activity_id.as_deref() {
        if node.is_leaf() {
            let is_own_scope = node.is_scope
                && assigned.get(&execution).map(String::as_str) == Some(activity);
            if !is_own_scope {
                into.children.push(ActivityInstance::new(activity, execution));
            }
        }
    }

    for child in &node.children {
        let child_node = tree.get(*child).ok_or(TreeError::UnknownExecution(*child))?;
        if child_node.is_scope {
            let scope = assigned.get(child).ok_or_else(|| {
                TreeError::Invariant(format!("scope execution {child} instantiates no scope"))
            })?;
            let mut nested = ActivityInstance::new(scope, *child);
            collect(tree, assigned, *child, &mut nested)?;
            into.children.push(nested);
        } else {
            collect(tree, assigned, *child, into)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessDefinitionDto;
    use uuid::Uuid;

    #[test]
    fn test_sub_process_projection() {
        let model = ProcessDefinitionDto::new("p")
            .sub_process("subProcess")
            .task_in("subProcess", "userTask")
            .build()
            .unwrap();
        let instance = Uuid::now_v7();
        let mut tree = ExecutionTree::new(instance, "p:1");
        let sub = tree
            .add_child(instance, Uuid::now_v7(), true, false, Some("userTask".into()))
            .unwrap();

        let root = project(&tree, &model).unwrap();
        assert_eq!(root.id, instance.to_string());
        assert_eq!(root.activity_id, "p:1");
        assert_eq!(root.children.len(), 1);
        let sub_instance = &root.children[0];
        assert_eq!(sub_instance.id, format!("subProcess:{sub}"));
        assert_eq!(sub_instance.children[0].activity_id, "userTask");
        assert_eq!(sub_instance.children[0].execution_id, sub);
        assert_eq!(root.describe(), "p:1\n  subProcess\n    userTask\n");
    }

    #[test]
    fn test_scope_task_is_one_instance() {
        let model = ProcessDefinitionDto::new("p")
            .scope_task("scopeTask")
            .task("userTask")
            .build()
            .unwrap();
        let instance = Uuid::now_v7();
        let mut tree = ExecutionTree::new(instance, "p:1");
        let wrapper = tree
            .add_child(instance, Uuid::now_v7(), false, true, None)
            .unwrap();
        tree.add_child(wrapper, Uuid::now_v7(), true, false, Some("scopeTask".into()))
            .unwrap();
        tree.add_child(instance, Uuid::now_v7(), false, true, Some("userTask".into()))
            .unwrap();

        let root = project(&tree, &model).unwrap();
        assert_eq!(
            root.shape(),
            ActivityShape {
                activity_id: "p:1".into(),
                children: vec![
                    ActivityShape {
                        activity_id: "scopeTask".into(),
                        children: vec![]
                    },
                    ActivityShape {
                        activity_id: "userTask".into(),
                        children: vec![]
                    },
                ],
            }
        );
        assert_eq!(root.instances_of("scopeTask").len(), 1);
    }

    #[test]
    fn test_root_leaf() {
        let model = ProcessDefinitionDto::new("p").task("userTask").build().unwrap();
        let instance = Uuid::now_v7();
        let mut tree = ExecutionTree::new(instance, "p:1");
        tree.set_activity(instance, Some("userTask".into())).unwrap();
        let root = project(&tree, &model).unwrap();
        assert_eq!(root.describe(), "p:1\n  userTask\n");
        assert!(scope_assignments(&tree, &model).is_empty());
    }
}
