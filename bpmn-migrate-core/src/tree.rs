//! Execution tree arena.
//!
//! Nodes live in a `BTreeMap` keyed by execution id; parent and child links are
//! plain ids. The root execution's id is the process instance id.

use crate::model::ProcessModel;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Unknown execution: {0}")]
    UnknownExecution(ExecutionId),

    #[error("Execution already exists: {0}")]
    DuplicateExecution(ExecutionId),

    #[error("Broken link between {parent} and {child}")]
    BrokenLink {
        parent: ExecutionId,
        child: ExecutionId,
    },

    #[error("Execution {0} is not an active leaf")]
    NotActive(ExecutionId),

    #[error("Cannot remove the root execution {0}")]
    RootRemoval(ExecutionId),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Result of `ExecutionTree::complete_leaf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub removed: Vec<ExecutionId>,
    pub process_ended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTree {
    root: ExecutionId,
    nodes: BTreeMap<ExecutionId, Execution>,
}

impl ExecutionTree {
    /// A tree holding only the root scope execution.
    pub fn new(process_instance_id: uuid::Uuid, definition_id: &str) -> Self {
        let root = Execution {
            id: process_instance_id,
            process_instance_id,
            parent: None,
            children: Vec::new(),
            is_scope: true,
            is_concurrent: false,
            activity_id: None,
            process_definition_id: definition_id.to_string(),
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(process_instance_id, root);
        Self {
            root: process_instance_id,
            nodes,
        }
    }

    /// Rebuild a tree from persisted execution rows. Links must agree in both
    /// directions and every node must be reachable from the single root.
    pub fn from_executions(executions: Vec<Execution>) -> Result<Self, TreeError> {
        let mut roots = executions.iter().filter(|e| e.parent.is_none());
        let root = match (roots.next(), roots.next()) {
            (Some(root), None) => root.id,
            (None, _) => return Err(TreeError::Invariant("no root execution".into())),
            (Some(_), Some(other)) => {
                return Err(TreeError::Invariant(format!(
                    "second root execution {}",
                    other.id
                )))
            }
        };

        let mut nodes = BTreeMap::new();
        for execution in executions {
            let id = execution.id;
            if nodes.insert(id, execution).is_some() {
                return Err(TreeError::DuplicateExecution(id));
            }
        }

        let tree = Self { root, nodes };
        tree.check_links()?;
        Ok(tree)
    }

    pub fn root_id(&self) -> ExecutionId {
        self.root
    }

    pub fn root(&self) -> &Execution {
        &self.nodes[&self.root]
    }

    pub fn process_instance_id(&self) -> uuid::Uuid {
        self.root().process_instance_id
    }

    pub fn definition_id(&self) -> &str {
        &self.root().process_definition_id
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.nodes.values()
    }

    pub fn into_executions(self) -> Vec<Execution> {
        self.nodes.into_values().collect()
    }

    fn node(&self, id: ExecutionId) -> Result<&Execution, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::UnknownExecution(id))
    }

    fn node_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, TreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or(TreeError::UnknownExecution(id))
    }

    // ── Mutation ──

    /// Append a new child execution under `parent`.
    pub fn add_child(
        &mut self,
        parent: ExecutionId,
        id: ExecutionId,
        is_scope: bool,
        is_concurrent: bool,
        activity_id: Option<ActivityId>,
    ) -> Result<ExecutionId, TreeError> {
        let template = self.node(parent)?;
        let execution = Execution {
            id,
            process_instance_id: template.process_instance_id,
            parent: Some(parent),
            children: Vec::new(),
            is_scope,
            is_concurrent,
            activity_id,
            process_definition_id: template.process_definition_id.clone(),
        };
        self.insert(execution)?;
        Ok(id)
    }

    /// Insert a prepared execution as the last child of its parent.
    pub fn insert(&mut self, execution: Execution) -> Result<(), TreeError> {
        if self.nodes.contains_key(&execution.id) {
            return Err(TreeError::DuplicateExecution(execution.id));
        }
        let parent = execution
            .parent
            .ok_or_else(|| TreeError::Invariant(format!("{} has no parent", execution.id)))?;
        if !execution.children.is_empty() {
            return Err(TreeError::Invariant(format!(
                "{} inserted with children",
                execution.id
            )));
        }
        self.node_mut(parent)?.children.push(execution.id);
        self.nodes.insert(execution.id, execution);
        Ok(())
    }

    pub(crate) fn set_activity(
        &mut self,
        id: ExecutionId,
        activity_id: Option<ActivityId>,
    ) -> Result<(), TreeError> {
        self.node_mut(id)?.activity_id = activity_id;
        Ok(())
    }

    /// Detach `id` from its parent and drop it together with its descendants.
    /// Returns the dropped executions, `id` first.
    pub fn remove_subtree(&mut self, id: ExecutionId) -> Result<Vec<Execution>, TreeError> {
        if id == self.root {
            return Err(TreeError::RootRemoval(id));
        }
        let parent = self
            .node(id)?
            .parent
            .ok_or_else(|| TreeError::Invariant(format!("{id} has no parent")))?;
        self.node_mut(parent)?.children.retain(|c| *c != id);

        let mut ids = vec![id];
        ids.extend(self.descendants(id));
        Ok(ids
            .into_iter()
            .filter_map(|removed| self.nodes.remove(&removed))
            .collect())
    }

    /// End the branch of an active leaf. Empty ancestors are dropped on the
    /// way up and a fork left with one concurrent child is collapsed into its
    /// parent. Completing the root itself, or emptying it, ends the process.
    pub fn complete_leaf(&mut self, id: ExecutionId) -> Result<Completion, TreeError> {
        if !self.node(id)?.is_active() {
            return Err(TreeError::NotActive(id));
        }
        if id == self.root {
            self.set_activity(id, None)?;
            return Ok(Completion {
                removed: Vec::new(),
                process_ended: true,
            });
        }

        let mut removed = Vec::new();
        let mut current = id;
        loop {
            let parent = self.node(current)?.parent.ok_or(TreeError::BrokenLink {
                parent: current,
                child: current,
            })?;
            self.remove_subtree(current)?;
            removed.push(current);

            let siblings = self.node(parent)?.children.clone();
            match siblings.as_slice() {
                [] if parent == self.root => {
                    return Ok(Completion {
                        removed,
                        process_ended: true,
                    })
                }
                [] => current = parent,
                [only] if self.node(*only)?.is_concurrent => {
                    let only = *only;
                    removed.push(only);
                    self.collapse_fork(parent, only)?;
                    return Ok(Completion {
                        removed,
                        process_ended: false,
                    });
                }
                _ => {
                    return Ok(Completion {
                        removed,
                        process_ended: false,
                    })
                }
            }
        }
    }

    /// Fold the last concurrent child into the fork parent: a leaf hands over
    /// its activity, a wrapper hands over its scope child.
    fn collapse_fork(&mut self, parent: ExecutionId, only: ExecutionId) -> Result<(), TreeError> {
        let wrapper = self
            .nodes
            .remove(&only)
            .ok_or(TreeError::UnknownExecution(only))?;
        for child in &wrapper.children {
            self.node_mut(*child)?.parent = Some(parent);
        }
        let fork = self.node_mut(parent)?;
        fork.children = wrapper.children;
        if fork.children.is_empty() {
            fork.activity_id = wrapper.activity_id;
        }
        Ok(())
    }

    // ── Traversal ──

    /// All execution ids in deterministic pre-order (children in stored order).
    pub fn pre_order(&self) -> Vec<ExecutionId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.walk(self.root, &mut out);
        out
    }

    fn walk(&self, id: ExecutionId, out: &mut Vec<ExecutionId>) {
        out.push(id);
        if let Some(node) = self.nodes.get(&id) {
            for child in &node.children {
                self.walk(*child, out);
            }
        }
    }

    /// Leaves positioned at an activity, in pre-order.
    pub fn active_leaves(&self) -> Vec<ExecutionId> {
        self.pre_order()
            .into_iter()
            .filter(|id| self.nodes.get(id).is_some_and(Execution::is_active))
            .collect()
    }

    /// `id` first, the root last.
    pub fn path_to_root(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, TreeError> {
        let mut path = vec![id];
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            if path.len() > self.nodes.len() {
                return Err(TreeError::Invariant(format!("parent cycle at {id}")));
            }
            path.push(parent);
            current = self.node(parent)?;
        }
        Ok(path)
    }

    /// Strict descendants of `id` in pre-order.
    pub fn descendants(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        self.walk(id, &mut out);
        out.remove(0);
        out
    }

    /// Number of edges between `id` and the root.
    pub fn depth(&self, id: ExecutionId) -> Result<usize, TreeError> {
        Ok(self.path_to_root(id)?.len() - 1)
    }

    // ── Invariants ──

    fn check_links(&self) -> Result<(), TreeError> {
        let root = self.node(self.root)?;
        if root.parent.is_some() || root.id != root.process_instance_id {
            return Err(TreeError::Invariant(format!(
                "root {} is not the process instance execution",
                root.id
            )));
        }
        for node in self.nodes.values() {
            if node.process_instance_id != root.process_instance_id {
                return Err(TreeError::Invariant(format!(
                    "{} belongs to instance {}",
                    node.id, node.process_instance_id
                )));
            }
            for child in &node.children {
                let linked = self.nodes.get(child).and_then(|c| c.parent);
                if linked != Some(node.id) {
                    return Err(TreeError::BrokenLink {
                        parent: node.id,
                        child: *child,
                    });
                }
            }
            if let Some(parent) = node.parent {
                let listed = self
                    .nodes
                    .get(&parent)
                    .is_some_and(|p| p.children.contains(&node.id));
                if !listed {
                    return Err(TreeError::BrokenLink {
                        parent,
                        child: node.id,
                    });
                }
            }
        }
        let reachable: HashSet<ExecutionId> = self.pre_order().into_iter().collect();
        if reachable.len() != self.nodes.len() {
            return Err(TreeError::Invariant("unreachable executions".into()));
        }
        Ok(())
    }

    /// Check the structural invariants normal instantiation under `model`
    /// guarantees: concurrency markers, single-child scope hosting, one
    /// definition binding, and scope executions matching each active leaf's
    /// scope chain.
    pub fn validate(&self, model: &dyn ProcessModel) -> Result<(), TreeError> {
        self.check_links()?;
        let definition = self.definition_id();
        if definition != model.definition_id() {
            return Err(TreeError::Invariant(format!(
                "tree bound to {definition}, model is {}",
                model.definition_id()
            )));
        }

        for node in self.nodes.values() {
            if node.process_definition_id != definition {
                return Err(TreeError::Invariant(format!(
                    "{} bound to {}",
                    node.id, node.process_definition_id
                )));
            }
            if node.is_concurrent && node.is_scope {
                return Err(TreeError::Invariant(format!(
                    "{} is both concurrent and scope",
                    node.id
                )));
            }
            if node.is_leaf() {
                if node.activity_id.is_none() && node.id != self.root {
                    return Err(TreeError::Invariant(format!(
                        "leaf {} has no activity",
                        node.id
                    )));
                }
                continue;
            }
            if node.activity_id.is_some() {
                return Err(TreeError::Invariant(format!(
                    "{} has children and an activity",
                    node.id
                )));
            }
            let concurrent = node
                .children
                .iter()
                .filter(|c| self.nodes.get(c).is_some_and(|e| e.is_concurrent))
                .count();
            if concurrent > 0 {
                if concurrent != node.children.len() || concurrent < 2 {
                    return Err(TreeError::Invariant(format!(
                        "fork {} has {} of {} concurrent children",
                        node.id,
                        concurrent,
                        node.children.len()
                    )));
                }
                if node.is_concurrent {
                    return Err(TreeError::Invariant(format!(
                        "concurrent execution {} hosts a fork",
                        node.id
                    )));
                }
            } else {
                let hosted = node.children.as_slice();
                let single_scope = hosted.len() == 1
                    && self.nodes.get(&hosted[0]).is_some_and(|c| c.is_scope);
                if !single_scope {
                    return Err(TreeError::Invariant(format!(
                        "{} must host exactly one scope child",
                        node.id
                    )));
                }
            }
        }

        let mut assigned: HashMap<ExecutionId, ActivityId> = HashMap::new();
        for leaf in self.active_leaves() {
            let node = self.node(leaf)?;
            let activity = node.activity_id.as_deref().unwrap_or_default();
            if model.activity(activity).is_none() {
                return Err(TreeError::Invariant(format!(
                    "{leaf} positioned at unknown activity {activity}"
                )));
            }
            let scopes = self.scope_path(leaf)?;
            let chain = model.scope_chain(activity);
            if scopes.len() != chain.len() {
                return Err(TreeError::Invariant(format!(
                    "{leaf} at {activity}: {} scope executions for {} scopes",
                    scopes.len(),
                    chain.len()
                )));
            }
            for (execution, scope) in scopes.into_iter().zip(chain) {
                match assigned.get(&execution) {
                    Some(existing) if *existing != scope => {
                        return Err(TreeError::Invariant(format!(
                            "{execution} instantiates both {existing} and {scope}"
                        )))
                    }
                    Some(_) => {}
                    None => {
                        assigned.insert(execution, scope);
                    }
                }
            }
        }
        Ok(())
    }

    /// Scope executions on the path from `id` up to, but excluding, the root;
    /// innermost first.
    pub fn scope_path(&self, id: ExecutionId) -> Result<Vec<ExecutionId>, TreeError> {
        let path = self.path_to_root(id)?;
        Ok(path
            .into_iter()
            .filter(|e| *e != self.root && self.nodes.get(e).is_some_and(|n| n.is_scope))
            .collect())
    }

    /// Indented, id-free rendering, one execution per line.
    ///
    /// ```text
    /// <root>
    ///   - concurrent
    ///     userTask scope
    ///   otherTask concurrent
    /// ```
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(self.root, 0, &mut out);
        out
    }

    fn describe_into(&self, id: ExecutionId, depth: usize, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let label = match (&node.activity_id, id == self.root) {
            (Some(activity), _) => activity.as_str(),
            (None, true) => "<root>",
            (None, false) => "-",
        };
        let _ = write!(out, "{}{}", "  ".repeat(depth), label);
        if node.is_scope && id != self.root {
            out.push_str(" scope");
        }
        if node.is_concurrent {
            out.push_str(" concurrent");
        }
        out.push('\n');
        for child in &node.children {
            self.describe_into(*child, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessDefinitionDto;
    use uuid::Uuid;

    fn id() -> Uuid {
        Uuid::now_v7()
    }

    /// root fork: [concurrent userTask1, concurrent → scope scopeTask]
    fn fork_tree() -> (ExecutionTree, Uuid, Uuid, Uuid) {
        let instance = id();
        let mut tree = ExecutionTree::new(instance, "p:1");
        let a = tree
            .add_child(instance, id(), false, true, Some("userTask1".into()))
            .unwrap();
        let wrapper = tree.add_child(instance, id(), false, true, None).unwrap();
        let b = tree
            .add_child(wrapper, id(), true, false, Some("scopeTask".into()))
            .unwrap();
        (tree, a, wrapper, b)
    }

    #[test]
    fn test_traversal_order() {
        let (tree, a, wrapper, b) = fork_tree();
        let root = tree.root_id();
        assert_eq!(tree.pre_order(), vec![root, a, wrapper, b]);
        assert_eq!(tree.active_leaves(), vec![a, b]);
        assert_eq!(tree.path_to_root(b).unwrap(), vec![b, wrapper, root]);
        assert_eq!(tree.descendants(wrapper), vec![b]);
        assert_eq!(tree.depth(b).unwrap(), 2);
        assert_eq!(tree.scope_path(b).unwrap(), vec![b]);
    }

    #[test]
    fn test_describe() {
        let (tree, ..) = fork_tree();
        assert_eq!(
            tree.describe(),
            "<root>\n  userTask1 concurrent\n  - concurrent\n    scopeTask scope\n"
        );
    }

    #[test]
    fn test_validate_against_model() {
        let model = ProcessDefinitionDto::new("p")
            .task("userTask1")
            .scope_task("scopeTask")
            .build()
            .unwrap();
        let (tree, a, ..) = fork_tree();
        tree.validate(&model).unwrap();

        let mut broken = tree.clone();
        broken.set_activity(a, Some("scopeTask".into())).unwrap();
        assert!(matches!(broken.validate(&model), Err(TreeError::Invariant(_))));
    }

    #[test]
    fn test_validate_rejects_single_concurrent_child() {
        let model = ProcessDefinitionDto::new("p").task("userTask").build().unwrap();
        let instance = id();
        let mut tree = ExecutionTree::new(instance, "p:1");
        tree.add_child(instance, id(), false, true, Some("userTask".into()))
            .unwrap();
        assert!(tree.validate(&model).is_err());
    }

    #[test]
    fn test_complete_leaf_collapses_fork() {
        let (mut tree, a, wrapper, b) = fork_tree();
        let done = tree.complete_leaf(a).unwrap();
        assert!(!done.process_ended);
        assert_eq!(done.removed, vec![a, wrapper]);
        assert_eq!(tree.root().children, vec![b]);
        assert_eq!(tree.get(b).unwrap().parent, Some(tree.root_id()));
        assert_eq!(tree.describe(), "<root>\n  scopeTask scope\n");

        let done = tree.complete_leaf(b).unwrap();
        assert!(done.process_ended);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_complete_leaf_hands_activity_to_fork_parent() {
        let instance = id();
        let mut tree = ExecutionTree::new(instance, "p:1");
        let a = tree
            .add_child(instance, id(), false, true, Some("a".into()))
            .unwrap();
        tree.add_child(instance, id(), false, true, Some("b".into()))
            .unwrap();
        tree.complete_leaf(a).unwrap();
        assert_eq!(tree.root().activity_id.as_deref(), Some("b"));
        assert!(tree.root().is_leaf());

        let done = tree.complete_leaf(instance).unwrap();
        assert!(done.process_ended);
        assert!(tree.active_leaves().is_empty());
    }

    #[test]
    fn test_remove_subtree_and_errors() {
        let (mut tree, a, wrapper, b) = fork_tree();
        assert_eq!(
            tree.remove_subtree(tree.root_id()),
            Err(TreeError::RootRemoval(tree.root_id()))
        );
        assert!(matches!(
            tree.complete_leaf(wrapper),
            Err(TreeError::NotActive(_))
        ));
        let removed = tree.remove_subtree(wrapper).unwrap();
        assert_eq!(removed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![wrapper, b]);
        assert_eq!(tree.root().children, vec![a]);
    }

    #[test]
    fn test_from_executions_checks_links() {
        let (tree, _, _, b) = fork_tree();
        let rebuilt = ExecutionTree::from_executions(tree.clone().into_executions()).unwrap();
        assert_eq!(rebuilt, tree);

        let mut rows = tree.into_executions();
        for row in rows.iter_mut().filter(|e| e.id == b) {
            row.parent = Some(Uuid::nil());
        }
        assert!(matches!(
            ExecutionTree::from_executions(rows),
            Err(TreeError::BrokenLink { child, .. }) if child == b
        ));
    }
}
