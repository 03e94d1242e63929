//! Migration matcher.
//!
//! Walks the source execution tree leaf by leaf, resolving every active
//! leaf's activity through the plan and every scope execution on its path to
//! a scope of the target model. Scope executions the target no longer needs
//! collapse into their host; scopes the target adds are created. The result
//! is a target-shaped `MigrationInstanceTree` tagging each execution with its
//! resolution.

use crate::error::MigrationError;
use crate::model::ProcessModel;
use crate::plan::{MigrationPlan, PlanError};
use crate::shape::{FrameChild, FrameExecution, Frames, PlannedExecution, ROOT_FRAME};
use crate::tree::ExecutionTree;
use crate::types::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Existing execution kept, rebound to the target definition.
    Reuse,
    /// New execution required by the target model.
    Create,
    /// Existing execution discarded.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationNode {
    pub execution_id: ExecutionId,
    /// Parent after migration; the source parent for removed executions.
    pub parent: Option<ExecutionId>,
    pub resolution: Resolution,
    pub is_scope: bool,
    pub is_concurrent: bool,
    /// Target activity for survivors, source activity for removed executions.
    pub activity_id: Option<ActivityId>,
    /// Target scope activity a surviving scope execution instantiates.
    pub scope_activity: Option<ActivityId>,
    /// Source active leaf whose position this execution continues.
    pub carries: Option<ExecutionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInstanceTree {
    pub process_instance_id: Uuid,
    pub source_definition_id: DefinitionId,
    pub target_definition_id: DefinitionId,
    pub plan_fingerprint: String,
    /// Survivors in target pre-order, then removed executions in source pre-order.
    nodes: Vec<MigrationNode>,
}

impl MigrationInstanceTree {
    pub fn nodes(&self) -> &[MigrationNode] {
        &self.nodes
    }

    pub fn surviving(&self) -> impl Iterator<Item = &MigrationNode> {
        self.nodes
            .iter()
            .filter(|n| n.resolution != Resolution::Remove)
    }

    pub fn removed(&self) -> impl Iterator<Item = &MigrationNode> {
        self.nodes
            .iter()
            .filter(|n| n.resolution == Resolution::Remove)
    }

    pub fn get(&self, execution_id: ExecutionId) -> Option<&MigrationNode> {
        self.nodes.iter().find(|n| n.execution_id == execution_id)
    }

    pub fn count(&self, resolution: Resolution) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.resolution == resolution)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FrameKey {
    Reused(ExecutionId),
    /// A scope the source tree has no execution for, anchored at the nearest
    /// reused scope execution inside it (or the leaf itself).
    Created {
        parent: usize,
        scope: ActivityId,
        anchor: ExecutionId,
    },
}

/// Resolution of one active leaf.
struct LeafMatch {
    leaf: ExecutionId,
    target_activity: ActivityId,
    /// Target scope chain, innermost first.
    target_chain: Vec<ActivityId>,
    /// Source scope execution reused at each target chain position.
    reused_at: Vec<Option<ExecutionId>>,
}

pub struct MigrationMatcher<'a> {
    source: &'a dyn ProcessModel,
    target: &'a dyn ProcessModel,
    plan: &'a MigrationPlan,
}

impl<'a> MigrationMatcher<'a> {
    pub fn new(
        source: &'a dyn ProcessModel,
        target: &'a dyn ProcessModel,
        plan: &'a MigrationPlan,
    ) -> Self {
        Self {
            source,
            target,
            plan,
        }
    }

    pub fn match_tree(&self, tree: &ExecutionTree) -> Result<MigrationInstanceTree, MigrationError> {
        let instance_id = tree.process_instance_id();
        if tree.definition_id() != self.source.definition_id() {
            return Err(MigrationError::InconsistentTreeInvariant(format!(
                "tree is bound to {}, source model is {}",
                tree.definition_id(),
                self.source.definition_id()
            )));
        }
        let leaves = tree.active_leaves();
        if leaves.is_empty() {
            return Err(MigrationError::InconsistentTreeInvariant(format!(
                "instance {instance_id} has no active executions"
            )));
        }

        let mut resolved: HashMap<ExecutionId, Option<ActivityId>> = HashMap::new();
        let mut frames = Frames::new(tree.root_id());
        let mut keyed: HashMap<FrameKey, usize> = HashMap::new();
        let mut parents: HashMap<usize, usize> = HashMap::new();
        let mut sources: HashMap<usize, ExecutionId> = HashMap::from([(ROOT_FRAME, tree.root_id())]);

        for leaf in &leaves {
            let matched = self.resolve_leaf(tree, *leaf, &mut resolved)?;
            let path = tree.path_to_root(*leaf)?;
            tracing::debug!(
                process_instance_id = %instance_id,
                execution_id = %leaf,
                target_activity_id = %matched.target_activity,
                "Resolved active execution"
            );

            let mut current = ROOT_FRAME;
            for position in (0..matched.target_chain.len()).rev() {
                let scope = &matched.target_chain[position];
                let key = match matched.reused_at[position] {
                    Some(execution) => FrameKey::Reused(execution),
                    None => FrameKey::Created {
                        parent: current,
                        scope: scope.clone(),
                        anchor: matched.reused_at[..position]
                            .iter()
                            .rev()
                            .flatten()
                            .next()
                            .copied()
                            .unwrap_or(matched.leaf),
                    },
                };

                current = match keyed.get(&key) {
                    Some(idx) => {
                        if parents.get(idx) != Some(&current) {
                            return Err(MigrationError::UnsupportedShapeChange(format!(
                                "scope {scope} would be reached through different parents"
                            )));
                        }
                        *idx
                    }
                    None => {
                        let branch = branch_hint(tree, &path, sources.get(&current).copied());
                        let execution = match matched.reused_at[position] {
                            Some(e) => FrameExecution::Reuse(e),
                            None => FrameExecution::Fresh,
                        };
                        let idx = frames.push(current, scope, execution, branch);
                        if let Some(e) = matched.reused_at[position] {
                            sources.insert(idx, e);
                        }
                        parents.insert(idx, current);
                        keyed.insert(key, idx);
                        idx
                    }
                };
            }

            let branch = branch_hint(tree, &path, sources.get(&current).copied());
            frames.add_token(current, &matched.target_activity, Some(matched.leaf), branch);
        }

        self.check_frames(tree, &frames, &sources)?;
        self.check_forks(tree, &resolved, &keyed, &frames)?;

        let fingerprint = self.plan.fingerprint();
        let layout = frames.materialize(&mut |label: &str| {
            Uuid::new_v5(&instance_id, format!("{fingerprint}{label}").as_bytes())
        })?;
        self.assemble(tree, &leaves, layout, fingerprint)
    }

    fn resolve_leaf(
        &self,
        tree: &ExecutionTree,
        leaf: ExecutionId,
        resolved: &mut HashMap<ExecutionId, Option<ActivityId>>,
    ) -> Result<LeafMatch, MigrationError> {
        let activity = tree
            .get(leaf)
            .and_then(|e| e.activity_id.as_deref())
            .ok_or_else(|| {
                MigrationError::InconsistentTreeInvariant(format!("{leaf} is not active"))
            })?;
        let target_activity = self.plan.target_for(activity).ok_or_else(|| {
            MigrationError::UnmappedActiveActivity {
                execution_id: leaf,
                activity_id: activity.to_string(),
            }
        })?;
        if self.target.activity(target_activity).is_none() {
            return Err(PlanError::UnknownTargetActivity(target_activity.to_string()).into());
        }

        let scopes = tree.scope_path(leaf)?;
        let source_chain = self.source.scope_chain(activity);
        if scopes.len() != source_chain.len() {
            return Err(MigrationError::InconsistentTreeInvariant(format!(
                "{leaf} at {activity} has {} scope executions for {} scopes",
                scopes.len(),
                source_chain.len()
            )));
        }

        let target_chain = self.target.scope_chain(target_activity);
        let mut reused_at = vec![None; target_chain.len()];
        let mut outermost: Option<usize> = None;
        for (execution, source_scope) in scopes.iter().zip(&source_chain) {
            let target_scope = if source_scope == activity {
                Some(target_activity)
            } else if let Some(mapped) = self.plan.target_for(source_scope) {
                if !target_chain.iter().any(|s| s == mapped) {
                    return Err(MigrationError::UnsupportedShapeChange(format!(
                        "scope {source_scope} is mapped to {mapped}, which does not enclose {target_activity}"
                    )));
                }
                Some(mapped)
            } else {
                target_chain
                    .iter()
                    .find(|s| *s == source_scope)
                    .map(String::as_str)
            };

            // `None` collapses the execution into its nearest surviving ancestor.
            let position = target_scope.and_then(|s| target_chain.iter().position(|c| c == s));
            if let Some(p) = position {
                if outermost.is_some_and(|o| p <= o) {
                    return Err(MigrationError::UnsupportedShapeChange(format!(
                        "scopes enclosing {target_activity} would change nesting order"
                    )));
                }
                outermost = Some(p);
                reused_at[p] = Some(*execution);
            }

            let resolution = position.map(|p| target_chain[p].clone());
            match resolved.get(execution) {
                Some(previous) if *previous != resolution => {
                    return Err(MigrationError::UnsupportedShapeChange(format!(
                        "execution {execution} would instantiate both {previous:?} and {resolution:?}"
                    )))
                }
                Some(_) => {}
                None => {
                    resolved.insert(*execution, resolution);
                }
            }
        }

        Ok(LeafMatch {
            leaf,
            target_activity: target_activity.to_string(),
            target_chain,
            reused_at,
        })
    }

    /// Shape rules every frame must satisfy so the layout stays reachable by
    /// normal instantiation.
    fn check_frames(
        &self,
        tree: &ExecutionTree,
        frames: &Frames,
        sources: &HashMap<usize, ExecutionId>,
    ) -> Result<(), MigrationError> {
        for (idx, frame) in frames.iter() {
            let scope = frame.scope_activity.as_deref();
            let own_token = frame.children.iter().any(|c| {
                matches!(c, FrameChild::Token { activity, .. } if Some(activity.as_str()) == scope)
            });
            if own_token && frame.children.len() > 1 {
                return Err(MigrationError::UnsupportedShapeChange(format!(
                    "scope {} would host its own token next to other branches",
                    scope.unwrap_or_default()
                )));
            }

            let mut containers = HashSet::new();
            for child in &frame.children {
                if let FrameChild::Scope { frame: nested, .. } = child {
                    let nested = frames.get(*nested);
                    if nested.is_token_frame() {
                        continue;
                    }
                    let nested_scope = nested.scope_activity.as_deref().unwrap_or_default();
                    if !containers.insert(nested_scope) {
                        return Err(MigrationError::UnsupportedShapeChange(format!(
                            "scope {nested_scope} would be instantiated twice in one parent"
                        )));
                    }
                }
            }

            if frame.children.len() < 2 {
                continue;
            }
            let fork = sources.get(&idx).copied().ok_or_else(|| {
                MigrationError::UnsupportedShapeChange(format!(
                    "new scope {} would introduce concurrency",
                    scope.unwrap_or_default()
                ))
            })?;
            let branches: Vec<Option<ExecutionId>> = frame
                .children
                .iter()
                .map(|c| match c {
                    FrameChild::Scope { branch, .. } | FrameChild::Token { branch, .. } => *branch,
                })
                .collect();
            let distinct: HashSet<ExecutionId> = branches.iter().flatten().copied().collect();
            if distinct.len() != branches.len() {
                return Err(MigrationError::UnsupportedShapeChange(format!(
                    "branches of {fork} would be merged or split"
                )));
            }
            if live_branches(tree, fork) != branches.len() {
                return Err(MigrationError::UnsupportedShapeChange(format!(
                    "concurrency of {fork} would change"
                )));
            }
        }
        Ok(())
    }

    /// Every source fork keeps its scope and its branch count.
    fn check_forks(
        &self,
        tree: &ExecutionTree,
        resolved: &HashMap<ExecutionId, Option<ActivityId>>,
        keyed: &HashMap<FrameKey, usize>,
        frames: &Frames,
    ) -> Result<(), MigrationError> {
        for execution in tree.executions() {
            let branches = live_branches(tree, execution.id);
            if branches == 0 {
                continue;
            }
            if execution.id == tree.root_id() {
                if frames.get(ROOT_FRAME).children.len() != branches {
                    return Err(MigrationError::UnsupportedShapeChange(
                        "concurrency of the process instance would change".into(),
                    ));
                }
                continue;
            }
            let kept = resolved.get(&execution.id).is_some_and(Option::is_some);
            let frame = keyed.get(&FrameKey::Reused(execution.id));
            match (kept, frame) {
                (true, Some(idx)) if frames.get(*idx).children.len() == branches => {}
                _ => {
                    return Err(MigrationError::UnsupportedShapeChange(format!(
                        "fork {} would lose its scope or branches",
                        execution.id
                    )))
                }
            }
        }
        Ok(())
    }

    fn assemble(
        &self,
        tree: &ExecutionTree,
        leaves: &[ExecutionId],
        layout: Vec<PlannedExecution>,
        plan_fingerprint: String,
    ) -> Result<MigrationInstanceTree, MigrationError> {
        let mut carried: BTreeMap<ExecutionId, usize> = BTreeMap::new();
        for planned in &layout {
            if let Some(leaf) = planned.carries {
                *carried.entry(leaf).or_default() += 1;
            }
        }
        for leaf in leaves {
            if carried.get(leaf) != Some(&1) {
                return Err(MigrationError::InconsistentTreeInvariant(format!(
                    "active execution {leaf} is not carried exactly once"
                )));
            }
        }

        let surviving: HashSet<ExecutionId> = layout.iter().map(|p| p.id).collect();
        let mut nodes: Vec<MigrationNode> = layout
            .into_iter()
            .map(|p| MigrationNode {
                execution_id: p.id,
                parent: p.parent,
                resolution: if p.reused {
                    Resolution::Reuse
                } else {
                    Resolution::Create
                },
                is_scope: p.is_scope,
                is_concurrent: p.is_concurrent,
                activity_id: p.activity_id,
                scope_activity: p.scope_activity,
                carries: p.carries,
            })
            .collect();

        for id in tree.pre_order() {
            if surviving.contains(&id) {
                continue;
            }
            let Some(execution) = tree.get(id) else {
                continue;
            };
            nodes.push(MigrationNode {
                execution_id: id,
                parent: execution.parent,
                resolution: Resolution::Remove,
                is_scope: execution.is_scope,
                is_concurrent: execution.is_concurrent,
                activity_id: execution.activity_id.clone(),
                scope_activity: None,
                carries: None,
            });
        }

        let matched = MigrationInstanceTree {
            process_instance_id: tree.process_instance_id(),
            source_definition_id: self.source.definition_id().to_string(),
            target_definition_id: self.target.definition_id().to_string(),
            plan_fingerprint,
            nodes,
        };
        tracing::info!(
            process_instance_id = %matched.process_instance_id,
            reused = matched.count(Resolution::Reuse),
            created = matched.count(Resolution::Create),
            removed = matched.count(Resolution::Remove),
            "Matched execution tree"
        );
        Ok(matched)
    }
}

/// The concurrent execution on `path` directly below `source`, if any.
fn branch_hint(
    tree: &ExecutionTree,
    path: &[ExecutionId],
    source: Option<ExecutionId>,
) -> Option<ExecutionId> {
    let source = source?;
    path.iter()
        .copied()
        .find(|id| tree.get(*id).is_some_and(|e| e.parent == Some(source)))
        .filter(|id| tree.get(*id).is_some_and(|e| e.is_concurrent))
}

/// Concurrent children of `execution` with at least one active leaf below.
fn live_branches(tree: &ExecutionTree, execution: ExecutionId) -> usize {
    let Some(node) = tree.get(execution) else {
        return 0;
    };
    node.children
        .iter()
        .filter(|c| tree.get(**c).is_some_and(|e| e.is_concurrent))
        .filter(|c| {
            tree.get(**c).is_some_and(Execution::is_active)
                || tree
                    .descendants(**c)
                    .iter()
                    .any(|d| tree.get(*d).is_some_and(Execution::is_active))
        })
        .count()
}
