//! Target-shaped scope layout.
//!
//! Both instantiation and migration matching describe the tree they want as
//! nested scope frames and let `Frames::materialize` lay out the concrete
//! executions: a frame with a single child takes that token itself or hosts
//! the child scope directly; a frame with several children forks, wrapping
//! every child in a concurrent execution.

use crate::tree::TreeError;
use crate::types::*;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameExecution {
    Reuse(ExecutionId),
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameChild {
    Scope {
        frame: usize,
        /// Existing concurrent execution of the branch leading to this scope.
        branch: Option<ExecutionId>,
    },
    Token {
        activity: ActivityId,
        /// Source leaf whose position the token continues.
        source: Option<ExecutionId>,
        branch: Option<ExecutionId>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeFrame {
    /// `None` for the process instance frame.
    pub scope_activity: Option<ActivityId>,
    pub execution: FrameExecution,
    pub children: Vec<FrameChild>,
}

impl ScopeFrame {
    /// The frame only carries a token positioned at its own scope activity.
    pub fn is_token_frame(&self) -> bool {
        matches!(
            self.children.as_slice(),
            [FrameChild::Token { activity, .. }] if Some(activity) == self.scope_activity.as_ref()
        )
    }
}

/// One execution of a materialized layout, listed parent before child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedExecution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    pub activity_id: Option<ActivityId>,
    pub scope_activity: Option<ActivityId>,
    pub reused: bool,
    pub carries: Option<ExecutionId>,
}

#[derive(Debug, Clone)]
pub(crate) struct Frames {
    frames: Vec<ScopeFrame>,
}

pub(crate) const ROOT_FRAME: usize = 0;

impl Frames {
    pub fn new(root: ExecutionId) -> Self {
        Self {
            frames: vec![ScopeFrame {
                scope_activity: None,
                execution: FrameExecution::Reuse(root),
                children: Vec::new(),
            }],
        }
    }

    pub fn get(&self, idx: usize) -> &ScopeFrame {
        &self.frames[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ScopeFrame)> {
        self.frames.iter().enumerate()
    }

    /// Open a child scope frame under `parent`.
    pub fn push(
        &mut self,
        parent: usize,
        scope_activity: &str,
        execution: FrameExecution,
        branch: Option<ExecutionId>,
    ) -> usize {
        let idx = self.frames.len();
        self.frames.push(ScopeFrame {
            scope_activity: Some(scope_activity.to_string()),
            execution,
            children: Vec::new(),
        });
        self.frames[parent]
            .children
            .push(FrameChild::Scope { frame: idx, branch });
        idx
    }

    pub fn add_token(
        &mut self,
        frame: usize,
        activity: &str,
        source: Option<ExecutionId>,
        branch: Option<ExecutionId>,
    ) {
        self.frames[frame].children.push(FrameChild::Token {
            activity: activity.to_string(),
            source,
            branch,
        });
    }

    /// Child frame of `parent` instantiating `scope_activity`, if any.
    pub fn child_scope(&self, parent: usize, scope_activity: &str) -> Option<usize> {
        self.frames[parent].children.iter().find_map(|c| match c {
            FrameChild::Scope { frame, .. }
                if self.frames[*frame].scope_activity.as_deref() == Some(scope_activity) =>
            {
                Some(*frame)
            }
            _ => None,
        })
    }

    /// Lay out concrete executions. `fresh` supplies the id of every execution
    /// that cannot reuse an existing one, given a stable path label.
    pub fn materialize(
        &self,
        fresh: &mut dyn FnMut(&str) -> ExecutionId,
    ) -> Result<Vec<PlannedExecution>, TreeError> {
        let mut layout = Layout {
            out: Vec::new(),
            claimed: HashSet::new(),
            fresh,
        };
        let root = layout.frame_id(&self.frames[ROOT_FRAME].execution, "")?;
        self.emit(ROOT_FRAME, root, None, "", &mut layout)?;
        Ok(layout.out)
    }

    fn emit(
        &self,
        idx: usize,
        id: ExecutionId,
        parent: Option<ExecutionId>,
        label: &str,
        layout: &mut Layout<'_>,
    ) -> Result<(), TreeError> {
        let frame = &self.frames[idx];
        let position = layout.out.len();
        layout.out.push(PlannedExecution {
            id,
            parent,
            is_scope: true,
            is_concurrent: false,
            activity_id: None,
            scope_activity: frame.scope_activity.clone(),
            reused: matches!(frame.execution, FrameExecution::Reuse(_)),
            carries: None,
        });

        match frame.children.as_slice() {
            [] => {}
            [FrameChild::Token {
                activity, source, ..
            }] => {
                let planned = &mut layout.out[position];
                planned.activity_id = Some(activity.clone());
                planned.carries = *source;
            }
            [FrameChild::Scope { frame: child, .. }] => {
                let child_label = self.child_label(label, *child);
                let child_id = layout.frame_id(&self.frames[*child].execution, &child_label)?;
                self.emit(*child, child_id, Some(id), &child_label, layout)?;
            }
            children => {
                for (i, child) in children.iter().enumerate() {
                    let branch_label = format!("{label}/{i}");
                    match child {
                        FrameChild::Token {
                            activity,
                            source,
                            branch,
                        } => {
                            let (wrapper, reused) = layout.claim(*branch, &branch_label);
                            layout.out.push(PlannedExecution {
                                id: wrapper,
                                parent: Some(id),
                                is_scope: false,
                                is_concurrent: true,
                                activity_id: Some(activity.clone()),
                                scope_activity: None,
                                reused,
                                carries: *source,
                            });
                        }
                        FrameChild::Scope {
                            frame: child,
                            branch,
                        } => {
                            let (wrapper, reused) = layout.claim(*branch, &branch_label);
                            layout.out.push(PlannedExecution {
                                id: wrapper,
                                parent: Some(id),
                                is_scope: false,
                                is_concurrent: true,
                                activity_id: None,
                                scope_activity: None,
                                reused,
                                carries: None,
                            });
                            let child_label = self.child_label(&branch_label, *child);
                            let child_id =
                                layout.frame_id(&self.frames[*child].execution, &child_label)?;
                            self.emit(*child, child_id, Some(wrapper), &child_label, layout)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn child_label(&self, label: &str, child: usize) -> String {
        format!(
            "{label}/{}",
            self.frames[child].scope_activity.as_deref().unwrap_or_default()
        )
    }
}

struct Layout<'a> {
    out: Vec<PlannedExecution>,
    claimed: HashSet<ExecutionId>,
    fresh: &'a mut dyn FnMut(&str) -> ExecutionId,
}

impl Layout<'_> {
    fn frame_id(&mut self, execution: &FrameExecution, label: &str) -> Result<ExecutionId, TreeError> {
        match execution {
            FrameExecution::Reuse(id) => {
                if !self.claimed.insert(*id) {
                    return Err(TreeError::DuplicateExecution(*id));
                }
                Ok(*id)
            }
            FrameExecution::Fresh => Ok((self.fresh)(label)),
        }
    }

    /// Reuse the branch's concurrent execution unless another child took it.
    fn claim(&mut self, branch: Option<ExecutionId>, label: &str) -> (ExecutionId, bool) {
        match branch {
            Some(id) if self.claimed.insert(id) => (id, true),
            _ => ((self.fresh)(label), false),
        }
    }
}
