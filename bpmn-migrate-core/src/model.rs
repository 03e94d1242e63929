//! Process model collaborator.
//!
//! The migration core only consumes a narrow view of a process definition:
//! activity lookup, scope flags, structural parents and attached boundary
//! events. `ProcessDefinition` is the in-crate implementation, built from a
//! YAML-loadable DTO.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Duplicate element id: {0}")]
    DuplicateId(String),

    #[error("Activity {activity}: unknown parent {parent}")]
    UnknownParent { activity: String, parent: String },

    #[error("Activity {0}: parent chain forms a cycle")]
    ParentCycle(String),

    #[error("Boundary event {boundary}: unknown host activity {host}")]
    UnknownHost { boundary: String, host: String },

    #[error("Unknown activity: {0}")]
    UnknownActivity(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Read-only view of a process definition.
pub trait ProcessModel: Send + Sync {
    fn definition_id(&self) -> &str;

    fn activity(&self, id: &str) -> Option<&Activity>;

    fn boundary_definitions(&self, activity_id: &str) -> &[BoundaryEventDefinition] {
        self.activity(activity_id)
            .map(|a| a.boundary_events.as_slice())
            .unwrap_or(&[])
    }

    fn is_scope(&self, activity_id: &str) -> bool {
        self.activity(activity_id).is_some_and(|a| a.is_scope)
    }

    fn parent(&self, activity_id: &str) -> Option<&str> {
        self.activity(activity_id).and_then(|a| a.parent.as_deref())
    }

    /// Host activity of a boundary event, if `boundary_id` names one.
    fn boundary_host(&self, boundary_id: &str) -> Option<&str>;

    fn boundary_definition(&self, boundary_id: &str) -> Option<&BoundaryEventDefinition> {
        let host = self.boundary_host(boundary_id)?;
        self.boundary_definitions(host)
            .iter()
            .find(|d| d.id == boundary_id)
    }

    /// Scope activities enclosing `activity_id`, innermost first. Includes the
    /// activity itself when it is a scope. The process itself is not listed.
    fn scope_chain(&self, activity_id: &str) -> Vec<ActivityId> {
        let mut chain = Vec::new();
        let mut current = Some(activity_id);
        while let Some(id) = current {
            if self.is_scope(id) {
                chain.push(id.to_string());
            }
            current = self.parent(id);
        }
        chain
    }
}

// ─── DTO ──────────────────────────────────────────────────────

fn default_version() -> u32 {
    1
}

fn is_false(v: &bool) -> bool {
    !v
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinitionDto {
    pub key: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub activities: Vec<ActivityDto>,
    /// Boundary events declared apart from their host (`attachedToRef` style).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached: Vec<AttachedBoundary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedBoundary {
    pub attached_to: String,
    #[serde(flatten)]
    pub definition: BoundaryEventDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Declared scope (e.g. a task with input/output mappings).
    #[serde(default, skip_serializing_if = "is_false")]
    pub scope: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary_events: Vec<BoundaryEventDefinition>,
}

impl ProcessDefinitionDto {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: 1,
            activities: Vec::new(),
            attached: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn task(self, id: &str) -> Self {
        self.push(id, None, false)
    }

    pub fn scope_task(self, id: &str) -> Self {
        self.push(id, None, true)
    }

    /// A sub process is a scope container; nest activities with `*_in`.
    pub fn sub_process(self, id: &str) -> Self {
        self.push(id, None, true)
    }

    pub fn task_in(self, parent: &str, id: &str) -> Self {
        self.push(id, Some(parent), false)
    }

    pub fn scope_task_in(self, parent: &str, id: &str) -> Self {
        self.push(id, Some(parent), true)
    }

    pub fn sub_process_in(self, parent: &str, id: &str) -> Self {
        self.push(id, Some(parent), true)
    }

    /// Attach a boundary event to an activity. Unknown hosts are reported by
    /// `ProcessDefinition::from_dto`.
    pub fn boundary(mut self, host: &str, definition: BoundaryEventDefinition) -> Self {
        self.attached.push(AttachedBoundary {
            attached_to: host.to_string(),
            definition,
        });
        self
    }

    fn push(mut self, id: &str, parent: Option<&str>, scope: bool) -> Self {
        self.activities.push(ActivityDto {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            scope,
            boundary_events: Vec::new(),
        });
        self
    }

    pub fn build(self) -> Result<ProcessDefinition, ModelError> {
        ProcessDefinition::from_dto(self)
    }
}

// ─── ProcessDefinition ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessDefinition {
    id: DefinitionId,
    key: String,
    version: u32,
    activities: BTreeMap<ActivityId, Activity>,
    /// boundary event id → host activity id
    boundary_hosts: BTreeMap<ActivityId, ActivityId>,
}

impl ProcessDefinition {
    /// Build a definition, deriving scope flags: an activity is a scope when
    /// declared so, when it contains other activities, or when it carries a
    /// boundary event.
    pub fn from_dto(mut dto: ProcessDefinitionDto) -> Result<Self, ModelError> {
        for attached in std::mem::take(&mut dto.attached) {
            let host = dto
                .activities
                .iter_mut()
                .find(|a| a.id == attached.attached_to)
                .ok_or_else(|| ModelError::UnknownHost {
                    boundary: attached.definition.id.clone(),
                    host: attached.attached_to.clone(),
                })?;
            host.boundary_events.push(attached.definition);
        }

        let mut seen = HashSet::new();
        for activity in &dto.activities {
            if !seen.insert(activity.id.as_str()) {
                return Err(ModelError::DuplicateId(activity.id.clone()));
            }
        }

        let mut boundary_hosts = BTreeMap::new();
        for activity in &dto.activities {
            for boundary in &activity.boundary_events {
                if seen.contains(boundary.id.as_str())
                    || boundary_hosts
                        .insert(boundary.id.clone(), activity.id.clone())
                        .is_some()
                {
                    return Err(ModelError::DuplicateId(boundary.id.clone()));
                }
            }
        }

        let containers: HashSet<&str> = dto
            .activities
            .iter()
            .filter_map(|a| a.parent.as_deref())
            .collect();

        for activity in &dto.activities {
            if let Some(parent) = &activity.parent {
                if !seen.contains(parent.as_str()) {
                    return Err(ModelError::UnknownParent {
                        activity: activity.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let activities: BTreeMap<ActivityId, Activity> = dto
            .activities
            .iter()
            .map(|a| {
                let is_scope = a.scope
                    || containers.contains(a.id.as_str())
                    || !a.boundary_events.is_empty();
                (
                    a.id.clone(),
                    Activity {
                        id: a.id.clone(),
                        is_scope,
                        parent: a.parent.clone(),
                        boundary_events: a.boundary_events.clone(),
                    },
                )
            })
            .collect();

        for id in activities.keys() {
            let mut steps = 0usize;
            let mut current = activities.get(id).and_then(|a| a.parent.as_ref());
            while let Some(parent) = current {
                steps += 1;
                if steps > activities.len() {
                    return Err(ModelError::ParentCycle(id.clone()));
                }
                current = activities.get(parent).and_then(|a| a.parent.as_ref());
            }
        }

        Ok(Self {
            id: format!("{}:{}", dto.key, dto.version),
            key: dto.key,
            version: dto.version,
            activities,
            boundary_hosts,
        })
    }

    /// Parse and build from YAML.
    ///
    /// ```yaml
    /// key: order
    /// version: 2
    /// activities:
    ///   - id: subProcess
    ///   - id: userTask
    ///     parent: subProcess
    ///     boundary_events:
    ///       - id: boundary
    ///         trigger: { kind: message, name: cancel }
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ModelError> {
        let dto: ProcessDefinitionDto = serde_yaml::from_str(yaml)?;
        Self::from_dto(dto)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }
}

impl ProcessModel for ProcessDefinition {
    fn definition_id(&self) -> &str {
        &self.id
    }

    fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.get(id)
    }

    fn boundary_host(&self, boundary_id: &str) -> Option<&str> {
        self.boundary_hosts.get(boundary_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_event_makes_task_a_scope() {
        let plain = ProcessDefinitionDto::new("p").task("userTask").build().unwrap();
        assert!(!plain.is_scope("userTask"));

        let with_boundary = ProcessDefinitionDto::new("p")
            .task("userTask")
            .boundary("userTask", BoundaryEventDefinition::message("boundary", "msg"))
            .build()
            .unwrap();
        assert!(with_boundary.is_scope("userTask"));
        assert_eq!(with_boundary.boundary_host("boundary"), Some("userTask"));
        assert_eq!(
            with_boundary.boundary_definition("boundary").map(|d| d.kind()),
            Some(TriggerKind::Message)
        );
    }

    #[test]
    fn test_scope_chain_innermost_first() {
        let def = ProcessDefinitionDto::new("p")
            .sub_process("outer")
            .sub_process_in("outer", "inner")
            .task_in("inner", "task")
            .scope_task_in("inner", "scopeTask")
            .build()
            .unwrap();
        assert_eq!(def.scope_chain("task"), vec!["inner", "outer"]);
        assert_eq!(def.scope_chain("scopeTask"), vec!["scopeTask", "inner", "outer"]);
        assert!(def.scope_chain("missing").is_empty());
        assert_eq!(def.id(), "p:1");
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_parents() {
        let dup = ProcessDefinitionDto::new("p").task("a").task("a").build();
        assert!(matches!(dup, Err(ModelError::DuplicateId(id)) if id == "a"));

        let boundary_clash = ProcessDefinitionDto::new("p")
            .task("a")
            .boundary("a", BoundaryEventDefinition::signal("a", "sig"))
            .build();
        assert!(matches!(boundary_clash, Err(ModelError::DuplicateId(_))));

        let orphan = ProcessDefinitionDto::new("p").task_in("nowhere", "a").build();
        assert!(matches!(orphan, Err(ModelError::UnknownParent { .. })));

        let no_host = ProcessDefinitionDto::new("p")
            .task("a")
            .boundary("b", BoundaryEventDefinition::message("m", "msg"))
            .build();
        assert!(matches!(no_host, Err(ModelError::UnknownHost { host, .. }) if host == "b"));
    }

    #[test]
    fn test_parent_cycle_detected() {
        let dto = ProcessDefinitionDto {
            key: "p".into(),
            version: 1,
            activities: vec![
                ActivityDto {
                    id: "a".into(),
                    parent: Some("b".into()),
                    scope: false,
                    boundary_events: vec![],
                },
                ActivityDto {
                    id: "b".into(),
                    parent: Some("a".into()),
                    scope: false,
                    boundary_events: vec![],
                },
            ],
            attached: vec![],
        };
        assert!(matches!(
            ProcessDefinition::from_dto(dto),
            Err(ModelError::ParentCycle(_))
        ));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
key: order
version: 2
activities:
  - id: subProcess
  - id: userTask
    parent: subProcess
    boundary_events:
      - id: boundary
        trigger: { kind: signal, name: abort }
      - id: escalate
        interrupting: false
        trigger: { kind: escalation }
attached:
  - attached_to: subProcess
    id: timeout
    trigger:
      kind: timer
      schedule: { type: date, due_ms: 1700000000000 }
"#;
        let def = ProcessDefinition::from_yaml_str(yaml).unwrap();
        assert_eq!(def.id(), "order:2");
        assert!(def.is_scope("subProcess"));
        assert!(def.is_scope("userTask"));
        assert_eq!(def.parent("userTask"), Some("subProcess"));
        let defs = def.boundary_definitions("userTask");
        assert_eq!(defs.len(), 2);
        assert!(!defs[1].interrupting);
        assert_eq!(def.boundary_host("timeout"), Some("subProcess"));
    }
}
