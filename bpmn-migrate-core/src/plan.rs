//! Migration plans: a 1:1 mapping from source activity ids to target
//! activity ids between two definitions.

use crate::model::ProcessModel;
use crate::types::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Activity {0} is mapped more than once")]
    DuplicateSource(String),

    #[error("Plan is for {side} definition {plan}, model is {model}")]
    DefinitionMismatch {
        side: &'static str,
        plan: String,
        model: String,
    },

    #[error("Unknown source activity: {0}")]
    UnknownSourceActivity(String),

    #[error("Unknown target activity: {0}")]
    UnknownTargetActivity(String),

    #[error("Cannot map {source_id} to {target_id}: {reason}")]
    IncompatibleMapping {
        source_id: String,
        target_id: String,
        reason: String,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInstruction {
    pub source_activity_id: ActivityId,
    pub target_activity_id: ActivityId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    source_definition_id: DefinitionId,
    target_definition_id: DefinitionId,
    instructions: Vec<MigrationInstruction>,
    by_source: BTreeMap<ActivityId, ActivityId>,
}

/// Upstream representation: a list of `[source, target]` pairs.
///
/// ```yaml
/// source: order:1
/// target: order:2
/// instructions:
///   - [userTask, userTask]
///   - [subProcess, subProcess]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlanDto {
    pub source: DefinitionId,
    pub target: DefinitionId,
    #[serde(default)]
    pub instructions: Vec<(ActivityId, ActivityId)>,
}

pub struct MigrationPlanBuilder {
    source_definition_id: DefinitionId,
    target_definition_id: DefinitionId,
    instructions: Vec<MigrationInstruction>,
}

impl MigrationPlanBuilder {
    pub fn map_activities(mut self, source: &str, target: &str) -> Self {
        self.instructions.push(MigrationInstruction {
            source_activity_id: source.to_string(),
            target_activity_id: target.to_string(),
        });
        self
    }

    pub fn build(self) -> Result<MigrationPlan, PlanError> {
        let mut by_source = BTreeMap::new();
        for instruction in &self.instructions {
            if by_source
                .insert(
                    instruction.source_activity_id.clone(),
                    instruction.target_activity_id.clone(),
                )
                .is_some()
            {
                return Err(PlanError::DuplicateSource(
                    instruction.source_activity_id.clone(),
                ));
            }
        }
        Ok(MigrationPlan {
            source_definition_id: self.source_definition_id,
            target_definition_id: self.target_definition_id,
            instructions: self.instructions,
            by_source,
        })
    }
}

impl MigrationPlan {
    pub fn builder(source_definition_id: &str, target_definition_id: &str) -> MigrationPlanBuilder {
        MigrationPlanBuilder {
            source_definition_id: source_definition_id.to_string(),
            target_definition_id: target_definition_id.to_string(),
            instructions: Vec::new(),
        }
    }

    pub fn from_dto(dto: MigrationPlanDto) -> Result<Self, PlanError> {
        dto.instructions
            .iter()
            .fold(Self::builder(&dto.source, &dto.target), |b, (s, t)| {
                b.map_activities(s, t)
            })
            .build()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, PlanError> {
        let dto: MigrationPlanDto = serde_yaml::from_str(yaml)?;
        Self::from_dto(dto)
    }

    pub fn to_dto(&self) -> MigrationPlanDto {
        MigrationPlanDto {
            source: self.source_definition_id.clone(),
            target: self.target_definition_id.clone(),
            instructions: self
                .instructions
                .iter()
                .map(|i| (i.source_activity_id.clone(), i.target_activity_id.clone()))
                .collect(),
        }
    }

    pub fn source_definition_id(&self) -> &str {
        &self.source_definition_id
    }

    pub fn target_definition_id(&self) -> &str {
        &self.target_definition_id
    }

    pub fn instructions(&self) -> &[MigrationInstruction] {
        &self.instructions
    }

    pub fn target_for(&self, source_activity_id: &str) -> Option<&str> {
        self.by_source.get(source_activity_id).map(String::as_str)
    }

    /// Target boundary event id for a source boundary: the explicit mapping,
    /// else the same id.
    pub fn boundary_counterpart<'a>(&'a self, source_boundary_id: &'a str) -> &'a str {
        self.target_for(source_boundary_id)
            .unwrap_or(source_boundary_id)
    }

    /// SHA-256 (hex) over the definition pair and the instructions sorted by
    /// source id. Instruction order does not change the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_definition_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.target_definition_id.as_bytes());
        for (source, target) in &self.by_source {
            hasher.update([0u8]);
            hasher.update(source.as_bytes());
            hasher.update([b'>']);
            hasher.update(target.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Check the plan against both definitions: ids resolve, activities map
    /// to activities, boundary events map to boundary events of the same
    /// trigger kind, hosted by the target of their host's mapping.
    pub fn validate(
        &self,
        source: &dyn ProcessModel,
        target: &dyn ProcessModel,
    ) -> Result<(), PlanError> {
        if source.definition_id() != self.source_definition_id {
            return Err(PlanError::DefinitionMismatch {
                side: "source",
                plan: self.source_definition_id.clone(),
                model: source.definition_id().to_string(),
            });
        }
        if target.definition_id() != self.target_definition_id {
            return Err(PlanError::DefinitionMismatch {
                side: "target",
                plan: self.target_definition_id.clone(),
                model: target.definition_id().to_string(),
            });
        }

        for instruction in &self.instructions {
            let (s, t) = (
                instruction.source_activity_id.as_str(),
                instruction.target_activity_id.as_str(),
            );
            let incompatible = |reason: &str| PlanError::IncompatibleMapping {
                source_id: s.to_string(),
                target_id: t.to_string(),
                reason: reason.to_string(),
            };

            match (source.boundary_definition(s), target.boundary_definition(t)) {
                (Some(sb), Some(tb)) => {
                    if sb.kind() != tb.kind() {
                        return Err(incompatible("boundary trigger kinds differ"));
                    }
                    let source_host = source.boundary_host(s).unwrap_or_default();
                    let target_host = target.boundary_host(t).unwrap_or_default();
                    if let Some(mapped) = self.target_for(source_host) {
                        if mapped != target_host {
                            return Err(incompatible("boundary host is mapped elsewhere"));
                        }
                    }
                }
                (Some(_), None) if target.activity(t).is_some() => {
                    return Err(incompatible("boundary event mapped to an activity"))
                }
                (None, Some(_)) if source.activity(s).is_some() => {
                    return Err(incompatible("activity mapped to a boundary event"))
                }
                (None, _) if source.activity(s).is_none() => {
                    return Err(PlanError::UnknownSourceActivity(s.to_string()))
                }
                (_, None) if target.activity(t).is_none() => {
                    return Err(PlanError::UnknownTargetActivity(t.to_string()))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessDefinitionDto;

    fn models() -> (impl ProcessModel, impl ProcessModel) {
        let source = ProcessDefinitionDto::new("p")
            .task("userTask")
            .boundary("userTask", BoundaryEventDefinition::message("boundary", "msg"))
            .build()
            .unwrap();
        let target = ProcessDefinitionDto::new("p")
            .with_version(2)
            .task("userTask")
            .task("otherTask")
            .boundary("userTask", BoundaryEventDefinition::message("renamed", "msg"))
            .boundary("otherTask", BoundaryEventDefinition::signal("signal", "sig"))
            .build()
            .unwrap();
        (source, target)
    }

    #[test]
    fn test_builder_rejects_duplicate_source() {
        let plan = MigrationPlan::builder("p:1", "p:2")
            .map_activities("a", "a")
            .map_activities("a", "b")
            .build();
        assert!(matches!(plan, Err(PlanError::DuplicateSource(s)) if s == "a"));
    }

    #[test]
    fn test_fingerprint_ignores_instruction_order() {
        let a = MigrationPlan::builder("p:1", "p:2")
            .map_activities("x", "x")
            .map_activities("y", "z")
            .build()
            .unwrap();
        let b = MigrationPlan::builder("p:1", "p:2")
            .map_activities("y", "z")
            .map_activities("x", "x")
            .build()
            .unwrap();
        let c = MigrationPlan::builder("p:1", "p:2")
            .map_activities("x", "x")
            .build()
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_yaml_pairs() {
        let yaml = r#"
source: p:1
target: p:2
instructions:
  - [userTask, userTask]
  - [boundary, renamed]
"#;
        let plan = MigrationPlan::from_yaml_str(yaml).unwrap();
        assert_eq!(plan.target_for("boundary"), Some("renamed"));
        assert_eq!(plan.boundary_counterpart("boundary"), "renamed");
        assert_eq!(plan.boundary_counterpart("other"), "other");
        assert_eq!(plan.instructions().len(), 2);
        let (source, target) = models();
        plan.validate(&source, &target).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_mappings() {
        let (source, target) = models();
        let check = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .fold(MigrationPlan::builder("p:1", "p:2"), |b, (s, t)| {
                    b.map_activities(s, t)
                })
                .build()
                .unwrap()
                .validate(&source, &target)
        };
        assert!(matches!(
            check(&[("missing", "userTask")]),
            Err(PlanError::UnknownSourceActivity(_))
        ));
        assert!(matches!(
            check(&[("userTask", "missing")]),
            Err(PlanError::UnknownTargetActivity(_))
        ));
        assert!(matches!(
            check(&[("boundary", "userTask")]),
            Err(PlanError::IncompatibleMapping { .. })
        ));
        assert!(matches!(
            check(&[("boundary", "signal")]),
            Err(PlanError::IncompatibleMapping { .. })
        ));
        assert!(matches!(
            MigrationPlan::builder("p:9", "p:2")
                .build()
                .unwrap()
                .validate(&source, &target),
            Err(PlanError::DefinitionMismatch { side: "source", .. })
        ));
    }
}
