use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_scheduler_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// Migration engine settings.
///
/// ```yaml
/// scheduler_concurrency: 4
/// verify_projection: true
/// record_events: false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Maximum in-flight scheduler calls within one migration step.
    #[serde(default = "default_scheduler_concurrency")]
    pub scheduler_concurrency: usize,

    /// Validate and project the new tree against the target model before any
    /// external side effect.
    #[serde(default = "default_true")]
    pub verify_projection: bool,

    #[serde(default = "default_true")]
    pub record_events: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            scheduler_concurrency: default_scheduler_concurrency(),
            verify_projection: true,
            record_events: true,
        }
    }
}

impl MigrationConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse migration config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read migration config: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid migration config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler_concurrency == 0 {
            anyhow::bail!("scheduler_concurrency must be at least 1");
        }
        Ok(())
    }
}
