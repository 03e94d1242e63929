//! bpmn-migrate - dry-run instance migration between process definitions
//!
//! Usage:
//!   bpmn-migrate migrate --source order.yaml --target order-v2.yaml --leaf review
//!   bpmn-migrate migrate --source scope-task --target one-task:2 --leaf userTask
//!   bpmn-migrate describe --definition parallel-gateway --leaf userTask1 --leaf userTask2
//!
//! Definitions are YAML files or fixture names (`name[:version]`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bpmn_migrate_core::{
    fixtures, instantiate, project, start_instance, MemoryScheduler, MemoryStore,
    MigrationConfig, MigrationEngine, MigrationPlan, ProcessDefinition, ProcessModel,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bpmn-migrate")]
#[command(about = "Migrate a running process instance to another definition")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an in-memory instance and migrate it
    Migrate {
        /// Source definition (YAML path or fixture name)
        #[arg(long)]
        source: String,
        /// Target definition (YAML path or fixture name)
        #[arg(long)]
        target: String,
        /// Migration plan YAML; defaults to mapping every leaf onto itself
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Activity the instance is waiting in (repeatable)
        #[arg(long = "leaf", required = true)]
        leaves: Vec<String>,
        /// Migration config YAML
        #[arg(long, env = "BPMN_MIGRATE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show the execution tree a fresh instance would have
    Describe {
        #[arg(long)]
        definition: String,
        #[arg(long = "leaf", required = true)]
        leaves: Vec<String>,
    },

    /// List built-in fixture definitions
    Fixtures,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Migrate {
            source,
            target,
            plan,
            leaves,
            config,
        } => migrate(&source, &target, plan, &leaves, config).await,
        Command::Describe { definition, leaves } => {
            let model = load_definition(&definition)?;
            let leaves: Vec<&str> = leaves.iter().map(String::as_str).collect();
            let tree = instantiate(&model, Uuid::now_v7(), &leaves)?;
            println!("{}", tree.describe());
            println!("{}", project(&tree, &model)?.describe());
            Ok(())
        }
        Command::Fixtures => {
            for name in fixtures::NAMES {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn migrate(
    source: &str,
    target: &str,
    plan: Option<PathBuf>,
    leaves: &[String],
    config: Option<PathBuf>,
) -> Result<()> {
    let source = load_definition(source)?;
    let target = load_definition(target)?;
    let config = match config {
        Some(path) => MigrationConfig::load_from_file(path)?,
        None => MigrationConfig::default(),
    };
    let leaves: Vec<&str> = leaves.iter().map(String::as_str).collect();
    let plan = match plan {
        Some(path) => {
            let yaml = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plan: {}", path.display()))?;
            MigrationPlan::from_yaml_str(&yaml)
                .with_context(|| format!("Invalid plan: {}", path.display()))?
        }
        None => leaves
            .iter()
            .fold(MigrationPlan::builder(source.id(), target.id()), |b, a| {
                b.map_activities(a, a)
            })
            .build()?,
    };

    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(MemoryScheduler::new());
    let started = start_instance(store.as_ref(), scheduler.as_ref(), &source, &leaves).await?;
    let instance_id = started.instance.instance_id;
    tracing::info!(process_instance_id = %instance_id, "Started in-memory instance");
    let engine = MigrationEngine::new(
        store.clone(),
        scheduler.clone(),
        vec![
            Arc::new(source.clone()) as Arc<dyn ProcessModel>,
            Arc::new(target.clone()),
        ],
        config,
    );

    println!("── {} ──", source.id());
    println!("{}", started.tree.describe());
    println!("{}", engine.activity_instance_tree(instance_id).await?.describe());

    let report = engine.migrate(instance_id, &plan).await?;
    let migrated = engine.snapshot(instance_id).await?;

    println!("── {} (revision {}) ──", target.id(), report.revision);
    println!("{}", migrated.tree.describe());
    println!("{}", engine.activity_instance_tree(instance_id).await?.describe());
    println!(
        "executions: {} reused, {} created, {} removed",
        report.reused_executions, report.created_executions, report.removed_executions
    );
    println!(
        "subscriptions: {} retained, {} created, {} removed",
        report.delta.retained_subscriptions.len(),
        report.delta.created_subscriptions.len(),
        report.delta.removed_subscriptions.len()
    );
    println!(
        "timers: {} retained, {} scheduled, {} cancelled",
        report.delta.retained_timers.len(),
        report.scheduled_timers.len(),
        report.delta.removed_timers.len()
    );
    println!("plan: {}", plan.fingerprint());
    Ok(())
}

fn load_definition(spec: &str) -> Result<ProcessDefinition> {
    if spec.ends_with(".yaml") || spec.ends_with(".yml") {
        let yaml = std::fs::read_to_string(spec)
            .with_context(|| format!("Failed to read definition: {spec}"))?;
        return ProcessDefinition::from_yaml_str(&yaml)
            .with_context(|| format!("Invalid definition: {spec}"));
    }
    let (name, version) = match spec.split_once(':') {
        Some((name, version)) => (
            name,
            version
                .parse::<u32>()
                .with_context(|| format!("Invalid fixture version: {spec}"))?,
        ),
        None => (spec, 1),
    };
    let dto = fixtures::by_name(name).with_context(|| {
        format!(
            "Unknown fixture '{name}', expected one of: {}",
            fixtures::NAMES.join(", ")
        )
    })?;
    Ok(dto.with_version(version).build()?)
}
