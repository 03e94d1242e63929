//! Live process-instance migration
//!
//! Moves a running process instance from one process definition version to
//! another without losing its position.
//!
//! ```text
//! ExecutionTree (source)
//!       │
//!       ▼
//! ┌────────────────────────────────────────┐
//! │  MigrationMatcher                      │
//! │  reuse / create / remove per execution │
//! └────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌────────────────────────────────────────┐
//! │  EventReconciler                       │
//! │  subscriptions + timer jobs delta      │
//! └────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌────────────────────────────────────────┐
//! │  MigrationExecutor                     │
//! │  scheduler calls, one atomic commit    │
//! └────────────────────────────────────────┘
//!       │
//!       ▼
//! ExecutionTree (target)
//! ```

pub mod activity_tree;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod fixtures;
pub mod instantiate;
pub mod matcher;
pub mod model;
pub mod plan;
pub mod reconcile;
pub mod scheduler;
mod shape;
pub mod store;
pub mod store_memory;
pub mod tree;
pub mod types;

pub use activity_tree::{project, ActivityInstance, ActivityShape};
pub use config::MigrationConfig;
pub use engine::{MigrationEngine, MigrationReport};
pub use error::MigrationError;
pub use events::MigrationEvent;
pub use executor::{MigrationExecutor, PreparedMigration, TimerSync};
pub use instantiate::{instantiate, start_instance};
pub use matcher::{MigrationInstanceTree, MigrationMatcher, MigrationNode, Resolution};
pub use model::{ModelError, ProcessDefinition, ProcessDefinitionDto, ProcessModel};
pub use plan::{MigrationPlan, MigrationPlanDto, PlanError};
pub use reconcile::{EventReconciler, ReconciliationDelta};
pub use scheduler::{MemoryScheduler, SchedulerCall, SchedulerError, TimerScheduler};
pub use store::{InstanceSnapshot, MigrationStore};
pub use store_memory::MemoryStore;
pub use tree::{ExecutionTree, TreeError};
pub use types::*;
