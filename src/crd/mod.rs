//! Custom Resource Definitions for Symphony
//!
//! This module contains the Migration CRD and its supporting types.

mod migration;
mod types;

pub use migration::{Migration, MigrationSpec, MigrationStatus};
pub use types::{upsert_condition, Condition, ConditionStatus, MigrationAction, ReleaseConfig};
