//! Symphony - blue/green migration operator for Helm releases
//!
//! A `Migration` custom resource lists the Helm releases of one application
//! (typically `<app>-blue` and `<app>-green`), the chart they share and the
//! values of each. The operator drives the release backend toward that list
//! one step per pass and reports per-release availability, derived from the
//! application's Deployments, in the Migration's status.
//!
//! # Modules
//!
//! - [`crd`] - the Migration custom resource and its status types
//! - [`controller`] - work-queue driven reconciliation and status projection
//! - [`queue`] - deduplicating, rate-limited work queue
//! - [`observer`] - watch-backed object caches and change notifications
//! - [`release`] - release backend abstraction and the Helm CLI backend
//! - [`workload`] - Deployment observations keyed by release
//! - [`store`] - Migration reads and status writes
//! - [`events`] - Kubernetes Event publishing
//! - [`keys`] - label, key and naming conventions
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod keys;
pub mod observer;
pub mod queue;
pub mod release;
pub mod store;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name the operator reports as, used for Events and as the field manager
pub const CONTROLLER_NAME: &str = "symphony-operator";
