//! Serving endpoint reconciliation.
//!
//! An endpoint is a row in the store plus a set of cluster resources derived
//! from it. The [`orchestrator::Orchestrator`] moves both together under a
//! per-endpoint lock; everything else in this module is a building block it
//! drives.

pub mod audit;
pub mod catalog;
pub mod cluster;
pub mod confirm;
pub mod create;
pub mod error;
pub mod manifests;
pub mod model;
pub mod naming;
pub mod orchestrator;
pub mod resolve;
pub mod status;
pub mod store;
pub mod worker;

pub use error::ReconcileError;
pub use orchestrator::{OperationContext, Orchestrator, OrchestratorDeps, ReconcilerConfig};
