//! # mserve-events
//!
//! Audit events emitted by the serving reconciler.
//!
//! Exactly one event is emitted per terminal state-machine transition:
//! - `endpoint.committed` when a new desired state is durably applied
//! - `endpoint.rolled_back` when an operation fails and the prior declared
//!   state is restored
//! - `endpoint.deleted` when an endpoint and its resources are gone
//!
//! Events are records for an external audit sink. Nothing in the reconciler
//! reads them back to make decisions.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
