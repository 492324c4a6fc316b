//! # mserve-id
//!
//! Typed identifiers used by the serving control plane.
//!
//! Every identifier renders as `{prefix}_{ulid}`, e.g.
//! `ep_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The ULID part is immutable for the
//! lifetime of the resource, which is what lets cluster resource names be
//! derived from an endpoint id and stay stable across redeploys.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
