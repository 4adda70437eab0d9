//! # nodereap-id
//!
//! Identifier types shared by the nodereap crates.
//!
//! ## Design Principles
//!
//! - Keys are ground truth handed to us by external systems; nodereap never
//!   generates one
//! - All keys have a canonical string representation with strict parsing
//! - Keys are typed so a registry node id can't be passed where a
//!   correlation key is expected
//!
//! ## Key Kinds
//!
//! - [`CorrelationKey`]: the value that ties a registry node record to its
//!   compute instance (for Docker Cloud nodes, the node UUID, copied onto the
//!   instance as a tag)
//! - [`NodeId`]: registry-native node identifier
//! - [`InstanceId`]: compute-provider-native instance identifier (`i-...`)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
