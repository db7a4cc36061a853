//! Core types for converge.
//!
//! This crate provides the foundational types shared by the converge crates:
//!
//! - **Identifiers**: integer ids for remote resources and operations
//! - **Targets**: kind + local name + remote id, the context every error carries
//! - **Error types**: common error definitions
//!
//! # Example
//!
//! ```
//! use converge_core::{ResourceId, ResourceKind, Target};
//!
//! let volume = Target::new(ResourceKind::Volume, "data", ResourceId::new(113));
//! assert_eq!(volume.to_string(), "volume \"data\" (id 113)");
//!
//! let id: ResourceId = "42".parse().unwrap();
//! assert!(!id.is_unset());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;

pub use error::{CoreError, Result};
pub use ids::{IdError, OperationId, ResourceId, ResourceKind, Target};
