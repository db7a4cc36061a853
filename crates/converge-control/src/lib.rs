//! Converge engine for asynchronous cloud control planes.
//!
//! The remote control plane executes every mutation asynchronously: a write
//! returns a pending operation that has to be polled to completion, and
//! many resources hold many-to-many relationships that have to be
//! reconciled rather than replaced. This crate tracks operations to
//! completion and sequences multi-step mutations safely.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Caller (declarative resource manager)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConvergeService                          │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐   │
//! │  │  Resource   │ │ Orchestrator│ │   Relationship      │   │
//! │  │  Planners   │ │ (pre/post)  │ │   Diff Engine       │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘   │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐   │
//! │  │  Operation  │ │   Error     │ │   Cancellation      │   │
//! │  │  Tracker    │ │  Classifier │ │   & Deadlines       │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                   ┌─────────────────────┐
//!                   │  CloudApi (client)  │
//!                   └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use converge_control::{ConvergeService, ResourceManager, VolumeConfig};
//! # use converge_control::CloudApi;
//!
//! # async fn example<A: CloudApi>(client: A) -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConvergeService::from_env(Arc::new(client))?;
//!
//! let config = VolumeConfig::new("data", 40, "zone-a");
//! let report = service.create_volume(&config).await?;
//!
//! println!("Created {}", report.target);
//! # Ok(())
//! # }
//! ```
//!
//! # Failure model
//!
//! Plans are executed best-effort, not atomically. A failed plan never
//! rolls back what it already applied; instead the error states exactly
//! which steps failed so the next reconciliation pass can finish the job.
//! Instances powered off for a mutation are always powered back on.
//!
//! See the [`classify`] module for how failures are sorted into retryable
//! and final ones.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod cancel;
pub mod classify;
pub mod diff;
pub mod error;
pub mod lifecycle;
pub mod operation;
pub mod orchestrator;
pub mod plan;
pub mod resources;
pub mod service;
pub mod tracker;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use api::{
    ApiError, ApiResult, CloudApi, DiskType, Member, MutationAction, MutationRequest, PowerState,
    Relation, ResourceState, TransportFault,
};
pub use cancel::{CancelHandle, CancelReason, Cancellation};
pub use classify::{classify, ErrorClass};
pub use diff::{
    diff, diff_map, diff_members, ApiPicker, Diff, MapDiff, MemberPicker, MemberSlot,
};
pub use error::{ControlError, Result};
pub use operation::{OperationHandle, OperationStatus, STATUS_ERROR, STATUS_SUCCESS};
pub use orchestrator::execute;
pub use plan::{
    ChangeAction, DesiredMembers, MemberChange, MemberFailure, MutationPlan, PlanReport,
    RelationChange, SideEffect,
};
pub use resources::{InstanceConfig, LoadBalancerConfig, VolumeConfig};
pub use service::{ConvergeService, ResourceManager};
pub use tracker::{track, track_to_success};
pub use types::{ControlConfig, RetryPolicy};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockCloud;

// Re-export commonly used types from dependencies for convenience
pub use converge_core::{OperationId, ResourceId, ResourceKind, Target};
