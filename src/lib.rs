//! Core library for the labwright virtual lab orchestrator.
//!
//! A declarative exercise specification names services, networks, folders,
//! and tenant groups. The engine validates it, resolves every logical name
//! to a deterministic backend path, builds one template ("master") per
//! service, fans the masters out into isolated per-group clones, and tears
//! everything down again. All backend access goes through the
//! [`VirtualizationClient`] trait; [`SimulatedClient`] is the in-process
//! implementation the binary drives.

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod deploy;
pub mod exercise;
pub mod masters;
pub mod namespace;
pub mod network;
pub mod operation;
pub mod retry;
pub mod simulated;
pub mod spec;
pub mod test_support;

pub use backend::{
    ClassifyError, ErrorClass, Resource, ResourceKind, ResourcePath, VirtualizationClient,
};
pub use cleanup::{CleanupReport, cleanup_environment, cleanup_masters};
pub use config::{ConfigError, LabConfig};
pub use deploy::{DeploymentReport, GroupStatus, ItemOutcome, deploy};
pub use exercise::{Exercise, ExerciseError, ExerciseState, Phase, PlanError};
pub use masters::{MasterBuild, MasterOutcome, MasterSet, discover_masters, ensure_masters};
pub use namespace::{FolderTree, NamingCollision, ResolveError, resolve};
pub use network::{NetworkHandle, ensure_group_networks, ensure_isolated_network};
pub use operation::{OperationError, RunSettings};
pub use retry::{RetryPolicy, with_retry};
pub use simulated::{SimulatedClient, SimulatedError};
pub use spec::{SpecModel, ValidationError};
