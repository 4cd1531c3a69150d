//! Command-line interface definitions for the `labwright` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser};

/// Top-level CLI for the `labwright` binary.
#[derive(Debug, Parser)]
#[command(
    name = "labwright",
    about = "Provision and tear down isolated multi-tenant virtual labs",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Check a specification without touching the backend.
    #[command(name = "validate", about = "Check a specification without touching the backend")]
    Validate(SpecArgs),
    /// Build one template per service.
    #[command(name = "create-masters", about = "Build one template per service")]
    CreateMasters(SpecArgs),
    /// Clone masters into isolated per-group environments.
    #[command(name = "deploy", about = "Clone masters into isolated per-group environments")]
    Deploy(DeployCommand),
    /// Delete masters that no environment still clones from.
    #[command(
        name = "cleanup-masters",
        about = "Delete masters that no environment still clones from"
    )]
    CleanupMasters(SpecArgs),
    /// Tear down group environments.
    #[command(name = "cleanup-environment", about = "Tear down group environments")]
    CleanupEnvironment(CleanupEnvironmentCommand),
}

/// Arguments shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct SpecArgs {
    /// Path to the exercise specification (YAML).
    #[arg(long, value_name = "PATH")]
    pub(crate) spec: PathBuf,
}

/// Arguments for the `labwright deploy` subcommand.
#[derive(Debug, Args)]
pub(crate) struct DeployCommand {
    #[command(flatten)]
    pub(crate) spec: SpecArgs,
    /// Override the maximum number of clones provisioned at once.
    #[arg(long, value_name = "N")]
    pub(crate) concurrency: Option<u32>,
    /// Deploy only this group (or every member of this template group).
    /// May be repeated.
    #[arg(long = "group", value_name = "NAME")]
    pub(crate) groups: Vec<String>,
}

/// Arguments for the `labwright cleanup-environment` subcommand.
#[derive(Debug, Args)]
pub(crate) struct CleanupEnvironmentCommand {
    #[command(flatten)]
    pub(crate) spec: SpecArgs,
    /// Tear down only this group (or every member of this template group).
    /// May be repeated.
    #[arg(long = "group", value_name = "NAME")]
    pub(crate) groups: Vec<String>,
}
