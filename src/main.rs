//! Binary entry point for the labwright CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{CleanupEnvironmentCommand, Cli, DeployCommand, SpecArgs};
use labwright::config::{ConfigError, LabConfig};
use labwright::exercise::{Exercise, ExerciseError, PlanError};
use labwright::namespace;
use labwright::operation::RunSettings;
use labwright::simulated::{SimulatedClient, SimulatedError};
use labwright::spec;

/// Every planned item succeeded.
const EXIT_SUCCESS: i32 = 0;
/// The phase ran but one or more work items failed.
const EXIT_ITEM_FAILURES: i32 = 1;
/// The specification is invalid or its names collide.
const EXIT_INVALID_SPEC: i32 = 2;
/// Configuration, backend, or I/O failure, including an unreadable
/// specification file.
const EXIT_FAILURE: i32 = 3;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("specification path {0} is not valid UTF-8")]
    SpecPath(String),
    #[error("backend error: {0}")]
    Backend(#[from] SimulatedError),
    #[error(transparent)]
    Exercise(#[from] ExerciseError<SimulatedError>),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Plan(PlanError::Unreadable { .. }) => EXIT_FAILURE,
            Self::Plan(_) | Self::Exercise(ExerciseError::UnknownGroup { .. }) => {
                EXIT_INVALID_SPEC
            }
            Self::Config(_) | Self::SpecPath(_) | Self::Backend(_) | Self::Exercise(_) => {
                EXIT_FAILURE
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

/// Reads `RUST_LOG`, defaulting to `warn`, and logs compactly to stderr.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).compact())
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = load_config()?;
    match cli {
        Cli::Validate(args) => validate(&args, &config),
        Cli::CreateMasters(args) => create_masters(&args, &config).await,
        Cli::Deploy(command) => deploy(&command, &config).await,
        Cli::CleanupMasters(args) => cleanup_masters(&args, &config).await,
        Cli::CleanupEnvironment(command) => cleanup_environment(&command, &config).await,
    }
}

fn load_config() -> Result<LabConfig, CliError> {
    let config = LabConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn spec_path(args: &SpecArgs) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(args.spec.clone())
        .map_err(|path| CliError::SpecPath(path.display().to_string()))
}

fn validate(args: &SpecArgs, config: &LabConfig) -> Result<i32, CliError> {
    let path = spec_path(args)?;
    let model = spec::load(&path, &config.thresholds()).map_err(PlanError::from)?;
    let tree = namespace::resolve(&model).map_err(PlanError::from)?;
    let groups = model.enabled_groups().count();
    emit(&format!(
        "{path}: valid ({} services, {} networks, {groups} groups, {} clones planned under {})\nidentity {}\n",
        model.services().len(),
        model.networks().len(),
        model.planned_clone_count(),
        tree.root(),
        model.identity()
    ));
    Ok(EXIT_SUCCESS)
}

fn open_exercise(
    args: &SpecArgs,
    config: &LabConfig,
    settings: RunSettings,
) -> Result<Exercise<SimulatedClient>, CliError> {
    let path = spec_path(args)?;
    let client = Arc::new(SimulatedClient::open(&config.state_file_path())?);
    Ok(Exercise::load(&path, &config.thresholds(), client, settings)?)
}

async fn create_masters(args: &SpecArgs, config: &LabConfig) -> Result<i32, CliError> {
    let mut exercise = open_exercise(args, config, config.run_settings())?;
    let build = exercise.create_masters().await;
    emit(&build.to_string());
    Ok(outcome_code(build.is_complete()))
}

async fn deploy(command: &DeployCommand, config: &LabConfig) -> Result<i32, CliError> {
    let mut settings = config.run_settings();
    if let Some(limit) = command.concurrency {
        settings = RunSettings::new(usize::try_from(limit).unwrap_or(usize::MAX), settings.retry);
    }
    let mut exercise = open_exercise(&command.spec, config, settings)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; letting in-flight work finish");
            interrupt.cancel();
        }
    });

    let report = exercise.deploy(&command.groups, &cancel).await?;
    emit(&report.to_string());
    info!(phase = %exercise.phase(), "deploy finished");
    Ok(outcome_code(report.is_success()))
}

async fn cleanup_masters(args: &SpecArgs, config: &LabConfig) -> Result<i32, CliError> {
    let mut exercise = open_exercise(args, config, config.run_settings())?;
    let report = exercise.cleanup_masters().await?;
    emit(&report.to_string());
    Ok(outcome_code(report.is_success()))
}

async fn cleanup_environment(
    command: &CleanupEnvironmentCommand,
    config: &LabConfig,
) -> Result<i32, CliError> {
    let mut exercise = open_exercise(&command.spec, config, config.run_settings())?;
    let report = exercise.cleanup_environment(&command.groups).await?;
    emit(&report.to_string());
    Ok(outcome_code(report.is_success()))
}

const fn outcome_code(success: bool) -> i32 {
    if success {
        EXIT_SUCCESS
    } else {
        EXIT_ITEM_FAILURES
    }
}

fn emit(text: &str) {
    write!(io::stdout(), "{text}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
