//! Phase state machine tying the engine together.
//!
//! An [`Exercise`] owns a validated specification, its resolved
//! [`FolderTree`], and a handle to the backend. Each phase method is
//! re-entrant: calling it again converges on the same backend state without
//! duplicating resources. The tracked [`Phase`] only moves forward when a
//! phase completes without failures.

use std::{fmt, io};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::VirtualizationClient;
use crate::cleanup::{self, CleanupReport};
use crate::deploy::{self, DeploymentReport};
use crate::masters::{self, MasterBuild, MasterSet};
use crate::namespace::{self, FolderTree, ResolveError};
use crate::operation::{OperationError, RunSettings};
use crate::spec::{self, GroupSpec, LoadError, SpecModel, Thresholds, ValidationError};

/// Orchestration stage an exercise has reached.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// The specification has not been checked.
    #[default]
    Unvalidated,
    /// The specification is valid and resolved to backend paths.
    Validated,
    /// Every master exists as a template.
    MastersReady,
    /// Every requested group is deployed.
    Deployed,
    /// Environments or masters have been removed.
    TornDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unvalidated => "unvalidated",
            Self::Validated => "validated",
            Self::MastersReady => "masters-ready",
            Self::Deployed => "deployed",
            Self::TornDown => "torn-down",
        };
        f.write_str(label)
    }
}

/// Phase reached by the specification identified by `spec_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExerciseState {
    /// Hex SHA-256 identity of the validated specification.
    pub spec_id: String,
    /// Current phase.
    pub phase: Phase,
}

/// Reasons a specification cannot be turned into an [`Exercise`].
#[derive(Debug, Error)]
pub enum PlanError {
    /// The specification file could not be read.
    #[error("failed to read {path}: {source}")]
    Unreadable {
        /// File that was requested.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The document is malformed or breaks a rule.
    #[error("invalid specification: {0}")]
    Validation(#[from] ValidationError),
    /// The document is valid but does not map onto distinct backend paths.
    #[error("invalid specification: {0}")]
    Resolve(#[from] ResolveError),
}

impl From<LoadError> for PlanError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Read { path, source } => Self::Unreadable { path, source },
            LoadError::Invalid(invalid) => Self::Validation(invalid),
        }
    }
}

/// Failures that stop a phase before any work item runs.
#[derive(Debug, Error)]
pub enum ExerciseError<E>
where
    E: std::error::Error + 'static,
{
    /// A group filter names a group the specification does not declare.
    #[error("unknown group '{name}'")]
    UnknownGroup {
        /// Name given in the filter.
        name: String,
    },
    /// Looking up existing masters in the backend failed.
    #[error("master discovery failed: {0}")]
    Discovery(#[source] OperationError<E>),
}

/// A validated exercise bound to a backend.
#[derive(Debug)]
pub struct Exercise<C> {
    client: Arc<C>,
    model: SpecModel,
    tree: FolderTree,
    settings: RunSettings,
    state: ExerciseState,
    masters: Option<MasterSet>,
}

impl<C> Exercise<C>
where
    C: VirtualizationClient + 'static,
{
    /// Validates and resolves `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when validation or name resolution fails.
    pub fn plan(
        raw: &str,
        thresholds: &Thresholds,
        client: Arc<C>,
        settings: RunSettings,
    ) -> Result<Self, PlanError> {
        let model = spec::parse_with(raw, thresholds)?;
        Ok(Self::from_model(model, client, settings)?)
    }

    /// Reads, validates, and resolves the specification at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Unreadable`] when the file cannot be read, and
    /// the other [`PlanError`] variants when it is invalid or does not
    /// resolve.
    pub fn load(
        path: &Utf8Path,
        thresholds: &Thresholds,
        client: Arc<C>,
        settings: RunSettings,
    ) -> Result<Self, PlanError> {
        let model = spec::load(path, thresholds)?;
        Ok(Self::from_model(model, client, settings)?)
    }

    /// Resolves an already validated model.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when names collide or VLAN tags run out.
    pub fn from_model(
        model: SpecModel,
        client: Arc<C>,
        settings: RunSettings,
    ) -> Result<Self, ResolveError> {
        let tree = namespace::resolve(&model)?;
        let state = ExerciseState {
            spec_id: model.identity().to_owned(),
            phase: Phase::Validated,
        };
        debug!(spec = %state.spec_id, root = %tree.root(), "exercise planned");
        Ok(Self {
            client,
            model,
            tree,
            settings,
            state,
            masters: None,
        })
    }

    /// Validated specification.
    #[must_use]
    pub const fn model(&self) -> &SpecModel {
        &self.model
    }

    /// Resolved backend paths.
    #[must_use]
    pub const fn tree(&self) -> &FolderTree {
        &self.tree
    }

    /// Current phase and specification identity.
    #[must_use]
    pub const fn state(&self) -> &ExerciseState {
        &self.state
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Masters known from the last build or discovery.
    #[must_use]
    pub const fn masters(&self) -> Option<&MasterSet> {
        self.masters.as_ref()
    }

    /// Builds or resumes every master.
    pub async fn create_masters(&mut self) -> MasterBuild<C::Error> {
        let build =
            masters::ensure_masters(&self.tree, &self.model, self.client.as_ref(), &self.settings)
                .await;
        self.masters = Some(build.masters.clone());
        if build.is_complete() && self.state.phase != Phase::Deployed {
            self.advance(Phase::MastersReady);
        }
        build
    }

    /// Deploys the groups named in `filter`, or every group when it is
    /// empty. A name matches an expanded group or every member of a
    /// template group.
    ///
    /// Masters come from the last [`Self::create_masters`] call when there
    /// was one, and are discovered from the backend otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ExerciseError`] for unknown group names or a failed master
    /// discovery. Per-item failures are reported in the
    /// [`DeploymentReport`].
    pub async fn deploy(
        &mut self,
        filter: &[String],
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport<C::Error>, ExerciseError<C::Error>> {
        let groups = self.select(filter)?;
        let known = self.known_masters().await?;
        let report = deploy::deploy(
            &groups,
            &known,
            &self.tree,
            Arc::clone(&self.client),
            &self.settings,
            cancel,
        )
        .await;
        if report.is_success() && !report.groups.is_empty() {
            self.advance(Phase::Deployed);
        }
        Ok(report)
    }

    /// Tears down the environments of the groups named in `filter`, or of
    /// every group when it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ExerciseError::UnknownGroup`] for unknown group names.
    pub async fn cleanup_environment(
        &mut self,
        filter: &[String],
    ) -> Result<CleanupReport<C::Error>, ExerciseError<C::Error>> {
        let groups = self.select(filter)?;
        let report = cleanup::cleanup_environment(
            &groups,
            &self.tree,
            self.client.as_ref(),
            &self.settings.retry,
        )
        .await;
        if report.is_success() && filter.is_empty() {
            self.advance(Phase::TornDown);
        }
        Ok(report)
    }

    /// Deletes every master that is no longer cloned from.
    ///
    /// # Errors
    ///
    /// Returns [`ExerciseError::Discovery`] when the masters cannot be
    /// looked up.
    pub async fn cleanup_masters(
        &mut self,
    ) -> Result<CleanupReport<C::Error>, ExerciseError<C::Error>> {
        let known = self.known_masters().await?;
        let report =
            cleanup::cleanup_masters(&known, &self.tree, self.client.as_ref(), &self.settings.retry)
                .await;
        if report.is_success() {
            self.masters = None;
            self.advance(Phase::TornDown);
        }
        Ok(report)
    }

    async fn known_masters(&mut self) -> Result<MasterSet, ExerciseError<C::Error>> {
        if let Some(known) = self.masters.as_ref().filter(|set| !set.is_empty()) {
            return Ok(known.clone());
        }
        let found = masters::discover_masters(
            &self.tree,
            &self.model,
            self.client.as_ref(),
            &self.settings.retry,
        )
        .await
        .map_err(ExerciseError::Discovery)?;
        debug!(found = found.len(), "discovered masters");
        self.masters = Some(found.clone());
        Ok(found)
    }

    fn select(&self, filter: &[String]) -> Result<Vec<GroupSpec>, ExerciseError<C::Error>> {
        let groups = self.model.groups();
        if let Some(unknown) = filter
            .iter()
            .find(|name| !groups.iter().any(|group| selects(group, name)))
        {
            return Err(ExerciseError::UnknownGroup {
                name: unknown.clone(),
            });
        }
        Ok(groups
            .iter()
            .filter(|group| filter.is_empty() || filter.iter().any(|name| selects(group, name)))
            .cloned()
            .collect())
    }

    fn advance(&mut self, phase: Phase) {
        if self.state.phase != phase {
            info!(
                spec = %self.state.spec_id,
                from = %self.state.phase,
                to = %phase,
                "phase changed"
            );
            self.state.phase = phase;
        }
    }
}

fn selects(group: &GroupSpec, name: &str) -> bool {
    group.name == name || group.template.as_deref() == Some(name)
}
