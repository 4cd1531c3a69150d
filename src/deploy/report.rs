//! Deployment results keyed by group and service.

use std::collections::BTreeMap;
use std::fmt;

use crate::network::NetworkHandle;
use crate::operation::OperationError;

/// Result of one group×service work item.
#[derive(Debug)]
pub enum ItemOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// A new clone was created, wired, and powered on.
    Deployed,
    /// An existing clone was missing attachments or power and was finished.
    Resumed,
    /// An existing clone already matched the plan.
    Unchanged,
    /// The work item failed.
    Failed(OperationError<E>),
}

impl<E> ItemOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether the clone is in its planned state.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl<E> fmt::Display for ItemOutcome<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployed => f.write_str("deployed"),
            Self::Resumed => f.write_str("resumed"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Aggregate status of one group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupStatus {
    /// Every clone is in place.
    Complete,
    /// Some clones are in place, others failed.
    Partial,
    /// No clone is in place, or the group's networks could not be set up.
    Failed,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Deployment result for one group.
#[derive(Debug)]
pub struct GroupReport<E>
where
    E: std::error::Error + 'static,
{
    /// Segments the group's clones attach to.
    pub networks: Vec<NetworkHandle>,
    /// Failure while preparing the namespace or networks; when set, no clone
    /// work was attempted.
    pub network_error: Option<OperationError<E>>,
    /// Outcome per clone, keyed by the clone name within the group.
    pub services: BTreeMap<String, ItemOutcome<E>>,
}

impl<E> GroupReport<E>
where
    E: std::error::Error + 'static,
{
    pub(super) const fn new() -> Self {
        Self {
            networks: Vec::new(),
            network_error: None,
            services: BTreeMap::new(),
        }
    }

    /// Aggregate status.
    #[must_use]
    pub fn status(&self) -> GroupStatus {
        if self.network_error.is_some() {
            return GroupStatus::Failed;
        }
        let succeeded = self.services.values().filter(|o| o.is_success()).count();
        if succeeded == self.services.len() {
            GroupStatus::Complete
        } else if succeeded == 0 {
            GroupStatus::Failed
        } else {
            GroupStatus::Partial
        }
    }

    /// Services whose work item failed.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &OperationError<E>)> {
        self.services
            .iter()
            .filter_map(|(service, outcome)| match outcome {
                ItemOutcome::Failed(err) => Some((service.as_str(), err)),
                _ => None,
            })
    }
}

/// Outcome of the deploy phase.
#[derive(Debug)]
pub struct DeploymentReport<E>
where
    E: std::error::Error + 'static,
{
    /// Per-group results.
    pub groups: BTreeMap<String, GroupReport<E>>,
    /// Groups that were requested but are disabled.
    pub skipped: Vec<String>,
}

impl<E> DeploymentReport<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether every group is complete.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.groups
            .values()
            .all(|group| group.status() == GroupStatus::Complete)
    }

    /// Status of `group`, if it was deployed.
    #[must_use]
    pub fn status_of(&self, group: &str) -> Option<GroupStatus> {
        self.groups.get(group).map(GroupReport::status)
    }

    /// Number of clones in their planned state.
    #[must_use]
    pub fn clones_in_place(&self) -> usize {
        self.groups
            .values()
            .flat_map(|group| group.services.values())
            .filter(|outcome| outcome.is_success())
            .count()
    }

    /// Number of failed work items, counting a network failure once per
    /// affected service.
    #[must_use]
    pub fn failed_items(&self) -> usize {
        self.groups
            .values()
            .flat_map(|group| group.services.values())
            .filter(|outcome| !outcome.is_success())
            .count()
    }
}

impl<E> fmt::Display for DeploymentReport<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let complete = self
            .groups
            .values()
            .filter(|group| group.status() == GroupStatus::Complete)
            .count();
        writeln!(
            f,
            "deploy: {complete}/{} groups complete, {} clones in place, {} failed, {} skipped",
            self.groups.len(),
            self.clones_in_place(),
            self.failed_items(),
            self.skipped.len()
        )?;
        for (name, group) in &self.groups {
            writeln!(f, "  {name}: {}", group.status())?;
            if let Some(err) = &group.network_error {
                writeln!(f, "    networks: {err}")?;
            }
            for (service, outcome) in &group.services {
                writeln!(f, "    {service}: {outcome}")?;
            }
        }
        for name in &self.skipped {
            writeln!(f, "  {name}: skipped (disabled)")?;
        }
        Ok(())
    }
}
