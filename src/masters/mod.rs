//! Master (template) creation.
//!
//! One master is built per declared service, in dependency order: a service
//! built from another service's master waits for that master. Services on
//! the same dependency level are built concurrently up to the configured
//! limit. A failure only blocks the services built on top of the failed one.

use std::collections::BTreeMap;
use std::fmt;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::backend::{
    ClassifyError, ErrorClass, ImageSource, InstanceSpec, PowerState, Resource, ResourceKind,
    ResourcePath, ResourceSpec, VirtualizationClient,
};
use crate::namespace::{FolderTree, ensure_folder};
use crate::operation::{OperationError, RunSettings};
use crate::retry::{RetryPolicy, with_retry};
use crate::spec::{ServiceSource, ServiceSpec, SpecModel};

/// A service's master as observed in the backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Master {
    /// Service the master belongs to.
    pub service: String,
    /// Template resource.
    pub resource: Resource,
}

/// Masters that are ready to be cloned, in build order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MasterSet {
    masters: Vec<Master>,
}

impl MasterSet {
    /// Returns the master of `service`.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<&Resource> {
        self.masters
            .iter()
            .find(|master| master.service == service)
            .map(|master| &master.resource)
    }

    /// Iterates over masters in build order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Master> {
        self.masters.iter()
    }

    /// Number of masters.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.masters.len()
    }

    /// Reports whether the set is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    fn insert(&mut self, service: &str, resource: Resource) {
        self.masters.retain(|master| master.service != service);
        self.masters.push(Master {
            service: service.to_owned(),
            resource,
        });
    }
}

/// Result of ensuring one master.
#[derive(Debug)]
pub enum MasterOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// The master was built from scratch.
    Created,
    /// A half-built master (still an instance) was finished.
    Resumed,
    /// The master already existed as a template.
    AlreadyTemplate,
    /// Building the master failed.
    Failed(OperationError<E>),
    /// The master was skipped because the master it is built from failed.
    Blocked {
        /// Service whose master is missing.
        dependency: String,
    },
}

impl<E> MasterOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether the master is ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Created | Self::Resumed | Self::AlreadyTemplate)
    }
}

impl<E> fmt::Display for MasterOutcome<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Resumed => f.write_str("resumed"),
            Self::AlreadyTemplate => f.write_str("unchanged"),
            Self::Failed(err) => write!(f, "failed: {err}"),
            Self::Blocked { dependency } => {
                write!(f, "blocked: master of '{dependency}' is not ready")
            }
        }
    }
}

/// Outcome of the create-masters phase.
#[derive(Debug)]
pub struct MasterBuild<E>
where
    E: std::error::Error + 'static,
{
    /// Masters that are ready.
    pub masters: MasterSet,
    /// Per-service outcome.
    pub outcomes: BTreeMap<String, MasterOutcome<E>>,
}

impl<E> MasterBuild<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether every master is ready.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(MasterOutcome::is_ready)
    }

    /// Number of masters created or resumed by this run.
    #[must_use]
    pub fn built(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| matches!(outcome, MasterOutcome::Created | MasterOutcome::Resumed))
            .count()
    }

    /// Services whose master is not ready, with the reason.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &MasterOutcome<E>)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_ready())
            .map(|(service, outcome)| (service.as_str(), outcome))
    }
}

impl<E> fmt::Display for MasterBuild<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = self.outcomes.values().filter(|o| o.is_ready()).count();
        writeln!(
            f,
            "masters: {ready}/{} ready ({} built this run)",
            self.outcomes.len(),
            self.built()
        )?;
        for (service, outcome) in &self.outcomes {
            writeln!(f, "  {service}: {outcome}")?;
        }
        Ok(())
    }
}

enum Built {
    Created,
    Resumed,
    AlreadyTemplate,
}

/// Ensures one template exists per declared service.
///
/// Never fails as a whole: per-service results are reported in
/// [`MasterBuild::outcomes`].
pub async fn ensure_masters<C>(
    tree: &FolderTree,
    model: &SpecModel,
    client: &C,
    settings: &RunSettings,
) -> MasterBuild<C::Error>
where
    C: VirtualizationClient,
{
    let mut masters = MasterSet::default();
    let mut outcomes: BTreeMap<String, MasterOutcome<C::Error>> = BTreeMap::new();

    for level in dependency_levels(model) {
        let mut ready = Vec::new();
        for service in level {
            let Some(base) = service.base() else {
                ready.push((service, None));
                continue;
            };
            if let Some(resource) = masters.get(base) {
                ready.push((service, Some(resource.clone())));
            } else {
                warn!(
                    service = %service.name,
                    dependency = base,
                    "master blocked by failed dependency"
                );
                outcomes.insert(
                    service.name.clone(),
                    MasterOutcome::Blocked {
                        dependency: base.to_owned(),
                    },
                );
            }
        }

        let results: Vec<_> = stream::iter(ready)
            .map(|(service, base)| async move {
                let result =
                    build_master(tree, service, base.as_ref(), client, &settings.retry).await;
                (service, result)
            })
            .buffer_unordered(settings.concurrency_limit.max(1))
            .collect()
            .await;

        for (service, result) in results {
            let outcome = match result {
                Ok((resource, built)) => {
                    masters.insert(&service.name, resource);
                    match built {
                        Built::Created => MasterOutcome::Created,
                        Built::Resumed => MasterOutcome::Resumed,
                        Built::AlreadyTemplate => MasterOutcome::AlreadyTemplate,
                    }
                }
                Err(err) => {
                    warn!(service = %service.name, error = %err, "master failed");
                    MasterOutcome::Failed(err)
                }
            };
            outcomes.insert(service.name.clone(), outcome);
        }
    }

    // Keep the set in build order regardless of completion order.
    let order: Vec<&str> = model.build_order().map(|s| s.name.as_str()).collect();
    masters.masters.sort_by_key(|master| {
        order
            .iter()
            .position(|name| *name == master.service)
            .unwrap_or(usize::MAX)
    });

    MasterBuild { masters, outcomes }
}

/// Looks up existing masters without creating anything.
///
/// Services whose master is missing or not yet a template are left out; the
/// deploy phase reports their clones as having an unmet dependency.
///
/// # Errors
///
/// Returns the first backend failure encountered during lookup.
pub async fn discover_masters<C>(
    tree: &FolderTree,
    model: &SpecModel,
    client: &C,
    policy: &RetryPolicy,
) -> Result<MasterSet, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let mut masters = MasterSet::default();
    for service in model.build_order() {
        let Some(location) = tree.master_location(&service.name) else {
            continue;
        };
        match find(client, location, policy).await? {
            Some(resource) if resource.kind == ResourceKind::Template => {
                masters.insert(&service.name, resource);
            }
            Some(resource) => {
                debug!(service = %service.name, kind = %resource.kind, "master not finished");
            }
            None => debug!(service = %service.name, "master not found"),
        }
    }
    Ok(masters)
}

/// Groups services by dependency depth; each level only depends on earlier
/// levels.
fn dependency_levels(model: &SpecModel) -> Vec<Vec<&ServiceSpec>> {
    let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
    let mut levels: Vec<Vec<&ServiceSpec>> = Vec::new();
    for service in model.build_order() {
        let level = service
            .base()
            .and_then(|base| depth.get(base))
            .map_or(0, |base_depth| base_depth + 1);
        depth.insert(service.name.as_str(), level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        if let Some(bucket) = levels.get_mut(level) {
            bucket.push(service);
        }
    }
    levels
}

async fn find<C>(
    client: &C,
    path: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<Option<Resource>, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    with_retry(policy, &format!("find {path}"), move || client.find(path)).await
}

async fn build_master<C>(
    tree: &FolderTree,
    service: &ServiceSpec,
    base: Option<&Resource>,
    client: &C,
    policy: &RetryPolicy,
) -> Result<(Resource, Built), OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let location = tree
        .master_location(&service.name)
        .ok_or_else(|| OperationError::DependencyUnmet {
            resource: format!("service '{}'", service.name),
            requirement: String::from("a resolved master location"),
        })?;

    let expected_source = match (&service.source, base) {
        (ServiceSource::Base(_), Some(template)) => Some(&template.path),
        _ => None,
    };
    if let Some(existing) = find(client, location, policy).await? {
        return adopt(existing, expected_source, client, policy).await;
    }

    if let Some(parent) = location.parent() {
        ensure_folder(client, &parent, policy).await?;
    }
    let image = match (&service.source, base) {
        (ServiceSource::Image(label), _) => ImageSource::Image(label.clone()),
        (ServiceSource::Base(_), Some(template)) => ImageSource::Template(template.path.clone()),
        (ServiceSource::Base(name), None) => {
            return Err(OperationError::DependencyUnmet {
                resource: location.to_string(),
                requirement: format!("master of '{name}'"),
            });
        }
    };
    let spec = ResourceSpec::Instance(InstanceSpec {
        path: location.clone(),
        image,
        cpus: service.cpus,
        memory_mb: service.memory_mb,
        packages: service.packages.clone(),
        note: service.note.clone(),
    });
    let spec_ref = &spec;
    let instance = match with_retry(policy, &format!("create {location}"), move || {
        client.create(spec_ref)
    })
    .await
    {
        Ok(instance) => instance,
        Err(OperationError::Backend { source, .. })
            if source.class() == ErrorClass::AlreadyExists =>
        {
            let existing = find(client, location, policy).await?.ok_or_else(|| {
                OperationError::DependencyUnmet {
                    resource: location.to_string(),
                    requirement: String::from("master reported as existing but not found"),
                }
            })?;
            return adopt(existing, expected_source, client, policy).await;
        }
        Err(err) => return Err(err),
    };

    let template = finalize(instance, client, policy).await?;
    info!(service = %service.name, master = %template.path, "created master");
    Ok((template, Built::Created))
}

/// Accepts an existing master, finishing it when an earlier run stopped
/// before template conversion. A master built from anything other than
/// `expected_source` (the base master, or nothing for image-built services)
/// is left alone and reported.
async fn adopt<C>(
    existing: Resource,
    expected_source: Option<&ResourcePath>,
    client: &C,
    policy: &RetryPolicy,
) -> Result<(Resource, Built), OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    if matches!(existing.kind, ResourceKind::Template | ResourceKind::Instance)
        && existing.source.as_ref() != expected_source
    {
        let origin = existing
            .source
            .as_ref()
            .map_or_else(|| String::from("a provider image"), ToString::to_string);
        let wanted =
            expected_source.map_or_else(|| String::from("a provider image"), ToString::to_string);
        return Err(OperationError::Mismatch {
            resource: existing.path.to_string(),
            detail: format!("was built from {origin}, expected {wanted}"),
        });
    }
    match existing.kind {
        ResourceKind::Template => {
            debug!(master = %existing.path, "master already present");
            Ok((existing, Built::AlreadyTemplate))
        }
        ResourceKind::Instance => {
            info!(master = %existing.path, "resuming partially built master");
            let template = finalize(existing, client, policy).await?;
            Ok((template, Built::Resumed))
        }
        ResourceKind::Folder | ResourceKind::Network => Err(OperationError::Mismatch {
            resource: existing.path.to_string(),
            detail: format!("is a {} where a master is expected", existing.kind),
        }),
    }
}

/// Powers the instance off (if needed) and converts it into a template.
async fn finalize<C>(
    instance: Resource,
    client: &C,
    policy: &RetryPolicy,
) -> Result<Resource, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let target = &instance;
    if instance.power == PowerState::On {
        with_retry(policy, &format!("power off {}", instance.path), move || {
            client.power_off(target)
        })
        .await?;
    }
    with_retry(policy, &format!("convert {}", instance.path), move || {
        client.convert_to_template(target)
    })
    .await
}
