//! Fan-out of masters into per-group clones.
//!
//! A group is only touched once the master of every service it selects is
//! ready. Each group first gets its namespace folder and network segments.
//! Only then are its group×service work items submitted to a shared worker pool
//! bounded by a semaphore. A clone is attached to every segment of its group
//! before it is powered on. Failures stay with the work item that raised
//! them; sibling items and other groups carry on.

mod report;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    ClassifyError, ErrorClass, PowerState, Resource, ResourceKind, ResourcePath,
    VirtualizationClient,
};
use crate::masters::MasterSet;
use crate::namespace::{ClonePlan, FolderTree, GroupPlan, ensure_folder};
use crate::network::{NetworkHandle, ensure_group_networks};
use crate::operation::{OperationError, RunSettings};
use crate::retry::{RetryPolicy, with_retry};
use crate::spec::GroupSpec;

pub use report::{DeploymentReport, GroupReport, GroupStatus, ItemOutcome};

/// Shared state every work item reads.
struct Shared<C> {
    client: Arc<C>,
    tree: Arc<FolderTree>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    policy: RetryPolicy,
}

impl<C> Clone for Shared<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            tree: Arc::clone(&self.tree),
            permits: Arc::clone(&self.permits),
            cancel: self.cancel.clone(),
            policy: self.policy,
        }
    }
}

/// Deploys every requested group.
///
/// Disabled groups are listed in [`DeploymentReport::skipped`]. Once `cancel`
/// fires, no new work item starts; items already talking to the backend run
/// to completion and the rest are reported as cancelled.
pub async fn deploy<'g, C, G>(
    groups: G,
    masters: &MasterSet,
    tree: &FolderTree,
    client: Arc<C>,
    settings: &RunSettings,
    cancel: &CancellationToken,
) -> DeploymentReport<C::Error>
where
    C: VirtualizationClient + 'static,
    G: IntoIterator<Item = &'g GroupSpec>,
{
    let shared = Shared {
        client,
        tree: Arc::new(tree.clone()),
        permits: Arc::new(Semaphore::new(settings.concurrency_limit.max(1))),
        cancel: cancel.clone(),
        policy: settings.retry,
    };

    let mut report = DeploymentReport {
        groups: BTreeMap::new(),
        skipped: Vec::new(),
    };
    let mut tasks = JoinSet::new();
    let mut running: HashMap<Id, &GroupPlan> = HashMap::new();
    for group in groups {
        let Some(plan) = tree.group_plan(&group.name).filter(|_| group.enabled) else {
            debug!(group = %group.name, "skipping disabled group");
            report.skipped.push(group.name.clone());
            continue;
        };
        let missing: BTreeSet<&str> = plan
            .clones
            .iter()
            .filter(|clone| masters.get(&clone.service).is_none())
            .map(|clone| clone.service.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(group = %plan.group, ?missing, "masters not ready; group left untouched");
            report
                .groups
                .insert(plan.group.clone(), unmet_masters(plan, &missing));
            continue;
        }
        let items: Vec<(ClonePlan, Resource)> = plan
            .clones
            .iter()
            .filter_map(|clone| {
                masters
                    .get(&clone.service)
                    .map(|master| (clone.clone(), master.clone()))
            })
            .collect();
        let handle = tasks.spawn(deploy_group(plan.clone(), items, shared.clone()));
        running.insert(handle.id(), plan);
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, (group, group_report))) => {
                running.remove(&id);
                info!(group = %group, status = %group_report.status(), "group deployed");
                report.groups.insert(group, group_report);
            }
            Err(err) => {
                let Some(plan) = running.remove(&err.id()) else {
                    warn!(error = %err, "untracked group task did not complete");
                    continue;
                };
                warn!(group = %plan.group, error = %err, "group task did not complete");
                let mut group_report = GroupReport::new();
                for clone in &plan.clones {
                    let outcome = ItemOutcome::Failed(aborted(&clone.path, &err));
                    group_report.services.insert(clone.name.clone(), outcome);
                }
                report.groups.insert(plan.group.clone(), group_report);
            }
        }
    }
    report
}

/// Report for a group whose masters are not all ready: every work item is
/// refused and nothing touches the backend.
fn unmet_masters<E>(plan: &GroupPlan, missing: &BTreeSet<&str>) -> GroupReport<E>
where
    E: std::error::Error + 'static,
{
    let mut report = GroupReport::new();
    for clone in &plan.clones {
        report.services.insert(
            clone.name.clone(),
            ItemOutcome::Failed(OperationError::DependencyUnmet {
                resource: clone.path.to_string(),
                requirement: format!(
                    "masters of {} ready",
                    missing.iter().copied().collect::<Vec<_>>().join(", ")
                ),
            }),
        );
    }
    report
}

fn aborted<E>(path: &ResourcePath, err: &JoinError) -> OperationError<E>
where
    E: std::error::Error + 'static,
{
    OperationError::Aborted {
        operation: format!("deploy {path}"),
        detail: err.to_string(),
    }
}

async fn deploy_group<C>(
    plan: GroupPlan,
    items: Vec<(ClonePlan, Resource)>,
    shared: Shared<C>,
) -> (String, GroupReport<C::Error>)
where
    C: VirtualizationClient + 'static,
{
    let mut report = GroupReport::new();

    let prepared = {
        let Some(_permit) = admit(&shared).await else {
            for (clone, _) in items {
                report.services.insert(
                    clone.name.clone(),
                    ItemOutcome::Failed(OperationError::Cancelled {
                        operation: format!("deploy {}", clone.path),
                    }),
                );
            }
            return (plan.group, report);
        };
        prepare_group(&plan, &shared.tree, shared.client.as_ref(), &shared.policy).await
    };

    let networks = match prepared {
        Ok(networks) => networks,
        Err(err) => {
            warn!(group = %plan.group, error = %err, "group networks not ready");
            for (clone, _) in items {
                report.services.insert(
                    clone.name.clone(),
                    ItemOutcome::Failed(OperationError::DependencyUnmet {
                        resource: clone.path.to_string(),
                        requirement: String::from("group network isolation in place"),
                    }),
                );
            }
            report.network_error = Some(err);
            return (plan.group, report);
        }
    };

    let segments: Arc<Vec<Resource>> =
        Arc::new(networks.iter().map(|handle| handle.resource.clone()).collect());
    report.networks = networks;

    let mut tasks = JoinSet::new();
    let mut running: HashMap<Id, ClonePlan> = HashMap::new();
    for (clone, master) in items {
        let worker = shared.clone();
        let segments = Arc::clone(&segments);
        let namespace = plan.namespace.clone();
        let item = clone.clone();
        let handle = tasks.spawn(async move {
            let outcome = run_item(&item, &master, &namespace, &segments, &worker).await;
            (item.name, outcome)
        });
        running.insert(handle.id(), clone);
    }
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, (name, outcome))) => {
                running.remove(&id);
                report.services.insert(name, outcome);
            }
            Err(err) => {
                warn!(group = %plan.group, error = %err, "clone task did not complete");
                if let Some(clone) = running.remove(&err.id()) {
                    let outcome = ItemOutcome::Failed(aborted(&clone.path, &err));
                    report.services.insert(clone.name, outcome);
                }
            }
        }
    }
    (plan.group, report)
}

/// Waits for a worker slot unless cancellation arrives first.
async fn admit<C>(shared: &Shared<C>) -> Option<tokio::sync::OwnedSemaphorePermit> {
    if shared.cancel.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        () = shared.cancel.cancelled() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    }
}

async fn prepare_group<C>(
    plan: &GroupPlan,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
) -> Result<Vec<NetworkHandle>, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    ensure_folder(client, &plan.namespace, policy).await?;
    ensure_group_networks(&plan.group, tree, client, policy).await
}

async fn run_item<C>(
    clone: &ClonePlan,
    master: &Resource,
    namespace: &ResourcePath,
    segments: &[Resource],
    shared: &Shared<C>,
) -> ItemOutcome<C::Error>
where
    C: VirtualizationClient,
{
    let Some(_permit) = admit(shared).await else {
        return ItemOutcome::Failed(OperationError::Cancelled {
            operation: format!("deploy {}", clone.path),
        });
    };

    let client = shared.client.as_ref();
    match deploy_clone(clone, master, namespace, segments, client, &shared.policy).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(clone = %clone.path, error = %err, "clone failed");
            ItemOutcome::Failed(err)
        }
    }
}

async fn deploy_clone<C>(
    clone: &ClonePlan,
    master: &Resource,
    namespace: &ResourcePath,
    segments: &[Resource],
    client: &C,
    policy: &RetryPolicy,
) -> Result<ItemOutcome<C::Error>, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let path = &clone.path;
    if let Some(existing) = find(client, path, policy).await? {
        return converge(existing, master, segments, client, policy).await;
    }

    let name = path.name();
    let created = match with_retry(policy, &format!("clone {} to {path}", master.path), move || {
        client.clone_instance(master, name, namespace)
    })
    .await
    {
        Ok(created) => created,
        Err(OperationError::Backend { source, .. })
            if source.class() == ErrorClass::AlreadyExists =>
        {
            let existing = find(client, path, policy).await?.ok_or_else(|| {
                OperationError::DependencyUnmet {
                    resource: path.to_string(),
                    requirement: String::from("clone reported as existing but not found"),
                }
            })?;
            return converge(existing, master, segments, client, policy).await;
        }
        Err(err) => return Err(err),
    };

    wire_and_start(&created, segments, client, policy).await?;
    info!(clone = %path, master = %master.path, "deployed clone");
    Ok(ItemOutcome::Deployed)
}

/// Brings an existing clone in line with the plan, or flags it when it was
/// not cloned from the expected master.
async fn converge<C>(
    existing: Resource,
    master: &Resource,
    segments: &[Resource],
    client: &C,
    policy: &RetryPolicy,
) -> Result<ItemOutcome<C::Error>, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    if existing.kind != ResourceKind::Instance {
        return Err(OperationError::Mismatch {
            resource: existing.path.to_string(),
            detail: format!("is a {} where a clone is expected", existing.kind),
        });
    }
    if existing.source.as_ref() != Some(&master.path) {
        let origin = existing
            .source
            .as_ref()
            .map_or_else(|| String::from("an unknown source"), ToString::to_string);
        return Err(OperationError::Mismatch {
            resource: existing.path.to_string(),
            detail: format!("was cloned from {origin}, expected {}", master.path),
        });
    }

    let complete = existing.power == PowerState::On
        && segments
            .iter()
            .all(|segment| existing.is_attached_to(&segment.path));
    if complete {
        debug!(clone = %existing.path, "clone already in place");
        return Ok(ItemOutcome::Unchanged);
    }
    wire_and_start(&existing, segments, client, policy).await?;
    info!(clone = %existing.path, "resumed clone");
    Ok(ItemOutcome::Resumed)
}

/// Attaches every missing segment, then powers the clone on. A clone that is
/// already running but missing an attachment is powered off first so it is
/// never reachable outside its isolation boundary.
async fn wire_and_start<C>(
    instance: &Resource,
    segments: &[Resource],
    client: &C,
    policy: &RetryPolicy,
) -> Result<(), OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let missing: Vec<&Resource> = segments
        .iter()
        .filter(|segment| !instance.is_attached_to(&segment.path))
        .collect();
    if !missing.is_empty() && instance.power == PowerState::On {
        with_retry(policy, &format!("power off {}", instance.path), move || {
            client.power_off(instance)
        })
        .await?;
    }
    for segment in missing {
        with_retry(
            policy,
            &format!("attach {} to {}", instance.path, segment.path),
            move || client.attach_network(instance, segment),
        )
        .await?;
    }
    with_retry(policy, &format!("power on {}", instance.path), move || {
        client.power_on(instance)
    })
    .await
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

#[cfg(test)]
mod tests;
