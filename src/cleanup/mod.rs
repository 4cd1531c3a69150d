//! Teardown of group environments and masters.
//!
//! Environment cleanup powers off and deletes each group's clones, then its
//! private segments and namespace folder. Shared segments go only once no
//! instance under the exercise root is attached to them. Master cleanup is a
//! separate phase and refuses to delete a template that still has clones.
//!
//! Both phases treat a resource that is already gone as removed, so a run
//! interrupted half way can simply be repeated.

mod report;

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::backend::{
    ClassifyError, ErrorClass, PowerState, Resource, ResourceKind, ResourcePath,
    VirtualizationClient,
};
use crate::masters::MasterSet;
use crate::namespace::{FolderTree, GroupPlan};
use crate::operation::OperationError;
use crate::retry::{RetryPolicy, with_retry};
use crate::spec::GroupSpec;

pub use report::CleanupReport;

enum Removal {
    Removed,
    Absent,
}

enum Prune {
    Removed,
    Absent,
    Occupied(usize),
}

/// Tears down the environments of `groups`.
///
/// Disabled groups are listed in [`CleanupReport::skipped`] and left alone.
/// A group whose clones could not all be removed keeps its segments and
/// namespace folder; the failure is recorded against the namespace.
pub async fn cleanup_environment<'g, C, G>(
    groups: G,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
) -> CleanupReport<C::Error>
where
    C: VirtualizationClient,
    G: IntoIterator<Item = &'g GroupSpec>,
{
    let mut report = CleanupReport::new();
    let mut shared = BTreeSet::new();
    for group in groups {
        let Some(plan) = tree.group_plan(&group.name).filter(|_| group.enabled) else {
            debug!(group = %group.name, "skipping disabled group");
            report.skipped.push(group.name.clone());
            continue;
        };
        shared.extend(plan.shared_segments().map(|segment| segment.path.clone()));
        teardown_group(plan, client, policy, &mut report).await;
    }

    for path in shared {
        release_shared_segment(&path, tree, client, policy, &mut report).await;
    }

    let mut folders: Vec<&ResourcePath> = tree.folders().iter().map(|node| &node.path).collect();
    folders.sort_by_key(|path| std::cmp::Reverse(path.segments().count()));
    folders.push(tree.root());
    for folder in folders {
        prune_quietly(folder, client, policy, &mut report).await;
    }
    report
}

/// Deletes the masters in `masters`, derived masters before their bases,
/// then any master folders left empty.
///
/// Masters whose build stopped before conversion are found as instances at
/// their planned paths and removed first. A master with instances or
/// templates cloned from it is refused with
/// [`OperationError::DependencyUnmet`]; environment cleanup must run first.
/// Master folders that still hold resources are listed in
/// [`CleanupReport::retained`].
pub async fn cleanup_masters<C>(
    masters: &MasterSet,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
) -> CleanupReport<C::Error>
where
    C: VirtualizationClient,
{
    let mut report = CleanupReport::new();
    let mut doomed = unfinished_masters(masters, tree, client, policy, &mut report).await;
    doomed.extend(masters.iter().rev().map(|master| master.resource.path.clone()));
    for path in &doomed {
        match dependents(client, tree.root(), path, policy).await {
            Ok(0) => {
                let outcome = remove(
                    client,
                    path,
                    &[ResourceKind::Template, ResourceKind::Instance],
                    policy,
                )
                .await;
                record(&mut report, path, outcome);
            }
            Ok(count) => {
                warn!(master = %path, dependents = count, "master still in use");
                report.failures.insert(
                    path.clone(),
                    OperationError::DependencyUnmet {
                        resource: path.to_string(),
                        requirement: format!("{count} dependent clone(s) removed first"),
                    },
                );
            }
            Err(err) => {
                report.failures.insert(path.clone(), err);
            }
        }
    }

    let masters_root = tree.masters_root();
    let mut master_folders = BTreeSet::new();
    for (_, location) in tree.master_locations() {
        let mut cursor = location.parent();
        while let Some(folder) = cursor {
            if folder != masters_root && !folder.is_within(&masters_root) {
                break;
            }
            cursor = folder.parent();
            master_folders.insert(folder);
        }
    }
    master_folders.insert(masters_root);
    let mut deepest_first: Vec<ResourcePath> = master_folders.into_iter().collect();
    deepest_first.sort_by_key(|path| std::cmp::Reverse(path.segments().count()));
    for folder in &deepest_first {
        match prune(client, folder, policy).await {
            Ok(Prune::Removed) => report.removed.push(folder.clone()),
            Ok(Prune::Absent) => {}
            Ok(Prune::Occupied(count)) => {
                debug!(folder = %folder, count, "master folder still occupied");
                report
                    .retained
                    .insert(folder.clone(), format!("still holds {count} resource(s)"));
            }
            Err(err) => {
                report.failures.insert(folder.clone(), err);
            }
        }
    }
    prune_quietly(tree.root(), client, policy, &mut report).await;
    report
}

/// Paths of planned masters missing from `masters` that exist as instances,
/// left behind by a build that failed before conversion.
async fn unfinished_masters<C>(
    masters: &MasterSet,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
    report: &mut CleanupReport<C::Error>,
) -> Vec<ResourcePath>
where
    C: VirtualizationClient,
{
    let mut unfinished = Vec::new();
    for (service, location) in tree.master_locations() {
        if masters.get(service).is_some() {
            continue;
        }
        match find(client, location, policy).await {
            Ok(Some(resource)) if resource.kind == ResourceKind::Instance => {
                info!(service, master = %location, "removing unfinished master");
                unfinished.push(location.clone());
            }
            Ok(_) => {}
            Err(err) => {
                report.failures.insert(location.clone(), err);
            }
        }
    }
    unfinished
}

async fn teardown_group<C>(
    plan: &GroupPlan,
    client: &C,
    policy: &RetryPolicy,
    report: &mut CleanupReport<C::Error>,
) where
    C: VirtualizationClient,
{
    let mut clones_gone = true;
    for clone in &plan.clones {
        let outcome = remove(client, &clone.path, &[ResourceKind::Instance], policy).await;
        clones_gone &= outcome.is_ok();
        record(report, &clone.path, outcome);
    }
    if !clones_gone {
        warn!(group = %plan.group, "keeping group networks until its clones are gone");
        report.failures.insert(
            plan.namespace.clone(),
            OperationError::DependencyUnmet {
                resource: plan.namespace.to_string(),
                requirement: format!("every clone of group '{}' removed", plan.group),
            },
        );
        return;
    }

    for segment in plan.private_segments() {
        let outcome = remove(client, &segment.path, &[ResourceKind::Network], policy).await;
        record(report, &segment.path, outcome);
    }

    match prune(client, &plan.namespace, policy).await {
        Ok(Prune::Removed) => report.removed.push(plan.namespace.clone()),
        Ok(Prune::Absent) => report.already_absent.push(plan.namespace.clone()),
        Ok(Prune::Occupied(count)) => {
            report.retained.insert(
                plan.namespace.clone(),
                format!("holds {count} resource(s) outside the plan"),
            );
        }
        Err(err) => {
            report.failures.insert(plan.namespace.clone(), err);
        }
    }
    info!(group = %plan.group, "group environment torn down");
}

async fn release_shared_segment<C>(
    path: &ResourcePath,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
    report: &mut CleanupReport<C::Error>,
) where
    C: VirtualizationClient,
{
    let attached = match attachments(client, tree.root(), path, policy).await {
        Ok(count) => count,
        Err(err) => {
            report.failures.insert(path.clone(), err);
            return;
        }
    };
    if attached > 0 {
        debug!(network = %path, attached, "shared segment still in use");
        report.retained.insert(
            path.clone(),
            format!("{attached} instance(s) still attached"),
        );
        return;
    }
    let outcome = remove(client, path, &[ResourceKind::Network], policy).await;
    record(report, path, outcome);
}

/// Deletes an empty folder; folders that are absent or still occupied are
/// left without a report entry.
async fn prune_quietly<C>(
    path: &ResourcePath,
    client: &C,
    policy: &RetryPolicy,
    report: &mut CleanupReport<C::Error>,
) where
    C: VirtualizationClient,
{
    match prune(client, path, policy).await {
        Ok(Prune::Removed) => report.removed.push(path.clone()),
        Ok(Prune::Absent | Prune::Occupied(_)) => {}
        Err(err) => {
            report.failures.insert(path.clone(), err);
        }
    }
}

async fn prune<C>(
    client: &C,
    path: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<Prune, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let Some(folder) = find(client, path, policy).await? else {
        return Ok(Prune::Absent);
    };
    if folder.kind != ResourceKind::Folder {
        return Err(OperationError::Mismatch {
            resource: path.to_string(),
            detail: format!("is a {} where a folder is expected", folder.kind),
        });
    }
    let contents = with_retry(policy, &format!("list {path}"), move || client.list(path)).await?;
    if !contents.is_empty() {
        return Ok(Prune::Occupied(contents.len()));
    }
    Ok(match delete(client, &folder, policy).await? {
        Removal::Removed => Prune::Removed,
        Removal::Absent => Prune::Absent,
    })
}

/// Removes the resource at `path` when it is one of `kinds`, powering it off
/// first if needed.
async fn remove<C>(
    client: &C,
    path: &ResourcePath,
    kinds: &[ResourceKind],
    policy: &RetryPolicy,
) -> Result<Removal, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let Some(resource) = find(client, path, policy).await? else {
        return Ok(Removal::Absent);
    };
    if !kinds.contains(&resource.kind) {
        return Err(OperationError::Mismatch {
            resource: path.to_string(),
            detail: format!("is a {} and was not created by this exercise", resource.kind),
        });
    }
    if resource.power == PowerState::On {
        let resource_ref = &resource;
        with_retry(policy, &format!("power off {path}"), move || {
            client.power_off(resource_ref)
        })
        .await?;
    }
    delete(client, &resource, policy).await
}

async fn delete<C>(
    client: &C,
    resource: &Resource,
    policy: &RetryPolicy,
) -> Result<Removal, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    match with_retry(policy, &format!("delete {}", resource.path), move || {
        client.delete(resource)
    })
    .await
    {
        Ok(()) => {
            info!(path = %resource.path, kind = %resource.kind, "removed");
            Ok(Removal::Removed)
        }
        Err(OperationError::Backend { source, .. }) if source.class() == ErrorClass::NotFound => {
            Ok(Removal::Absent)
        }
        Err(err) => Err(err),
    }
}

fn record<E>(
    report: &mut CleanupReport<E>,
    path: &ResourcePath,
    outcome: Result<Removal, OperationError<E>>,
) where
    E: std::error::Error + 'static,
{
    match outcome {
        Ok(Removal::Removed) => report.removed.push(path.clone()),
        Ok(Removal::Absent) => {
            debug!(path = %path, "already absent");
            report.already_absent.push(path.clone());
        }
        Err(err) => {
            warn!(path = %path, error = %err, "cleanup failed");
            report.failures.insert(path.clone(), err);
        }
    }
}

/// Counts resources under `root` attached to `network`.
async fn attachments<C>(
    client: &C,
    root: &ResourcePath,
    network: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<usize, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let inventory = with_retry(policy, &format!("list {root}"), move || client.list(root)).await?;
    Ok(inventory
        .iter()
        .filter(|resource| resource.is_attached_to(network))
        .count())
}

/// Counts resources under `root` cloned or built from `template`.
async fn dependents<C>(
    client: &C,
    root: &ResourcePath,
    template: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<usize, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let inventory = with_retry(policy, &format!("list {root}"), move || client.list(root)).await?;
    Ok(inventory
        .iter()
        .filter(|resource| resource.source.as_ref() == Some(template))
        .count())
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
