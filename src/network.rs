//! Per-group network isolation.
//!
//! Every group gets its own private segments inside its namespace folder.
//! Only networks declared `shared` resolve to a segment used by several
//! groups. Segments are looked up by their deterministic path first, so
//! re-running a deploy reuses what an earlier run created.

use tracing::{debug, info, warn};

use crate::backend::{
    ClassifyError, ErrorClass, NetworkSpec, Resource, ResourceKind, ResourcePath, ResourceSpec,
    VirtualizationClient,
};
use crate::namespace::{FolderTree, SegmentPlan, ensure_folder};
use crate::operation::OperationError;
use crate::retry::{RetryPolicy, with_retry};

/// A segment that exists in the backend and is ready for attachments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkHandle {
    /// Declared network name.
    pub network: String,
    /// Whether the segment is shared with other groups.
    pub shared: bool,
    /// Backend resource of the segment.
    pub resource: Resource,
}

/// Ensures the segment `group` uses for `network` exists.
///
/// Private segments must live inside the group's namespace; a plan that
/// places one elsewhere is refused before any backend call.
///
/// # Errors
///
/// Returns [`OperationError::DependencyUnmet`] when the group or network has
/// no planned segment (or the plan breaks isolation),
/// [`OperationError::Mismatch`] when a non-network occupies the segment path,
/// and backend failures otherwise.
pub async fn ensure_isolated_network<C>(
    group: &str,
    network: &str,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
) -> Result<NetworkHandle, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let segment = tree
        .segment_for(group, network)
        .ok_or_else(|| OperationError::DependencyUnmet {
            resource: format!("group '{group}'"),
            requirement: format!("a planned segment for network '{network}'"),
        })?;
    let namespace = tree
        .group_namespace(group)
        .ok_or_else(|| OperationError::DependencyUnmet {
            resource: format!("group '{group}'"),
            requirement: String::from("a planned namespace"),
        })?;
    if !segment.shared && !segment.path.is_within(namespace) {
        return Err(OperationError::DependencyUnmet {
            resource: segment.path.to_string(),
            requirement: format!("a private segment inside {namespace}"),
        });
    }

    let resource = ensure_segment(client, segment, policy).await?;
    Ok(NetworkHandle {
        network: segment.network.clone(),
        shared: segment.shared,
        resource,
    })
}

/// Ensures every segment of `group`, private segments first.
///
/// # Errors
///
/// Returns the first failure; segments ensured before it are left in place
/// and picked up again by the next run.
pub async fn ensure_group_networks<C>(
    group: &str,
    tree: &FolderTree,
    client: &C,
    policy: &RetryPolicy,
) -> Result<Vec<NetworkHandle>, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let mut handles = Vec::new();
    for segment in tree.segments_for_group(group) {
        handles.push(ensure_isolated_network(group, &segment.network, tree, client, policy).await?);
    }
    Ok(handles)
}

async fn ensure_segment<C>(
    client: &C,
    segment: &SegmentPlan,
    policy: &RetryPolicy,
) -> Result<Resource, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let path = &segment.path;
    if let Some(existing) = find(client, path, policy).await? {
        return reuse(existing, segment);
    }

    if let Some(parent) = path.parent() {
        ensure_folder(client, &parent, policy).await?;
    }
    let spec = ResourceSpec::Network(NetworkSpec {
        path: path.clone(),
        vlan: segment.vlan,
    });
    let spec_ref = &spec;
    match with_retry(policy, &format!("create network {path}"), move || {
        client.create(spec_ref)
    })
    .await
    {
        Ok(created) => {
            info!(
                network = %path,
                vlan = segment.vlan,
                shared = segment.shared,
                "created network segment"
            );
            Ok(created)
        }
        Err(OperationError::Backend { source, .. })
            if source.class() == ErrorClass::AlreadyExists =>
        {
            find(client, path, policy).await?.map_or_else(
                || {
                    Err(OperationError::DependencyUnmet {
                        resource: path.to_string(),
                        requirement: String::from("segment reported as existing but not found"),
                    })
                },
                |existing| reuse(existing, segment),
            )
        }
        Err(err) => Err(err),
    }
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

fn reuse<E>(existing: Resource, segment: &SegmentPlan) -> Result<Resource, OperationError<E>>
where
    E: std::error::Error + 'static,
{
    if existing.kind != ResourceKind::Network {
        return Err(OperationError::Mismatch {
            resource: existing.path.to_string(),
            detail: format!("is a {} where a network segment is expected", existing.kind),
        });
    }
    if existing.vlan.is_some_and(|vlan| vlan != segment.vlan) {
        warn!(
            network = %existing.path,
            planned = segment.vlan,
            actual = ?existing.vlan,
            "reusing segment with a different VLAN tag"
        );
    } else {
        debug!(network = %existing.path, "reusing network segment");
    }
    Ok(existing)
}
