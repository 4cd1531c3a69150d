//! Namespace resolution: maps the declared folders, services, networks and
//! groups of a validated specification onto canonical backend paths.
//!
//! [`resolve`] walks the folder declarations once in topological order and
//! claims every path the later phases will touch. Two entities claiming the
//! same path is a [`NamingCollision`]; nothing is disambiguated silently.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::backend::{
    ClassifyError, ErrorClass, Resource, ResourceKind, ResourcePath, ResourceSpec,
    VirtualizationClient,
};
use crate::operation::OperationError;
use crate::retry::{RetryPolicy, with_retry};
use crate::spec::{GroupSpec, SpecModel, instance_names};

/// Folder below the exercise root that holds every master.
pub const MASTERS_FOLDER: &str = "masters";

/// Suffix appended to a service name to form its master's name.
pub const MASTER_SUFFIX: &str = "-master";

/// Network name used for the private segment of groups that select no
/// per-group network.
pub const DEFAULT_PRIVATE_NETWORK: &str = "private";

/// First VLAN tag handed out to segments without an explicit tag.
pub const VLAN_POOL_START: u16 = 2000;

/// Last VLAN tag handed out to segments without an explicit tag.
pub const VLAN_POOL_END: u16 = 4095;

/// Canonicalises a declared name into a backend path segment.
///
/// Lowercases, collapses runs of characters outside `[a-z0-9._-]` into a
/// single `-`, and trims leading and trailing dashes.
#[must_use]
pub fn canonical_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out.trim_matches('-').to_owned()
}

/// Two declared entities resolve to the same backend path.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{first} and {second} both resolve to '{path}'")]
pub struct NamingCollision {
    /// Contested path.
    pub path: ResourcePath,
    /// Entity that claimed the path first.
    pub first: String,
    /// Entity that claimed it second.
    pub second: String,
}

/// Failures raised while resolving a specification into a [`FolderTree`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// Two entities resolve to the same path.
    #[error(transparent)]
    Collision(#[from] NamingCollision),
    /// A declared name has no characters left after canonicalisation.
    #[error("{entity} has no usable characters for a backend name")]
    UnusableName {
        /// Offending entity.
        entity: String,
    },
    /// More segments need a VLAN than the pool holds.
    #[error("{segments} segments need a VLAN but only {available} tags are free")]
    VlanPoolExhausted {
        /// Segments waiting for a tag.
        segments: usize,
        /// Tags left in the pool.
        available: usize,
    },
}

/// A resolved folder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FolderNode {
    /// Declared folder name.
    pub name: String,
    /// Canonical backend path.
    pub path: ResourcePath,
    /// Declared parent, if any.
    pub parent: Option<String>,
    /// Child folders in declaration order.
    pub children: Vec<String>,
    /// Services placed in the folder.
    pub services: Vec<String>,
    /// Networks placed in the folder.
    pub networks: Vec<String>,
}

/// A network segment the deploy phase ensures before any clone is wired.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentPlan {
    /// Declared network name (or [`DEFAULT_PRIVATE_NETWORK`]).
    pub network: String,
    /// Backend path of the segment.
    pub path: ResourcePath,
    /// VLAN tag the segment is created with.
    pub vlan: u16,
    /// Whether the segment is shared by every group selecting it.
    pub shared: bool,
}

/// Destination of one clone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClonePlan {
    /// Service the clone instantiates.
    pub service: String,
    /// Key of the clone within its group: the service name, numbered
    /// (`target-02`) when the service asks for several instances.
    pub name: String,
    /// Backend path of the clone.
    pub path: ResourcePath,
}

/// Everything the deploy and cleanup phases need to know about one group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupPlan {
    /// Group name.
    pub group: String,
    /// Folder the group is assigned to.
    pub folder: String,
    /// Folder holding the group's clones and private segments.
    pub namespace: ResourcePath,
    /// Segments the group's clones attach to, private ones first.
    pub segments: Vec<SegmentPlan>,
    /// Clones in service selection order.
    pub clones: Vec<ClonePlan>,
}

impl GroupPlan {
    /// Segments owned by this group alone.
    pub fn private_segments(&self) -> impl Iterator<Item = &SegmentPlan> {
        self.segments.iter().filter(|segment| !segment.shared)
    }

    /// Segments shared with other groups.
    pub fn shared_segments(&self) -> impl Iterator<Item = &SegmentPlan> {
        self.segments.iter().filter(|segment| segment.shared)
    }
}

/// Read-only map from logical names to backend paths.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FolderTree {
    root: ResourcePath,
    folders: Vec<FolderNode>,
    masters: BTreeMap<String, ResourcePath>,
    groups: BTreeMap<String, GroupPlan>,
    shared: BTreeMap<String, SegmentPlan>,
}

impl FolderTree {
    /// Root namespace of the exercise.
    #[must_use]
    pub const fn root(&self) -> &ResourcePath {
        &self.root
    }

    /// Folder holding the masters.
    #[must_use]
    pub fn masters_root(&self) -> ResourcePath {
        self.root.join(MASTERS_FOLDER)
    }

    /// Folders in topological order (parents before children).
    #[must_use]
    pub fn folders(&self) -> &[FolderNode] {
        &self.folders
    }

    /// Backend path of a declared folder.
    #[must_use]
    pub fn folder_path(&self, folder: &str) -> Option<&ResourcePath> {
        self.folders
            .iter()
            .find(|node| node.name == folder)
            .map(|node| &node.path)
    }

    /// Backend path of a service's master.
    #[must_use]
    pub fn master_location(&self, service: &str) -> Option<&ResourcePath> {
        self.masters.get(service)
    }

    /// Planned master paths, ordered by service name.
    pub fn master_locations(&self) -> impl Iterator<Item = (&str, &ResourcePath)> {
        self.masters
            .iter()
            .map(|(service, path)| (service.as_str(), path))
    }

    /// Namespace folder of an enabled group.
    #[must_use]
    pub fn group_namespace(&self, group: &str) -> Option<&ResourcePath> {
        self.groups.get(group).map(|plan| &plan.namespace)
    }

    /// Backend path of the (first) clone of `service` owned by `group`.
    #[must_use]
    pub fn clone_location(&self, group: &str, service: &str) -> Option<&ResourcePath> {
        self.groups
            .get(group)?
            .clones
            .iter()
            .find(|clone| clone.service == service)
            .map(|clone| &clone.path)
    }

    /// Segment `group` uses for `network`.
    #[must_use]
    pub fn segment_for(&self, group: &str, network: &str) -> Option<&SegmentPlan> {
        self.groups
            .get(group)?
            .segments
            .iter()
            .find(|segment| segment.network == network)
    }

    /// All segments of `group`; empty for unknown or disabled groups.
    #[must_use]
    pub fn segments_for_group(&self, group: &str) -> &[SegmentPlan] {
        self.groups
            .get(group)
            .map_or(&[], |plan| plan.segments.as_slice())
    }

    /// Plan for an enabled group.
    #[must_use]
    pub fn group_plan(&self, group: &str) -> Option<&GroupPlan> {
        self.groups.get(group)
    }

    /// Plans of every enabled group, ordered by name.
    pub fn group_plans(&self) -> impl Iterator<Item = &GroupPlan> {
        self.groups.values()
    }

    /// Shared segments, ordered by network name.
    pub fn shared_segments(&self) -> impl Iterator<Item = &SegmentPlan> {
        self.shared.values()
    }
}

/// Tracks which entity owns each backend path.
#[derive(Default)]
struct Claims {
    owners: BTreeMap<ResourcePath, String>,
}

impl Claims {
    fn claim(&mut self, path: &ResourcePath, owner: String) -> Result<(), NamingCollision> {
        if let Some(first) = self.owners.get(path) {
            return Err(NamingCollision {
                path: path.clone(),
                first: first.clone(),
                second: owner,
            });
        }
        self.owners.insert(path.clone(), owner);
        Ok(())
    }
}

fn segment(name: &str, entity: impl FnOnce() -> String) -> Result<String, ResolveError> {
    let canonical = canonical_segment(name);
    if canonical.is_empty() {
        return Err(ResolveError::UnusableName { entity: entity() });
    }
    Ok(canonical)
}

/// Resolves a validated specification into a [`FolderTree`].
///
/// # Errors
///
/// Returns [`ResolveError::Collision`] when two entities map to one path,
/// [`ResolveError::UnusableName`] when a name canonicalises to nothing, and
/// [`ResolveError::VlanPoolExhausted`] when automatic VLAN allocation runs out
/// of tags.
pub fn resolve(model: &SpecModel) -> Result<FolderTree, ResolveError> {
    let root = root_path(model)?;
    let mut claims = Claims::default();
    claims.claim(&root.join(MASTERS_FOLDER), String::from("masters folder"))?;

    let folders = folder_nodes(model, &root)?;
    for node in &folders {
        claims.claim(&node.path, format!("folder '{}'", node.name))?;
    }
    let relative: BTreeMap<&str, Vec<&str>> = folders
        .iter()
        .map(|node| (node.name.as_str(), relative_segments(&node.path, &root)))
        .collect();

    let service_homes = model.service_placements();
    let mut masters = BTreeMap::new();
    for service in model.services() {
        let name = segment(&service.name, || format!("service '{}'", service.name))?;
        let home = service_homes
            .get(service.name.as_str())
            .copied()
            .flatten()
            .and_then(|folder| relative.get(folder))
            .map_or(&[][..], Vec::as_slice);
        let location = root
            .join(MASTERS_FOLDER)
            .join_all(home)
            .join(&format!("{name}{MASTER_SUFFIX}"));
        claims.claim(&location, format!("master of service '{}'", service.name))?;
        masters.insert(service.name.clone(), location);
    }

    let network_homes = model.network_placements();
    let mut shared = BTreeMap::new();
    for network in model.networks().iter().filter(|network| network.shared) {
        let name = segment(&network.name, || format!("network '{}'", network.name))?;
        let home = network_homes
            .get(network.name.as_str())
            .copied()
            .flatten()
            .and_then(|folder| folders.iter().find(|node| node.name == folder))
            .map_or_else(|| root.clone(), |node| node.path.clone());
        let path = home.join(&name);
        claims.claim(&path, format!("shared network '{}'", network.name))?;
        shared.insert(
            network.name.clone(),
            SegmentPlan {
                network: network.name.clone(),
                path,
                vlan: network.vlan.unwrap_or_default(),
                shared: true,
            },
        );
    }

    let mut groups = BTreeMap::new();
    for group in model.enabled_groups() {
        let plan = group_plan(model, group, &folders, &shared, &mut claims)?;
        groups.insert(group.name.clone(), plan);
    }

    allocate_vlans(model, &mut groups, &mut shared)?;
    for plan in groups.values_mut() {
        for planned in plan.segments.iter_mut().filter(|segment| segment.shared) {
            if let Some(resolved) = shared.get(&planned.network) {
                planned.vlan = resolved.vlan;
            }
        }
    }

    debug!(
        root = %root,
        folders = folders.len(),
        groups = groups.len(),
        "resolved namespace"
    );
    Ok(FolderTree {
        root,
        folders,
        masters,
        groups,
        shared,
    })
}

fn root_path(model: &SpecModel) -> Result<ResourcePath, ResolveError> {
    let metadata = model.metadata();
    let raw = metadata.folder_name.as_deref().unwrap_or(&metadata.name);
    let segments = raw
        .split('/')
        .map(|part| segment(part, || String::from("exercise root")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResourcePath::from_segments(segments))
}

fn relative_segments<'a>(path: &'a ResourcePath, root: &ResourcePath) -> Vec<&'a str> {
    let depth = root.segments().count();
    path.segments().skip(depth).collect()
}

/// Orders folders parents first (Kahn's algorithm, declaration order among
/// siblings) and computes each one's path.
fn folder_nodes(model: &SpecModel, root: &ResourcePath) -> Result<Vec<FolderNode>, ResolveError> {
    let declared = model.folders();
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for folder in declared {
        if let Some(parent) = folder.parent.as_deref() {
            children.entry(parent).or_default().push(folder.name.as_str());
        }
    }

    let mut queue: VecDeque<(&str, ResourcePath)> = declared
        .iter()
        .filter(|folder| folder.parent.is_none())
        .map(|folder| (folder.name.as_str(), root.clone()))
        .collect();
    let mut visited = BTreeSet::new();
    let mut nodes = Vec::with_capacity(declared.len());
    while let Some((name, parent_path)) = queue.pop_front() {
        if !visited.insert(name) {
            continue;
        }
        let Some(folder) = declared.iter().find(|folder| folder.name == name) else {
            continue;
        };
        let path = parent_path.join(&segment(name, || format!("folder '{name}'"))?);
        let kids = children.get(name).cloned().unwrap_or_default();
        for child in &kids {
            queue.push_back((child, path.clone()));
        }
        nodes.push(FolderNode {
            name: folder.name.clone(),
            path,
            parent: folder.parent.clone(),
            children: kids.iter().map(|kid| (*kid).to_owned()).collect(),
            services: folder.services.clone(),
            networks: folder.networks.clone(),
        });
    }
    Ok(nodes)
}

fn group_plan(
    model: &SpecModel,
    group: &GroupSpec,
    folders: &[FolderNode],
    shared: &BTreeMap<String, SegmentPlan>,
    claims: &mut Claims,
) -> Result<GroupPlan, ResolveError> {
    let label = model
        .folders()
        .iter()
        .find(|folder| folder.name == group.folder && folder.copy_of.is_some())
        .and_then(|copy| group.name.strip_prefix(&format!("{}-", copy.name)))
        .unwrap_or(&group.name);
    let group_segment = segment(label, || format!("group '{}'", group.name))?;
    let folder_path = folders
        .iter()
        .find(|node| node.name == group.folder)
        .map(|node| node.path.clone())
        .ok_or_else(|| ResolveError::UnusableName {
            entity: format!("folder '{}'", group.folder),
        })?;
    let namespace = folder_path.join(&group_segment);
    claims.claim(&namespace, format!("group '{}'", group.name))?;

    let mut segments = Vec::new();
    let mut private: Vec<&str> = group
        .networks
        .iter()
        .filter(|network| model.network(network).is_some_and(|decl| !decl.shared))
        .map(String::as_str)
        .collect();
    if private.is_empty() {
        private.push(DEFAULT_PRIVATE_NETWORK);
    }
    for network in private {
        let name = segment(network, || format!("network '{network}'"))?;
        let path = namespace.join(&format!("{group_segment}-{name}"));
        claims.claim(
            &path,
            format!("network '{network}' of group '{}'", group.name),
        )?;
        segments.push(SegmentPlan {
            network: network.to_owned(),
            path,
            vlan: 0,
            shared: false,
        });
    }
    for network in &group.networks {
        if let Some(plan) = shared.get(network) {
            segments.push(plan.clone());
        }
    }

    let mut clones = Vec::with_capacity(group.services.len());
    for service in &group.services {
        let count = model.service(service).map_or(1, |spec| spec.instances);
        for instance in instance_names(service, count) {
            let name = segment(&instance, || format!("service '{service}'"))?;
            let path = namespace.join(&format!("{group_segment}-{name}"));
            claims.claim(
                &path,
                format!("clone '{instance}' for group '{}'", group.name),
            )?;
            clones.push(ClonePlan {
                service: service.clone(),
                name: instance,
                path,
            });
        }
    }

    Ok(GroupPlan {
        group: group.name.clone(),
        folder: group.folder.clone(),
        namespace,
        segments,
        clones,
    })
}

/// Hands out pool tags to every segment without an explicit VLAN, in sorted
/// path order, skipping tags pinned by shared networks.
fn allocate_vlans(
    model: &SpecModel,
    groups: &mut BTreeMap<String, GroupPlan>,
    shared: &mut BTreeMap<String, SegmentPlan>,
) -> Result<(), ResolveError> {
    let pinned: BTreeSet<u16> = model
        .networks()
        .iter()
        .filter_map(|network| network.vlan)
        .collect();

    let mut pending: Vec<&mut SegmentPlan> = shared
        .values_mut()
        .filter(|segment| segment.vlan == 0)
        .chain(
            groups
                .values_mut()
                .flat_map(|plan| plan.segments.iter_mut().filter(|segment| !segment.shared)),
        )
        .collect();
    pending.sort_by(|left, right| left.path.cmp(&right.path));

    let mut pool = (VLAN_POOL_START..=VLAN_POOL_END).filter(|tag| !pinned.contains(tag));
    let available = pool.clone().count();
    let needed = pending.len();
    for segment in pending {
        let Some(tag) = pool.next() else {
            return Err(ResolveError::VlanPoolExhausted {
                segments: needed,
                available,
            });
        };
        segment.vlan = tag;
    }
    Ok(())
}

/// Ensures every folder along `path` exists, creating missing ones from the
/// top down.
///
/// # Errors
///
/// Returns [`OperationError`] when a lookup or creation fails, or
/// [`OperationError::Mismatch`] when a non-folder occupies part of the path.
pub async fn ensure_folder<C>(
    client: &C,
    path: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<Resource, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let mut current = ResourcePath::default();
    let mut last = None;
    for part in path.segments() {
        current = current.join(part);
        let resource = ensure_single_folder(client, &current, policy).await?;
        last = Some(resource);
    }
    last.ok_or_else(|| OperationError::DependencyUnmet {
        resource: path.to_string(),
        requirement: String::from("a non-empty folder path"),
    })
}

async fn ensure_single_folder<C>(
    client: &C,
    path: &ResourcePath,
    policy: &RetryPolicy,
) -> Result<Resource, OperationError<C::Error>>
where
    C: VirtualizationClient,
{
    let lookup = format!("find {path}");
    if let Some(existing) = with_retry(policy, &lookup, move || client.find(path)).await? {
        return expect_folder(existing);
    }

    let spec = ResourceSpec::Folder { path: path.clone() };
    let spec_ref = &spec;
    match with_retry(policy, &format!("create folder {path}"), move || {
        client.create(spec_ref)
    })
    .await
    {
        Ok(created) => Ok(created),
        Err(OperationError::Backend { source, .. })
            if source.class() == ErrorClass::AlreadyExists =>
        {
            // A concurrent worker won the race.
            with_retry(policy, &lookup, move || client.find(path))
                .await?
                .map_or_else(
                    || {
                        Err(OperationError::DependencyUnmet {
                            resource: path.to_string(),
                            requirement: String::from("folder reported as existing but not found"),
                        })
                    },
                    expect_folder,
                )
        }
        Err(err) => Err(err),
    }
}

fn expect_folder<E>(resource: Resource) -> Result<Resource, OperationError<E>>
where
    E: std::error::Error + 'static,
{
    if resource.kind == ResourceKind::Folder {
        return Ok(resource);
    }
    Err(OperationError::Mismatch {
        resource: resource.path.to_string(),
        detail: format!("is a {} where a folder is expected", resource.kind),
    })
}

#[cfg(test)]
mod tests;
