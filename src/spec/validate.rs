//! Referential and structural checks turning a raw document into a model.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::error::{Entity, Rule, ValidationError};
use super::raw::{RawDocument, RawFolder, RawGroup, RawMetadata, RawNetwork, RawService};
use super::{
    DEFAULT_CPUS, DEFAULT_MEMORY_MB, FolderSpec, GroupSpec, Metadata, NetworkDecl, ServiceSource,
    ServiceSpec, SpecModel, Thresholds, instance_names,
};

const MAX_VLAN: u16 = 4094;

pub(super) fn validate(
    document: RawDocument,
    thresholds: &Thresholds,
) -> Result<SpecModel, ValidationError> {
    let metadata = metadata(document.metadata)?;
    let services = services(document.services, thresholds)?;
    let build_order = build_order(&services)?;
    let networks = networks(document.networks)?;
    let folders = folders(document.folders, &services, &networks, thresholds)?;
    let groups = groups(document.groups, &folders, &services, &networks, thresholds)?;

    Ok(SpecModel {
        metadata,
        services,
        networks,
        folders,
        groups,
        build_order,
        identity: String::new(),
    })
}

fn required_name(
    raw: &str,
    entity: impl FnOnce(String) -> Entity,
) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::new(entity(raw.to_owned()), Rule::EmptyName));
    }
    Ok(name.to_owned())
}

/// Checks an `instances` count against its limits; absent means one.
fn instance_count(
    requested: Option<u32>,
    entity: &Entity,
    warn_above: u32,
    error_above: u32,
) -> Result<u32, ValidationError> {
    let count = requested.unwrap_or(1);
    if count == 0 {
        return Err(ValidationError::new(entity.clone(), Rule::ZeroInstances));
    }
    if count > error_above {
        return Err(ValidationError::new(
            entity.clone(),
            Rule::TooManyInstances {
                requested: count,
                limit: error_above,
            },
        ));
    }
    if count > warn_above {
        warn!(
            %entity,
            instances = count,
            threshold = warn_above,
            "instance count exceeds the warning threshold"
        );
    }
    Ok(count)
}

fn metadata(raw: RawMetadata) -> Result<Metadata, ValidationError> {
    let name = required_name(&raw.name, |_| Entity::Metadata)?;
    let folder_name = match raw.folder_name {
        Some(path) => {
            let trimmed = path.trim().trim_matches('/');
            if trimmed.split('/').any(|segment| segment.trim().is_empty()) {
                return Err(ValidationError::new(Entity::Metadata, Rule::EmptyName));
            }
            Some(trimmed.to_owned())
        }
        None => None,
    };
    Ok(Metadata {
        name,
        folder_name,
        description: raw.description,
    })
}

fn services(
    raw: Vec<RawService>,
    thresholds: &Thresholds,
) -> Result<Vec<ServiceSpec>, ValidationError> {
    let mut seen = BTreeSet::new();
    let mut services = Vec::with_capacity(raw.len());
    for service in raw {
        let name = required_name(&service.name, Entity::Service)?;
        let entity = || Entity::Service(name.clone());
        if !seen.insert(name.clone()) {
            return Err(ValidationError::new(entity(), Rule::DuplicateName));
        }

        let image = service.image.map(|image| image.trim().to_owned());
        let base = service.base.map(|base| base.trim().to_owned());
        let source = match (image, base) {
            (Some(image), None) if !image.is_empty() => ServiceSource::Image(image),
            (None, Some(base)) if !base.is_empty() => ServiceSource::Base(base),
            _ => return Err(ValidationError::new(entity(), Rule::AmbiguousSource)),
        };

        let cpus = service.cpus.unwrap_or(DEFAULT_CPUS);
        if cpus == 0 {
            return Err(ValidationError::new(
                entity(),
                Rule::ZeroSizing { field: "cpus" },
            ));
        }
        let memory_mb = service.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        if memory_mb == 0 {
            return Err(ValidationError::new(
                entity(),
                Rule::ZeroSizing { field: "memory-mb" },
            ));
        }

        let instances = instance_count(
            service.instances,
            &entity(),
            thresholds.service_instances_warn,
            thresholds.service_instances_error,
        )?;

        services.push(ServiceSpec {
            name,
            source,
            cpus,
            memory_mb,
            packages: service.packages,
            note: service.note,
            instances,
        });
    }

    for service in &services {
        let Some(base) = service.base() else {
            continue;
        };
        if !seen.contains(base) {
            return Err(ValidationError::new(
                Entity::Service(service.name.clone()),
                Rule::UndeclaredService {
                    name: base.to_owned(),
                },
            ));
        }
    }
    Ok(services)
}

/// Orders services so every base precedes the services built from it,
/// failing on the first cycle found.
fn build_order(services: &[ServiceSpec]) -> Result<Vec<String>, ValidationError> {
    let by_name: BTreeMap<&str, &ServiceSpec> = services
        .iter()
        .map(|service| (service.name.as_str(), service))
        .collect();
    let mut placed = BTreeSet::new();
    let mut order = Vec::with_capacity(services.len());

    for service in services {
        let mut chain: Vec<&str> = Vec::new();
        let mut cursor = Some(service);
        while let Some(current) = cursor {
            let name = current.name.as_str();
            if placed.contains(name) {
                break;
            }
            if let Some(start) = chain.iter().position(|seen| *seen == name) {
                let mut path: Vec<String> = chain
                    .iter()
                    .skip(start)
                    .map(|seen| (*seen).to_owned())
                    .collect();
                path.push(name.to_owned());
                return Err(ValidationError::new(
                    Entity::Service(name.to_owned()),
                    Rule::DependencyCycle { path },
                ));
            }
            chain.push(name);
            cursor = current.base().and_then(|base| by_name.get(base).copied());
        }
        for name in chain.into_iter().rev() {
            placed.insert(name);
            order.push(name.to_owned());
        }
    }
    Ok(order)
}

fn networks(raw: Vec<RawNetwork>) -> Result<Vec<NetworkDecl>, ValidationError> {
    let mut seen = BTreeSet::new();
    let mut vlans: BTreeMap<u16, String> = BTreeMap::new();
    let mut networks = Vec::with_capacity(raw.len());
    for network in raw {
        let name = required_name(&network.name, Entity::Network)?;
        let entity = || Entity::Network(name.clone());
        if !seen.insert(name.clone()) {
            return Err(ValidationError::new(entity(), Rule::DuplicateName));
        }
        if let Some(vlan) = network.vlan {
            if vlan == 0 || vlan > MAX_VLAN {
                return Err(ValidationError::new(entity(), Rule::VlanOutOfRange { vlan }));
            }
            if !network.shared {
                return Err(ValidationError::new(
                    entity(),
                    Rule::VlanOnPrivateNetwork { vlan },
                ));
            }
            if let Some(other) = vlans.insert(vlan, name.clone()) {
                return Err(ValidationError::new(entity(), Rule::VlanConflict { vlan, other }));
            }
        }
        networks.push(NetworkDecl {
            name,
            shared: network.shared,
            vlan: network.vlan,
        });
    }
    Ok(networks)
}

fn folders(
    raw: Vec<RawFolder>,
    services: &[ServiceSpec],
    networks: &[NetworkDecl],
    thresholds: &Thresholds,
) -> Result<Vec<FolderSpec>, ValidationError> {
    let mut seen = BTreeSet::new();
    let mut folders = Vec::with_capacity(raw.len());
    for folder in raw {
        let name = required_name(&folder.name, Entity::Folder)?;
        if !seen.insert(name.clone()) {
            return Err(ValidationError::new(Entity::Folder(name), Rule::DuplicateName));
        }
        let instances = instance_count(
            folder.instances,
            &Entity::Folder(name.clone()),
            thresholds.group_instances_warn,
            thresholds.group_instances_error,
        )?;
        let parent = folder
            .parent
            .map(|parent| parent.trim().to_owned())
            .filter(|parent| !parent.is_empty());
        folders.push(FolderSpec {
            name,
            parent,
            description: folder.description,
            services: trimmed(folder.services),
            networks: trimmed(folder.networks),
            instances,
            copy_of: None,
        });
    }

    for folder in &folders {
        let Some(parent) = &folder.parent else {
            continue;
        };
        if !seen.contains(parent) {
            return Err(ValidationError::new(
                Entity::Folder(folder.name.clone()),
                Rule::UndeclaredFolder {
                    name: parent.clone(),
                },
            ));
        }
    }
    check_folder_cycles(&folders)?;
    check_placements(&folders, services, networks)?;

    let copies: Vec<FolderSpec> = folders
        .iter()
        .filter(|folder| folder.instances > 1)
        .flat_map(folder_copies)
        .collect();
    for copy in copies {
        if !seen.insert(copy.name.clone()) {
            return Err(ValidationError::new(
                Entity::Folder(copy.name),
                Rule::DuplicateName,
            ));
        }
        folders.push(copy);
    }
    Ok(folders)
}

/// Numbered child folders standing in for `folder` when groups deploy.
fn folder_copies(folder: &FolderSpec) -> Vec<FolderSpec> {
    instance_names(&folder.name, folder.instances)
        .into_iter()
        .map(|name| FolderSpec {
            name,
            parent: Some(folder.name.clone()),
            description: None,
            services: Vec::new(),
            networks: Vec::new(),
            instances: 1,
            copy_of: Some(folder.name.clone()),
        })
        .collect()
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_owned())
        .collect()
}

fn check_folder_cycles(folders: &[FolderSpec]) -> Result<(), ValidationError> {
    let parents: BTreeMap<&str, Option<&str>> = folders
        .iter()
        .map(|folder| (folder.name.as_str(), folder.parent.as_deref()))
        .collect();
    for folder in folders {
        let mut path = vec![folder.name.as_str()];
        let mut cursor = folder.parent.as_deref();
        while let Some(current) = cursor {
            if let Some(start) = path.iter().position(|seen| *seen == current) {
                let mut cycle: Vec<String> = path
                    .iter()
                    .skip(start)
                    .map(|seen| (*seen).to_owned())
                    .collect();
                cycle.push(current.to_owned());
                return Err(ValidationError::new(
                    Entity::Folder(current.to_owned()),
                    Rule::FolderCycle { path: cycle },
                ));
            }
            path.push(current);
            cursor = parents.get(current).copied().flatten();
        }
    }
    Ok(())
}

fn check_placements(
    folders: &[FolderSpec],
    services: &[ServiceSpec],
    networks: &[NetworkDecl],
) -> Result<(), ValidationError> {
    let mut service_homes: BTreeMap<&str, &str> = BTreeMap::new();
    let mut network_homes: BTreeMap<&str, &str> = BTreeMap::new();
    for folder in folders {
        for service in &folder.services {
            if !services.iter().any(|declared| &declared.name == service) {
                return Err(ValidationError::new(
                    Entity::Folder(folder.name.clone()),
                    Rule::UndeclaredService {
                        name: service.clone(),
                    },
                ));
            }
            if let Some(first) = service_homes.insert(service, &folder.name) {
                return Err(ValidationError::new(
                    Entity::Service(service.clone()),
                    Rule::MultiplePlacements {
                        first: first.to_owned(),
                        second: folder.name.clone(),
                    },
                ));
            }
        }
        for network in &folder.networks {
            if !networks.iter().any(|declared| &declared.name == network) {
                return Err(ValidationError::new(
                    Entity::Folder(folder.name.clone()),
                    Rule::UndeclaredNetwork {
                        name: network.clone(),
                    },
                ));
            }
            if let Some(first) = network_homes.insert(network, &folder.name) {
                return Err(ValidationError::new(
                    Entity::Network(network.clone()),
                    Rule::MultiplePlacements {
                        first: first.to_owned(),
                        second: folder.name.clone(),
                    },
                ));
            }
        }
    }
    Ok(())
}

/// Answers "is `placed` inside the subtree rooted at `assigned`?", treating
/// root placements (`None`) as reachable from everywhere.
struct Reachability<'a> {
    parents: BTreeMap<&'a str, Option<&'a str>>,
}

impl<'a> Reachability<'a> {
    fn new(folders: &'a [FolderSpec]) -> Self {
        Self {
            parents: folders
                .iter()
                .map(|folder| (folder.name.as_str(), folder.parent.as_deref()))
                .collect(),
        }
    }

    fn reachable(&self, placed: Option<&str>, assigned: &str) -> bool {
        if placed.is_none() {
            return true;
        }
        let mut cursor = placed;
        while let Some(current) = cursor {
            if current == assigned {
                return true;
            }
            cursor = self.parents.get(current).copied().flatten();
        }
        false
    }
}

fn groups(
    raw: Vec<RawGroup>,
    folders: &[FolderSpec],
    services: &[ServiceSpec],
    networks: &[NetworkDecl],
    thresholds: &Thresholds,
) -> Result<Vec<GroupSpec>, ValidationError> {
    let reach = Reachability::new(folders);
    let service_homes = super::placements(
        services.iter().map(|service| service.name.as_str()),
        folders
            .iter()
            .map(|folder| (folder.name.as_str(), folder.services.as_slice())),
    );
    let network_homes = super::placements(
        networks.iter().map(|network| network.name.as_str()),
        folders
            .iter()
            .map(|folder| (folder.name.as_str(), folder.networks.as_slice())),
    );

    let mut seen = BTreeSet::new();
    let mut expanded = Vec::new();
    for group in raw {
        let name = required_name(&group.name, Entity::Group)?;
        let entity = || Entity::Group(name.clone());

        let count = instance_count(
            group.instances,
            &entity(),
            thresholds.group_instances_warn,
            thresholds.group_instances_error,
        )?;

        let folder = group.folder.trim().to_owned();
        if !folders.iter().any(|declared| declared.name == folder) {
            return Err(ValidationError::new(
                entity(),
                Rule::UndeclaredFolder { name: folder },
            ));
        }

        let selected_services = dedup(trimmed(group.services));
        for service in &selected_services {
            let Some(home) = service_homes.get(service.as_str()) else {
                return Err(ValidationError::new(
                    entity(),
                    Rule::UndeclaredService {
                        name: service.clone(),
                    },
                ));
            };
            if !reach.reachable(*home, &folder) {
                return Err(ValidationError::new(
                    entity(),
                    Rule::Unreachable {
                        kind: "service",
                        name: service.clone(),
                        folder: folder.clone(),
                    },
                ));
            }
        }

        let selected_networks = dedup(trimmed(group.networks));
        for network in &selected_networks {
            let Some(home) = network_homes.get(network.as_str()) else {
                return Err(ValidationError::new(
                    entity(),
                    Rule::UndeclaredNetwork {
                        name: network.clone(),
                    },
                ));
            };
            let shared = networks
                .iter()
                .any(|declared| &declared.name == network && declared.shared);
            if !shared && !reach.reachable(*home, &folder) {
                return Err(ValidationError::new(
                    entity(),
                    Rule::Unreachable {
                        kind: "network",
                        name: network.clone(),
                        folder: folder.clone(),
                    },
                ));
            }
        }

        let members = placed_members(&name, count, &folder, folders);
        let template = (members.len() > 1).then(|| name.clone());
        for (member, home) in members {
            if !seen.insert(member.clone()) {
                return Err(ValidationError::new(
                    Entity::Group(member),
                    Rule::DuplicateName,
                ));
            }
            expanded.push(GroupSpec {
                name: member,
                template: template.clone(),
                folder: home,
                services: selected_services.clone(),
                networks: selected_networks.clone(),
                users: group.users.clone(),
                enabled: group.enabled.unwrap_or(true),
            });
        }
    }
    Ok(expanded)
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// Expands a group into `(member, folder)` pairs: one member per template
/// instance, repeated in every copy of `folder` with the copy's name as a
/// prefix (`pods-02-team-01`).
fn placed_members(
    name: &str,
    count: u32,
    folder: &str,
    folders: &[FolderSpec],
) -> Vec<(String, String)> {
    let members = instance_names(name, count);
    let copies: Vec<&str> = folders
        .iter()
        .filter(|candidate| candidate.copy_of.as_deref() == Some(folder))
        .map(|candidate| candidate.name.as_str())
        .collect();
    if copies.is_empty() {
        return members
            .into_iter()
            .map(|member| (member, folder.to_owned()))
            .collect();
    }
    copies
        .iter()
        .flat_map(|copy| {
            members
                .iter()
                .map(move |member| (format!("{copy}-{member}"), (*copy).to_owned()))
        })
        .collect()
}
