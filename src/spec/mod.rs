//! Specification model and validator.
//!
//! A specification names the services (VM definitions), networks, folders
//! (nested namespaces) and groups (tenants) of an exercise. [`parse`] turns a
//! YAML document into a [`SpecModel`] whose cross references are guaranteed
//! to resolve; every defect is reported before the backend is touched.

mod error;
mod raw;
mod validate;

use std::collections::BTreeMap;
use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use error::{Entity, LoadError, Rule, ValidationError};

/// Default CPU count for services that do not specify one.
pub const DEFAULT_CPUS: u32 = 1;

/// Default memory size, in MiB, for services that do not specify one.
pub const DEFAULT_MEMORY_MB: u32 = 1024;

/// Limits applied while validating `instances`.
///
/// Template groups and folder copies share the group limits; clones per
/// service have their own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Thresholds {
    /// Group or folder instance count above which a warning is logged.
    pub group_instances_warn: u32,
    /// Group or folder instance count above which validation fails.
    pub group_instances_error: u32,
    /// Service instance count above which a warning is logged.
    pub service_instances_warn: u32,
    /// Service instance count above which validation fails.
    pub service_instances_error: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            group_instances_warn: 25,
            group_instances_error: 50,
            service_instances_warn: 50,
            service_instances_error: 70,
        }
    }
}

/// Exercise level metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Metadata {
    /// Exercise name; also the default root namespace.
    pub name: String,
    /// Optional slash separated root namespace overriding `name`.
    pub folder_name: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

/// Where a service's master gets its disk image from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceSource {
    /// Backend image label.
    Image(String),
    /// Another service whose master this one is built from.
    Base(String),
}

/// A VM definition; one master is built per service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ServiceSpec {
    /// Service name.
    pub name: String,
    /// Image source.
    pub source: ServiceSource,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Packages provisioned on the master.
    pub packages: Vec<String>,
    /// Annotation copied onto the master.
    pub note: Option<String>,
    /// Clones of this service each selecting group receives.
    pub instances: u32,
}

impl ServiceSpec {
    /// Returns the service this one is built from, if any.
    #[must_use]
    pub fn base(&self) -> Option<&str> {
        match &self.source {
            ServiceSource::Base(base) => Some(base.as_str()),
            ServiceSource::Image(_) => None,
        }
    }
}

/// A declared network.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NetworkDecl {
    /// Network name.
    pub name: String,
    /// Whether every group selecting the network joins one segment.
    pub shared: bool,
    /// Explicit VLAN tag (shared networks only).
    pub vlan: Option<u16>,
}

/// A declared folder and the resources placed in it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FolderSpec {
    /// Folder name.
    pub name: String,
    /// Enclosing folder, or `None` for a top-level folder.
    pub parent: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Services placed here.
    pub services: Vec<String>,
    /// Networks placed here.
    pub networks: Vec<String>,
    /// Number of copies groups assigned here are deployed into.
    pub instances: u32,
    /// Folder this one is a numbered copy of.
    pub copy_of: Option<String>,
}

/// A tenant: one deployed copy of its selected environment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GroupSpec {
    /// Group name (already expanded for template groups).
    pub name: String,
    /// Template group this member was expanded from.
    pub template: Option<String>,
    /// Assigned folder.
    pub folder: String,
    /// Services instantiated for the group.
    pub services: Vec<String>,
    /// Networks the group's clones attach to.
    pub networks: Vec<String>,
    /// Users sharing the environment.
    pub users: Vec<String>,
    /// Disabled groups are validated but never deployed or cleaned.
    pub enabled: bool,
}

/// Validated specification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SpecModel {
    metadata: Metadata,
    services: Vec<ServiceSpec>,
    networks: Vec<NetworkDecl>,
    folders: Vec<FolderSpec>,
    groups: Vec<GroupSpec>,
    #[serde(skip)]
    build_order: Vec<String>,
    #[serde(skip)]
    identity: String,
}

impl SpecModel {
    /// Exercise metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Services in declaration order.
    #[must_use]
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Networks in declaration order.
    #[must_use]
    pub fn networks(&self) -> &[NetworkDecl] {
        &self.networks
    }

    /// Folders in declaration order.
    #[must_use]
    pub fn folders(&self) -> &[FolderSpec] {
        &self.folders
    }

    /// Groups after template expansion, in declaration order.
    #[must_use]
    pub fn groups(&self) -> &[GroupSpec] {
        &self.groups
    }

    /// Groups that take part in deployment and cleanup.
    pub fn enabled_groups(&self) -> impl Iterator<Item = &GroupSpec> {
        self.groups.iter().filter(|group| group.enabled)
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.name == name)
    }

    /// Looks up a network by name.
    #[must_use]
    pub fn network(&self, name: &str) -> Option<&NetworkDecl> {
        self.networks.iter().find(|network| network.name == name)
    }

    /// Looks up a group by name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&GroupSpec> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Services ordered so every service follows the service it is built
    /// from.
    pub fn build_order(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.build_order
            .iter()
            .filter_map(|name| self.service(name))
    }

    /// Hex SHA-256 of the validated model; stable across formatting changes
    /// of the source document.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Number of clones a full deployment of the enabled groups creates.
    #[must_use]
    pub fn planned_clone_count(&self) -> usize {
        self.enabled_groups()
            .flat_map(|group| &group.services)
            .map(|service| {
                self.service(service).map_or(1, |spec| {
                    usize::try_from(spec.instances).unwrap_or(usize::MAX)
                })
            })
            .sum()
    }

    /// Services grouped by the folder they are placed in; unplaced services
    /// are keyed by `None`.
    #[must_use]
    pub fn service_placements(&self) -> BTreeMap<&str, Option<&str>> {
        placements(
            self.services.iter().map(|service| service.name.as_str()),
            self.folders
                .iter()
                .map(|folder| (folder.name.as_str(), folder.services.as_slice())),
        )
    }

    /// Networks keyed to the folder they are placed in.
    #[must_use]
    pub fn network_placements(&self) -> BTreeMap<&str, Option<&str>> {
        placements(
            self.networks.iter().map(|network| network.name.as_str()),
            self.folders
                .iter()
                .map(|folder| (folder.name.as_str(), folder.networks.as_slice())),
        )
    }
}

/// Numbers `count` instances of `name` with zero-padded suffixes
/// (`team-01`, ...); a single instance keeps the bare name.
#[must_use]
pub fn instance_names(name: &str, count: u32) -> Vec<String> {
    if count <= 1 {
        return vec![name.to_owned()];
    }
    let width = count.to_string().len().max(2);
    (1..=count)
        .map(|index| format!("{name}-{index:0width$}"))
        .collect()
}

fn placements<'a>(
    names: impl Iterator<Item = &'a str>,
    folders: impl Iterator<Item = (&'a str, &'a [String])>,
) -> BTreeMap<&'a str, Option<&'a str>> {
    let mut placed: BTreeMap<&str, Option<&str>> = names.map(|name| (name, None)).collect();
    for (folder, members) in folders {
        for member in members {
            if let Some(slot) = placed.get_mut(member.as_str()) {
                *slot = Some(folder);
            }
        }
    }
    placed
}

/// Parses and validates a YAML specification with default thresholds.
///
/// # Errors
///
/// Returns [`ValidationError`] naming the offending entity and rule.
pub fn parse(raw: &str) -> Result<SpecModel, ValidationError> {
    parse_with(raw, &Thresholds::default())
}

/// Parses and validates a YAML specification.
///
/// # Errors
///
/// Returns [`ValidationError`] naming the offending entity and rule.
pub fn parse_with(raw: &str, thresholds: &Thresholds) -> Result<SpecModel, ValidationError> {
    let document: raw::RawDocument =
        serde_yaml::from_str(raw).map_err(|err| ValidationError::malformed(err.to_string()))?;
    let mut model = validate::validate(document, thresholds)?;
    model.identity = fingerprint(&model)?;
    Ok(model)
}

/// Reads, parses, and validates a specification file.
///
/// # Errors
///
/// Returns [`LoadError::Read`] when the file cannot be read, or
/// [`LoadError::Invalid`] with the first validation failure otherwise.
pub fn load(path: &Utf8Path, thresholds: &Thresholds) -> Result<SpecModel, LoadError> {
    let contents = read_document(path)?;
    Ok(parse_with(&contents, thresholds)?)
}

fn read_document(path: &Utf8Path) -> Result<String, LoadError> {
    let unreadable = |source: io::Error| LoadError::Read {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        unreadable(io::Error::new(io::ErrorKind::InvalidInput, "not a file path"))
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(unreadable)?;
    dir.read_to_string(file_name).map_err(unreadable)
}

fn fingerprint(model: &SpecModel) -> Result<String, ValidationError> {
    let canonical = serde_json::to_vec(model)
        .map_err(|err| ValidationError::malformed(format!("cannot fingerprint model: {err}")))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
