//! Capability interface between the orchestration core and a virtualization
//! backend.
//!
//! Every phase reaches the backend only through [`VirtualizationClient`]. The
//! trait mirrors the handful of primitives the core needs (lookup by path,
//! creation, cloning, deletion, power control, network attachment, and
//! template conversion) and leaves authentication and transport to the
//! implementation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Slash separated location of a resource in the backend namespace.
///
/// The final segment is the resource name; the preceding segments name the
/// folders that contain it.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Builds a path from already canonical segments, skipping empty ones.
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .filter(|segment| !segment.as_ref().is_empty())
            .map(|segment| segment.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            return Self(segment.to_owned());
        }
        Self(format!("{}/{segment}", self.0))
    }

    /// Returns a new path with every segment of `segments` appended.
    #[must_use]
    pub fn join_all<S: AsRef<str>>(&self, segments: &[S]) -> Self {
        segments
            .iter()
            .fold(self.clone(), |path, segment| path.join(segment.as_ref()))
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Returns the final segment, which names the resource itself.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Returns the containing folder, or `None` for a top-level path.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_owned()))
    }

    /// Reports whether `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_within(&self, ancestor: &Self) -> bool {
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Reports whether the path has no segments.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of resource tracked by the backend.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Namespace container.
    Folder,
    /// Runnable virtual machine.
    Instance,
    /// Immutable template that can only be cloned.
    Template,
    /// Network segment instances attach to.
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Folder => "folder",
            Self::Instance => "instance",
            Self::Template => "template",
            Self::Network => "network",
        };
        f.write_str(label)
    }
}

/// Power state of an instance. Folders, templates, and networks are always
/// reported as [`PowerState::Off`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    /// Powered on.
    On,
    /// Powered off.
    #[default]
    Off,
}

/// Snapshot of a resource as observed in the backend.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resource {
    /// Provider specific identifier.
    pub id: String,
    /// Full path, including the resource name.
    pub path: ResourcePath,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Current power state.
    #[serde(default)]
    pub power: PowerState,
    /// Template the resource was cloned or built from, if any.
    #[serde(default)]
    pub source: Option<ResourcePath>,
    /// Network segments the resource is attached to.
    #[serde(default)]
    pub networks: Vec<ResourcePath>,
    /// Free-form annotation.
    #[serde(default)]
    pub note: Option<String>,
    /// VLAN tag for network segments.
    #[serde(default)]
    pub vlan: Option<u16>,
}

impl Resource {
    /// Returns the resource name (final path segment).
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.name()
    }

    /// Reports whether the resource is attached to `network`.
    #[must_use]
    pub fn is_attached_to(&self, network: &ResourcePath) -> bool {
        self.networks.iter().any(|attached| attached == network)
    }
}

/// Where a new instance gets its disk image from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageSource {
    /// Provider image label (for example `ubuntu-24.04`).
    Image(String),
    /// Existing template, referenced by path.
    Template(ResourcePath),
}

/// Parameters for creating a fresh instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Destination path, including the instance name.
    pub path: ResourcePath,
    /// Disk image source.
    pub image: ImageSource,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Packages provisioned during configuration.
    pub packages: Vec<String>,
    /// Optional annotation stored with the instance.
    pub note: Option<String>,
}

/// Parameters for creating a network segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkSpec {
    /// Destination path, including the segment name.
    pub path: ResourcePath,
    /// VLAN tag isolating the segment.
    pub vlan: u16,
}

/// Creation request accepted by [`VirtualizationClient::create`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceSpec {
    /// Namespace folder.
    Folder {
        /// Folder path.
        path: ResourcePath,
    },
    /// Virtual machine.
    Instance(InstanceSpec),
    /// Network segment.
    Network(NetworkSpec),
}

impl ResourceSpec {
    /// Returns the destination path of the resource being created.
    #[must_use]
    pub const fn path(&self) -> &ResourcePath {
        match self {
            Self::Folder { path } => path,
            Self::Instance(spec) => &spec.path,
            Self::Network(spec) => &spec.path,
        }
    }
}

/// Failure classes the core distinguishes when deciding whether to retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Timeouts, throttling, and other conditions worth retrying.
    Transient,
    /// The addressed resource does not exist.
    NotFound,
    /// The resource being created already exists.
    AlreadyExists,
    /// Anything else: authorisation failures, invalid state, bad requests.
    Permanent,
}

/// Implemented by backend error types so retry and idempotence decisions stay
/// backend specific.
pub trait ClassifyError {
    /// Classifies the failure.
    fn class(&self) -> ErrorClass;

    /// Shorthand for `class() == ErrorClass::Transient`.
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Narrow capability interface the orchestration core drives.
///
/// Implementations must tolerate concurrent calls from several worker tasks.
pub trait VirtualizationClient: Send + Sync {
    /// Backend specific error type.
    type Error: ClassifyError + std::error::Error + Send + Sync + 'static;

    /// Looks up a resource by full path.
    fn find<'a>(&'a self, path: &'a ResourcePath)
    -> BackendFuture<'a, Option<Resource>, Self::Error>;

    /// Lists every resource strictly below `prefix`, at any depth.
    fn list<'a>(&'a self, prefix: &'a ResourcePath)
    -> BackendFuture<'a, Vec<Resource>, Self::Error>;

    /// Creates a folder, instance, or network segment.
    fn create<'a>(&'a self, spec: &'a ResourceSpec) -> BackendFuture<'a, Resource, Self::Error>;

    /// Clones `source` into `dest_path` under the name `dest_name`.
    fn clone_instance<'a>(
        &'a self,
        source: &'a Resource,
        dest_name: &'a str,
        dest_path: &'a ResourcePath,
    ) -> BackendFuture<'a, Resource, Self::Error>;

    /// Deletes a resource.
    fn delete<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error>;

    /// Powers an instance on.
    fn power_on<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error>;

    /// Powers an instance off.
    fn power_off<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error>;

    /// Attaches an instance to a network segment.
    fn attach_network<'a>(
        &'a self,
        resource: &'a Resource,
        network: &'a Resource,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Converts a powered-off instance into a template and returns the
    /// updated resource.
    fn convert_to_template<'a>(
        &'a self,
        resource: &'a Resource,
    ) -> BackendFuture<'a, Resource, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn from_segments_skips_empty_segments() {
        let path = ResourcePath::from_segments(["lab", "", "masters"]);
        assert_eq!(path.as_str(), "lab/masters");
    }

    #[rstest]
    #[case("lab/masters/kali-master", "kali-master", Some("lab/masters"))]
    #[case("lab", "lab", None)]
    fn name_and_parent_split_on_last_segment(
        #[case] raw: &str,
        #[case] name: &str,
        #[case] parent: Option<&str>,
    ) {
        let path = ResourcePath::from_segments(raw.split('/'));
        assert_eq!(path.name(), name);
        assert_eq!(
            path.parent().as_ref().map(ResourcePath::as_str),
            parent
        );
    }

    #[rstest]
    fn is_within_requires_segment_boundary() {
        let root = ResourcePath::from_segments(["lab", "team"]);
        assert!(ResourcePath::from_segments(["lab", "team", "kali"]).is_within(&root));
        assert!(!ResourcePath::from_segments(["lab", "team-b"]).is_within(&root));
        assert!(!root.is_within(&root));
    }
}
