//! Validation failures for specification documents.

use std::{fmt, io};

use camino::Utf8PathBuf;
use thiserror::Error;

/// Entity a validation failure is attributed to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entity {
    /// The document as a whole (syntax errors).
    Document,
    /// The `metadata` block.
    Metadata,
    /// A declared service.
    Service(String),
    /// A declared network.
    Network(String),
    /// A declared folder.
    Folder(String),
    /// A declared group (or an expanded template-group member).
    Group(String),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => f.write_str("document"),
            Self::Metadata => f.write_str("metadata"),
            Self::Service(name) => write!(f, "service '{name}'"),
            Self::Network(name) => write!(f, "network '{name}'"),
            Self::Folder(name) => write!(f, "folder '{name}'"),
            Self::Group(name) => write!(f, "group '{name}'"),
        }
    }
}

/// Rule a specification broke.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Rule {
    /// The document could not be parsed.
    #[error("malformed document: {message}")]
    Malformed {
        /// Parser message.
        message: String,
    },
    /// A required name is blank.
    #[error("name must not be empty")]
    EmptyName,
    /// Two entities of the same kind share a name.
    #[error("name is declared more than once")]
    DuplicateName,
    /// A service declares neither or both of `image` and `base`.
    #[error("exactly one of 'image' or 'base' must be set")]
    AmbiguousSource,
    /// A numeric sizing field is zero.
    #[error("'{field}' must be greater than zero")]
    ZeroSizing {
        /// Offending field.
        field: &'static str,
    },
    /// A reference names a service that is not declared.
    #[error("references undeclared service '{name}'")]
    UndeclaredService {
        /// Referenced name.
        name: String,
    },
    /// A reference names a network that is not declared.
    #[error("references undeclared network '{name}'")]
    UndeclaredNetwork {
        /// Referenced name.
        name: String,
    },
    /// A reference names a folder that is not declared.
    #[error("references undeclared folder '{name}'")]
    UndeclaredFolder {
        /// Referenced name.
        name: String,
    },
    /// `base` links between services form a cycle.
    #[error("service dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle {
        /// Services along the cycle, first repeated at the end.
        path: Vec<String>,
    },
    /// `parent` links between folders form a cycle.
    #[error("folder nesting cycle: {}", .path.join(" -> "))]
    FolderCycle {
        /// Folders along the cycle, first repeated at the end.
        path: Vec<String>,
    },
    /// A resource is placed in more than one folder.
    #[error("already placed in folder '{first}', cannot also be placed in '{second}'")]
    MultiplePlacements {
        /// Folder holding the first placement.
        first: String,
        /// Folder attempting the second placement.
        second: String,
    },
    /// A group selects a resource outside its folder's subtree.
    #[error("selects {kind} '{name}' which is not reachable from folder '{folder}'")]
    Unreachable {
        /// `service` or `network`.
        kind: &'static str,
        /// Selected resource.
        name: String,
        /// Folder the group is assigned to.
        folder: String,
    },
    /// A group, folder, or service asks for too many instances.
    #[error("{requested} instances exceeds the limit of {limit}")]
    TooManyInstances {
        /// Requested instance count.
        requested: u32,
        /// Configured error threshold.
        limit: u32,
    },
    /// A group, folder, or service asks for zero instances.
    #[error("'instances' must be at least 1")]
    ZeroInstances,
    /// A VLAN tag is outside the assignable range.
    #[error("VLAN {vlan} is outside 1..=4094")]
    VlanOutOfRange {
        /// Offending tag.
        vlan: u16,
    },
    /// Per-group networks may not pin a VLAN, since every group's segment
    /// would carry the same tag.
    #[error("explicit VLAN {vlan} is only allowed on shared networks")]
    VlanOnPrivateNetwork {
        /// Offending tag.
        vlan: u16,
    },
    /// Two shared networks pin the same VLAN.
    #[error("VLAN {vlan} is already used by network '{other}'")]
    VlanConflict {
        /// Offending tag.
        vlan: u16,
        /// Network that claimed the tag first.
        other: String,
    },
}

/// Specification defect found before any backend call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{entity}: {rule}")]
pub struct ValidationError {
    /// Offending entity.
    pub entity: Entity,
    /// Rule violated.
    pub rule: Rule,
}

impl ValidationError {
    /// Builds a validation error.
    #[must_use]
    pub const fn new(entity: Entity, rule: Rule) -> Self {
        Self { entity, rule }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::new(
            Entity::Document,
            Rule::Malformed {
                message: message.into(),
            },
        )
    }
}

/// Reasons a specification file cannot be turned into a model.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be opened or read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that was requested.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The contents are malformed or break a rule.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}
