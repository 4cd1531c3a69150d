//! In-process virtualization backend.
//!
//! [`SimulatedClient`] models folders, instances, templates, and network
//! segments closely enough to exercise every phase: parents must exist before
//! children, only templates can be cloned, powered-on instances and non-empty
//! folders refuse deletion, and networks with attached instances stay put.
//! With a state file the inventory is persisted as JSON after every
//! mutation so that separate CLI invocations observe each other's work.

mod store;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::trace;

use crate::backend::{
    BackendFuture, ClassifyError, ErrorClass, ImageSource, PowerState, Resource, ResourceKind,
    ResourcePath, ResourceSpec, VirtualizationClient,
};

use store::StateFile;

/// Errors raised by [`SimulatedClient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SimulatedError {
    /// The addressed resource does not exist.
    #[error("{path} not found")]
    NotFound {
        /// Missing path.
        path: String,
    },
    /// A resource already occupies the destination path.
    #[error("{path} already exists")]
    AlreadyExists {
        /// Occupied path.
        path: String,
    },
    /// The resource is not in a state that permits the operation.
    #[error("{path}: {detail}")]
    InvalidState {
        /// Resource path.
        path: String,
        /// Why the operation was refused.
        detail: String,
    },
    /// The backend is temporarily unable to serve the call.
    #[error("backend unavailable during {operation}")]
    Unavailable {
        /// Operation that was interrupted.
        operation: String,
    },
    /// The state file could not be read or written.
    #[error("state file {path}: {message}")]
    Store {
        /// State file path.
        path: String,
        /// Underlying failure.
        message: String,
    },
}

impl ClassifyError for SimulatedError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } => ErrorClass::AlreadyExists,
            Self::Unavailable { .. } => ErrorClass::Transient,
            Self::InvalidState { .. } | Self::Store { .. } => ErrorClass::Permanent,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Inventory {
    next_id: u64,
    resources: BTreeMap<ResourcePath, Resource>,
}

impl Inventory {
    fn from_state(state: StateFile) -> Self {
        Self {
            next_id: state.next_id,
            resources: state
                .resources
                .into_iter()
                .map(|resource| (resource.path.clone(), resource))
                .collect(),
        }
    }

    fn to_state(&self) -> StateFile {
        StateFile {
            next_id: self.next_id,
            resources: self.resources.values().cloned().collect(),
        }
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("sim-{}", self.next_id)
    }

    fn get(&self, path: &ResourcePath) -> Result<&Resource, SimulatedError> {
        self.resources
            .get(path)
            .ok_or_else(|| SimulatedError::NotFound {
                path: path.to_string(),
            })
    }

    fn get_mut(&mut self, path: &ResourcePath) -> Result<&mut Resource, SimulatedError> {
        self.resources
            .get_mut(path)
            .ok_or_else(|| SimulatedError::NotFound {
                path: path.to_string(),
            })
    }

    fn require_vacant(&self, path: &ResourcePath) -> Result<(), SimulatedError> {
        if self.resources.contains_key(path) {
            return Err(SimulatedError::AlreadyExists {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn require_parent(&self, path: &ResourcePath) -> Result<(), SimulatedError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let folder = self.get(&parent)?;
        if folder.kind != ResourceKind::Folder {
            return Err(SimulatedError::InvalidState {
                path: parent.to_string(),
                detail: format!("{} cannot contain resources", folder.kind),
            });
        }
        Ok(())
    }

    fn insert(&mut self, mut resource: Resource) -> Resource {
        resource.id = self.allocate_id();
        self.resources
            .insert(resource.path.clone(), resource.clone());
        resource
    }
}

fn blank(path: ResourcePath, kind: ResourceKind) -> Resource {
    Resource {
        id: String::new(),
        path,
        kind,
        power: PowerState::Off,
        source: None,
        networks: Vec::new(),
        note: None,
        vlan: None,
    }
}

fn invalid(path: &ResourcePath, detail: impl Into<String>) -> SimulatedError {
    SimulatedError::InvalidState {
        path: path.to_string(),
        detail: detail.into(),
    }
}

/// In-memory (optionally file-backed) [`VirtualizationClient`].
#[derive(Debug, Default)]
pub struct SimulatedClient {
    inventory: Mutex<Inventory>,
    state_file: Option<Utf8PathBuf>,
}

impl SimulatedClient {
    /// Creates an empty, purely in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a backend persisted at `path`, starting empty when the file does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatedError::Store`] when the file exists but cannot be
    /// read or parsed.
    pub fn open(path: &Utf8Path) -> Result<Self, SimulatedError> {
        let state = store::read_state(path)?;
        Ok(Self {
            inventory: Mutex::new(Inventory::from_state(state)),
            state_file: Some(path.to_path_buf()),
        })
    }

    /// Returns every resource, ordered by path.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Resource> {
        self.lock().resources.values().cloned().collect()
    }

    /// Counts resources of `kind`.
    #[must_use]
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.lock()
            .resources
            .values()
            .filter(|resource| resource.kind == kind)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` under the lock and persists the result. When either
    /// step fails the inventory is left as it was.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Inventory) -> Result<T, SimulatedError>,
    ) -> Result<T, SimulatedError> {
        let mut inventory = self.lock();
        let before = inventory.clone();
        let outcome = change(&mut inventory).and_then(|value| {
            if let Some(path) = &self.state_file {
                store::write_state(path, &inventory.to_state())?;
            }
            Ok(value)
        });
        if outcome.is_err() {
            *inventory = before;
        }
        outcome
    }

    fn create_now(&self, spec: &ResourceSpec) -> Result<Resource, SimulatedError> {
        self.mutate(|inventory| {
            let path = spec.path();
            inventory.require_vacant(path)?;
            inventory.require_parent(path)?;
            let resource = match spec {
                ResourceSpec::Folder { path: folder } => {
                    blank(folder.clone(), ResourceKind::Folder)
                }
                ResourceSpec::Instance(instance) => {
                    let mut resource = blank(instance.path.clone(), ResourceKind::Instance);
                    if let ImageSource::Template(template) = &instance.image {
                        let base = inventory.get(template)?;
                        if base.kind != ResourceKind::Template {
                            return Err(invalid(template, "only templates can seed instances"));
                        }
                        resource.source = Some(template.clone());
                    }
                    resource.note.clone_from(&instance.note);
                    resource
                }
                ResourceSpec::Network(network) => {
                    let mut resource = blank(network.path.clone(), ResourceKind::Network);
                    resource.vlan = Some(network.vlan);
                    resource
                }
            };
            trace!(path = %path, kind = %resource.kind, "simulated create");
            Ok(inventory.insert(resource))
        })
    }

    fn clone_now(
        &self,
        source: &Resource,
        dest_name: &str,
        dest_path: &ResourcePath,
    ) -> Result<Resource, SimulatedError> {
        self.mutate(|inventory| {
            let template = inventory.get(&source.path)?;
            if template.kind != ResourceKind::Template {
                return Err(invalid(&source.path, "only templates can be cloned"));
            }
            let note = template.note.clone();
            let destination = dest_path.join(dest_name);
            inventory.require_vacant(&destination)?;
            inventory.require_parent(&destination)?;

            let mut clone = blank(destination, ResourceKind::Instance);
            clone.source = Some(source.path.clone());
            clone.note = note;
            Ok(inventory.insert(clone))
        })
    }

    fn delete_now(&self, resource: &Resource) -> Result<(), SimulatedError> {
        self.mutate(|inventory| {
            let path = &resource.path;
            let current = inventory.get(path)?;
            match current.kind {
                ResourceKind::Folder => {
                    if inventory
                        .resources
                        .keys()
                        .any(|other| other.is_within(path))
                    {
                        return Err(invalid(path, "folder is not empty"));
                    }
                }
                ResourceKind::Network => {
                    if inventory
                        .resources
                        .values()
                        .any(|other| other.is_attached_to(path))
                    {
                        return Err(invalid(path, "instances are still attached"));
                    }
                }
                ResourceKind::Instance => {
                    if current.power == PowerState::On {
                        return Err(invalid(path, "instance is powered on"));
                    }
                }
                ResourceKind::Template => {
                    if inventory
                        .resources
                        .values()
                        .any(|other| other.source.as_ref() == Some(path))
                    {
                        return Err(invalid(path, "template still has dependents"));
                    }
                }
            }
            inventory.resources.remove(path);
            trace!(path = %path, "simulated delete");
            Ok(())
        })
    }

    fn set_power(&self, resource: &Resource, power: PowerState) -> Result<(), SimulatedError> {
        self.mutate(|inventory| {
            let current = inventory.get_mut(&resource.path)?;
            if current.kind != ResourceKind::Instance {
                return Err(invalid(
                    &resource.path,
                    format!("a {} has no power state", current.kind),
                ));
            }
            current.power = power;
            Ok(())
        })
    }

    fn attach_now(&self, resource: &Resource, network: &Resource) -> Result<(), SimulatedError> {
        self.mutate(|inventory| {
            let segment = inventory.get(&network.path)?;
            if segment.kind != ResourceKind::Network {
                return Err(invalid(&network.path, "is not a network segment"));
            }
            let current = inventory.get_mut(&resource.path)?;
            if current.kind != ResourceKind::Instance {
                return Err(invalid(&resource.path, "only instances attach to networks"));
            }
            if !current.is_attached_to(&network.path) {
                current.networks.push(network.path.clone());
            }
            Ok(())
        })
    }

    fn convert_now(&self, resource: &Resource) -> Result<Resource, SimulatedError> {
        self.mutate(|inventory| {
            let current = inventory.get_mut(&resource.path)?;
            if current.kind != ResourceKind::Instance {
                return Err(invalid(&resource.path, "only instances become templates"));
            }
            if current.power == PowerState::On {
                return Err(invalid(&resource.path, "instance must be powered off"));
            }
            current.kind = ResourceKind::Template;
            Ok(current.clone())
        })
    }
}

impl VirtualizationClient for SimulatedClient {
    type Error = SimulatedError;

    fn find<'a>(
        &'a self,
        path: &'a ResourcePath,
    ) -> BackendFuture<'a, Option<Resource>, Self::Error> {
        Box::pin(async move { Ok(self.lock().resources.get(path).cloned()) })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> BackendFuture<'a, Vec<Resource>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .lock()
                .resources
                .values()
                .filter(|resource| prefix.is_empty() || resource.path.is_within(prefix))
                .cloned()
                .collect())
        })
    }

    fn create<'a>(&'a self, spec: &'a ResourceSpec) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move { self.create_now(spec) })
    }

    fn clone_instance<'a>(
        &'a self,
        source: &'a Resource,
        dest_name: &'a str,
        dest_path: &'a ResourcePath,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move { self.clone_now(source, dest_name, dest_path) })
    }

    fn delete<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete_now(resource) })
    }

    fn power_on<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.set_power(resource, PowerState::On) })
    }

    fn power_off<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.set_power(resource, PowerState::Off) })
    }

    fn attach_network<'a>(
        &'a self,
        resource: &'a Resource,
        network: &'a Resource,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.attach_now(resource, network) })
    }

    fn convert_to_template<'a>(
        &'a self,
        resource: &'a Resource,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move { self.convert_now(resource) })
    }
}

#[cfg(test)]
mod tests;
