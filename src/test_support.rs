//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{
    BackendFuture, Resource, ResourcePath, ResourceSpec, VirtualizationClient,
};
use crate::simulated::{SimulatedClient, SimulatedError};

/// Backend operation names used for call accounting and fault injection.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    /// `find`
    Find,
    /// `list`
    List,
    /// `create`
    Create,
    /// `clone_instance`
    Clone,
    /// `delete`
    Delete,
    /// `power_on`
    PowerOn,
    /// `power_off`
    PowerOff,
    /// `attach_network`
    Attach,
    /// `convert_to_template`
    Convert,
}

impl Operation {
    /// Reports whether the operation changes backend state.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::Find | Self::List)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Find => "find",
            Self::List => "list",
            Self::Create => "create",
            Self::Clone => "clone",
            Self::Delete => "delete",
            Self::PowerOn => "power_on",
            Self::PowerOff => "power_off",
            Self::Attach => "attach_network",
            Self::Convert => "convert_to_template",
        };
        f.write_str(label)
    }
}

/// A call observed by [`FlakyClient`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Call {
    /// Operation invoked.
    pub operation: Operation,
    /// Path the call addressed (the destination for clones).
    pub path: String,
}

#[derive(Clone, Debug)]
struct Fault {
    operation: Operation,
    fragment: String,
    /// `None` fails forever with a permanent error.
    remaining: Option<u32>,
}

/// Call-counting, failure-injecting wrapper around [`SimulatedClient`].
///
/// Faults match on operation and a substring of the addressed path.
/// Transient faults fire a fixed number of times and then let calls through;
/// permanent faults fire on every matching call.
#[derive(Debug, Default)]
pub struct FlakyClient {
    inner: SimulatedClient,
    faults: StdMutex<Vec<Fault>>,
    calls: StdMutex<Vec<Call>>,
}

fn locked<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FlakyClient {
    /// Wraps an empty simulated backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing simulated backend.
    #[must_use]
    pub fn wrapping(inner: SimulatedClient) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Returns the wrapped backend for direct inspection.
    #[must_use]
    pub const fn inner(&self) -> &SimulatedClient {
        &self.inner
    }

    /// Fails the next `times` matching calls with a transient error.
    pub fn fail_transient(&self, operation: Operation, fragment: &str, times: u32) {
        locked(&self.faults).push(Fault {
            operation,
            fragment: fragment.to_owned(),
            remaining: Some(times),
        });
    }

    /// Fails every matching call with a permanent error.
    pub fn fail_permanent(&self, operation: Operation, fragment: &str) {
        locked(&self.faults).push(Fault {
            operation,
            fragment: fragment.to_owned(),
            remaining: None,
        });
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        locked(&self.faults).clear();
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    /// Total number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }

    /// Number of calls made for `operation`.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Number of state-changing calls made so far.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|call| call.operation.is_mutation())
            .count()
    }

    /// Forgets recorded calls.
    pub fn reset_calls(&self) {
        locked(&self.calls).clear();
    }

    fn intercept(&self, operation: Operation, path: &ResourcePath) -> Result<(), SimulatedError> {
        locked(&self.calls).push(Call {
            operation,
            path: path.to_string(),
        });
        let mut faults = locked(&self.faults);
        let Some(fault) = faults
            .iter_mut()
            .find(|fault| {
                fault.operation == operation
                    && path.as_str().contains(&fault.fragment)
                    && fault.remaining != Some(0)
            })
        else {
            return Ok(());
        };
        match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                Err(SimulatedError::Unavailable {
                    operation: format!("{operation} {path}"),
                })
            }
            None => Err(SimulatedError::InvalidState {
                path: path.to_string(),
                detail: format!("injected {operation} failure"),
            }),
        }
    }
}

impl VirtualizationClient for FlakyClient {
    type Error = SimulatedError;

    fn find<'a>(
        &'a self,
        path: &'a ResourcePath,
    ) -> BackendFuture<'a, Option<Resource>, Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Find, path)?;
            self.inner.find(path).await
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> BackendFuture<'a, Vec<Resource>, Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::List, prefix)?;
            self.inner.list(prefix).await
        })
    }

    fn create<'a>(&'a self, spec: &'a ResourceSpec) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Create, spec.path())?;
            self.inner.create(spec).await
        })
    }

    fn clone_instance<'a>(
        &'a self,
        source: &'a Resource,
        dest_name: &'a str,
        dest_path: &'a ResourcePath,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Clone, &dest_path.join(dest_name))?;
            self.inner.clone_instance(source, dest_name, dest_path).await
        })
    }

    fn delete<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Delete, &resource.path)?;
            self.inner.delete(resource).await
        })
    }

    fn power_on<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::PowerOn, &resource.path)?;
            self.inner.power_on(resource).await
        })
    }

    fn power_off<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::PowerOff, &resource.path)?;
            self.inner.power_off(resource).await
        })
    }

    fn attach_network<'a>(
        &'a self,
        resource: &'a Resource,
        network: &'a Resource,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Attach, &resource.path)?;
            self.inner.attach_network(resource, network).await
        })
    }

    fn convert_to_template<'a>(
        &'a self,
        resource: &'a Resource,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        Box::pin(async move {
            self.intercept(Operation::Convert, &resource.path)?;
            self.inner.convert_to_template(resource).await
        })
    }
}

/// Wrapper around [`SimulatedClient`] that records how many backend calls
/// were in flight at once.
///
/// Every call yields once before reaching the backend so that concurrent
/// callers overlap even on a single-threaded runtime.
#[derive(Debug, Default)]
pub struct GaugedClient {
    inner: SimulatedClient,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugedClient {
    /// Wraps an empty simulated backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneous calls observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Forgets the recorded peak.
    pub fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }

    fn gauged<'a, T>(
        &'a self,
        call: BackendFuture<'a, T, SimulatedError>,
    ) -> BackendFuture<'a, T, SimulatedError>
    where
        T: Send + 'a,
    {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let result = call.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

impl VirtualizationClient for GaugedClient {
    type Error = SimulatedError;

    fn find<'a>(
        &'a self,
        path: &'a ResourcePath,
    ) -> BackendFuture<'a, Option<Resource>, Self::Error> {
        self.gauged(self.inner.find(path))
    }

    fn list<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> BackendFuture<'a, Vec<Resource>, Self::Error> {
        self.gauged(self.inner.list(prefix))
    }

    fn create<'a>(&'a self, spec: &'a ResourceSpec) -> BackendFuture<'a, Resource, Self::Error> {
        self.gauged(self.inner.create(spec))
    }

    fn clone_instance<'a>(
        &'a self,
        source: &'a Resource,
        dest_name: &'a str,
        dest_path: &'a ResourcePath,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        self.gauged(self.inner.clone_instance(source, dest_name, dest_path))
    }

    fn delete<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        self.gauged(self.inner.delete(resource))
    }

    fn power_on<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        self.gauged(self.inner.power_on(resource))
    }

    fn power_off<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        self.gauged(self.inner.power_off(resource))
    }

    fn attach_network<'a>(
        &'a self,
        resource: &'a Resource,
        network: &'a Resource,
    ) -> BackendFuture<'a, (), Self::Error> {
        self.gauged(self.inner.attach_network(resource, network))
    }

    fn convert_to_template<'a>(
        &'a self,
        resource: &'a Resource,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        self.gauged(self.inner.convert_to_template(resource))
    }
}

/// A small but complete specification: a base service, a derived service,
/// a private and a shared network, nested folders, and a template group.
#[must_use]
pub fn sample_spec() -> &'static str {
    r"
metadata:
  name: intro-lab
  description: Introductory red team exercise
services:
  - name: kali
    image: kali-rolling
    cpus: 2
    memory-mb: 4096
    packages: [nmap]
    note: Attacker workstation
  - name: kali-web
    base: kali
  - name: target
    image: debian-12
networks:
  - name: lan
  - name: scoreboard
    shared: true
folders:
  - name: red-team
  - name: attackers
    parent: red-team
    services: [kali, kali-web]
    networks: [lan]
groups:
  - name: team
    folder: attackers
    services: [kali-web, target]
    networks: [lan, scoreboard]
    instances: 3
  - name: observer
    folder: red-team
    services: [target]
"
}

/// A specification exercising numbered copies: a service cloned twice per
/// group and a folder deployed twice.
#[must_use]
pub fn replicated_spec() -> &'static str {
    r"
metadata:
  name: pods-lab
services:
  - name: web
    image: nginx
    instances: 2
  - name: db
    image: postgres
folders:
  - name: pods
    instances: 2
groups:
  - name: team
    folder: pods
    services: [web, db]
"
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
