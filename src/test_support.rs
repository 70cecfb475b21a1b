//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::host::{HostDeleteRequest, HostDescriptor, HostStatus, ListFilter, ProvisionedHost};
use crate::provider::lookup;
use crate::provider::{ProvisionError, ProvisionFuture, Provisioner};
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError, TransportFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted transport that replays pre-seeded responses in FIFO order.
///
/// Used to drive adapters deterministically without touching the network.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<Result<ApiResponse, TransportError>>>>,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
}

impl ScriptedTransport {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response with a JSON body.
    pub fn push_json(&self, status: u16, body: &serde_json::Value) {
        lock(&self.responses).push_back(Ok(ApiResponse::new(status, body.to_string())));
    }

    /// Queues a response with an empty body.
    pub fn push_status(&self, status: u16) {
        lock(&self.responses).push_back(Ok(ApiResponse::new(status, "")));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, message: &str) {
        lock(&self.responses).push_back(Err(TransportError::Request {
            url: String::from("scripted"),
            message: message.to_owned(),
        }));
    }

    /// Returns a snapshot of every request sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    /// Returns `METHOD path` for every request, for compact assertions.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| format!("{} {}", request.method, request.path))
            .collect()
    }

    /// Returns how many responses are still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
        let path = request.path.clone();
        lock(&self.requests).push(request);
        let next = lock(&self.responses).pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(TransportError::Request {
                    url: path,
                    message: String::from("no scripted response available"),
                })
            })
        })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    provisioned: VecDeque<Result<ProvisionedHost, ProvisionError>>,
    statuses: VecDeque<Result<ProvisionedHost, ProvisionError>>,
    listed: Vec<ProvisionedHost>,
    delete_failure: Option<ProvisionError>,
    remove_on_delete: bool,
    status_calls: usize,
    deleted: Vec<HostDeleteRequest>,
    descriptors: Vec<HostDescriptor>,
}

/// In-memory [`Provisioner`] with scripted results.
///
/// Status responses replay in order; once one remains it is repeated, so a
/// single `Creating` entry models a host that never becomes active.
#[derive(Clone, Debug, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvisioner {
    /// Creates a provisioner with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the result of the next `provision` call.
    pub fn push_provisioned(&self, result: Result<ProvisionedHost, ProvisionError>) {
        lock(&self.state).provisioned.push_back(result);
    }

    /// Scripts a status observation.
    pub fn push_status(&self, id: &str, ip: &str, status: HostStatus) {
        lock(&self.state)
            .statuses
            .push_back(Ok(ProvisionedHost::observed(id, ip, status)));
    }

    /// Scripts a failing status call.
    pub fn push_status_error(&self, err: ProvisionError) {
        lock(&self.state).statuses.push_back(Err(err));
    }

    /// Sets the hosts returned by `list`.
    pub fn set_listed(&self, hosts: Vec<ProvisionedHost>) {
        lock(&self.state).listed = hosts;
    }

    /// Makes every subsequent `delete` fail with `err`.
    pub fn fail_delete(&self, err: ProvisionError) {
        lock(&self.state).delete_failure = Some(err);
    }

    /// Removes deleted hosts from the listed set.
    pub fn remove_deleted_hosts(&self) {
        lock(&self.state).remove_on_delete = true;
    }

    /// Returns how many times `status` was called.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        lock(&self.state).status_calls
    }

    /// Returns every delete request received.
    #[must_use]
    pub fn deleted(&self) -> Vec<HostDeleteRequest> {
        lock(&self.state).deleted.clone()
    }

    /// Returns every descriptor passed to `provision`.
    #[must_use]
    pub fn descriptors(&self) -> Vec<HostDescriptor> {
        lock(&self.state).descriptors.clone()
    }

    fn next_status(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        let mut state = lock(&self.state);
        state.status_calls += 1;
        if state.statuses.len() > 1 {
            return state
                .statuses
                .pop_front()
                .unwrap_or_else(|| Err(not_found(id)));
        }
        state
            .statuses
            .front()
            .cloned()
            .unwrap_or_else(|| Err(not_found(id)))
    }

    fn record_delete(&self, request: &HostDeleteRequest) -> Result<(), ProvisionError> {
        request.validate()?;
        let mut state = lock(&self.state);
        state.deleted.push(request.clone());
        let id = match request.id() {
            Some(id) => id.to_owned(),
            None => {
                let ip = request.ip().unwrap_or_default();
                lookup::resolve_id(&state.listed, ip)?
            }
        };
        if state.remove_on_delete {
            state.listed.retain(|host| host.id != id);
        }
        state.delete_failure.clone().map_or(Ok(()), Err)
    }
}

fn not_found(id: &str) -> ProvisionError {
    ProvisionError::NotFound {
        resource: format!("host {id}"),
    }
}

impl Provisioner for FakeProvisioner {
    fn provision<'a>(
        &'a self,
        descriptor: &'a HostDescriptor,
    ) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.descriptors.push(descriptor.clone());
            state.provisioned.pop_front().unwrap_or_else(|| {
                Ok(ProvisionedHost::creating(format!("{}-id", descriptor.name)))
            })
        })
    }

    fn status<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ProvisionedHost> {
        Box::pin(async move { self.next_status(id) })
    }

    fn delete<'a>(&'a self, request: &'a HostDeleteRequest) -> ProvisionFuture<'a, ()> {
        Box::pin(async move { self.record_delete(request) })
    }

    fn list<'a>(&'a self, _filter: &'a ListFilter) -> ProvisionFuture<'a, Vec<ProvisionedHost>> {
        Box::pin(async move { Ok(lock(&self.state).listed.clone()) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
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

    /// Removes variables while holding the global mutex.
    pub async fn unset_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
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
