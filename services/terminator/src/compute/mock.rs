//! In-memory compute provider for tests and local runs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, InstanceId};
use tracing::{debug, info};

use super::{ComputeInstance, ComputeProvider, LifecycleState};
use crate::error::ProviderError;

#[derive(Default)]
struct State {
    instances: Vec<ComputeInstance>,
    find_terminal_failures: VecDeque<ProviderError>,
    terminate_failures: VecDeque<ProviderError>,
    find_terminal_calls: usize,
    lookups: Vec<CorrelationKey>,
    terminate_calls: Vec<Vec<InstanceId>>,
}

/// Mock compute provider that serves a mutable instance list and records
/// every call.
///
/// Terminating an instance moves it to `shutting-down`, like the real
/// provider does.
#[derive(Default)]
pub struct MockComputeProvider {
    state: Mutex<State>,
}

impl MockComputeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance tagged with `key`.
    ///
    /// # Panics
    ///
    /// Panics if `id` or `key` is not a valid key.
    pub fn add_instance(&self, id: &str, key: &str, lifecycle_state: LifecycleState) {
        let instance = ComputeInstance {
            id: InstanceId::parse(id).unwrap_or_else(|e| panic!("invalid mock instance id {id:?}: {e}")),
            correlation_key: CorrelationKey::parse(key)
                .unwrap_or_else(|e| panic!("invalid mock correlation key {key:?}: {e}")),
            lifecycle_state,
        };
        self.lock().instances.push(instance);
    }

    pub fn fail_next_find_terminal(&self, error: ProviderError) {
        self.lock().find_terminal_failures.push_back(error);
    }

    pub fn fail_next_terminate(&self, error: ProviderError) {
        self.lock().terminate_failures.push_back(error);
    }

    pub fn find_terminal_calls(&self) -> usize {
        self.lock().find_terminal_calls
    }

    /// Keys passed to `find_instances_by_correlation_key`, in call order.
    pub fn lookups(&self) -> Vec<CorrelationKey> {
        self.lock().lookups.clone()
    }

    /// Number of lookups made for `key`.
    pub fn lookup_count(&self, key: &str) -> usize {
        self.lock()
            .lookups
            .iter()
            .filter(|k| k.as_str() == key)
            .count()
    }

    /// Batches passed to `terminate_instances`, in call order.
    pub fn terminate_calls(&self) -> Vec<Vec<InstanceId>> {
        self.lock().terminate_calls.clone()
    }

    pub fn lifecycle_state(&self, id: &str) -> Option<LifecycleState> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.id.as_str() == id)
            .map(|i| i.lifecycle_state.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ComputeProvider for MockComputeProvider {
    async fn find_terminal_instances(&self) -> Result<Vec<ComputeInstance>, ProviderError> {
        let mut guard = self.lock();
        guard.find_terminal_calls += 1;

        if let Some(error) = guard.find_terminal_failures.pop_front() {
            return Err(error);
        }

        let instances: Vec<_> = guard
            .instances
            .iter()
            .filter(|i| i.lifecycle_state.is_terminal())
            .cloned()
            .collect();
        debug!(count = instances.len(), "[MOCK] Listing terminal instances");
        Ok(instances)
    }

    async fn find_instances_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Vec<ComputeInstance>, ProviderError> {
        let mut guard = self.lock();
        guard.lookups.push(key.clone());

        Ok(guard
            .instances
            .iter()
            .filter(|i| &i.correlation_key == key && !i.lifecycle_state.is_terminal())
            .cloned()
            .collect())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        guard.terminate_calls.push(ids.to_vec());

        if let Some(error) = guard.terminate_failures.pop_front() {
            return Err(error);
        }

        for instance in guard.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            if !instance.lifecycle_state.is_terminal() {
                instance.lifecycle_state = LifecycleState::ShuttingDown;
            }
        }
        info!(count = ids.len(), "[MOCK] Terminating instances");
        Ok(())
    }
}
