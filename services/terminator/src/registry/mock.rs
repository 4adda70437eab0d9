//! In-memory node registry for tests and local runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, NodeId};
use tracing::{debug, info};

use super::{NodeRecord, NodeRegistry, NodeState};
use crate::error::ProviderError;

#[derive(Default)]
struct State {
    nodes: Vec<NodeRecord>,
    list_failures: VecDeque<ProviderError>,
    delete_failures: VecDeque<ProviderError>,
    list_calls: Vec<NodeState>,
    delete_calls: Vec<CorrelationKey>,
}

/// Mock registry that serves a mutable node list and records every call.
///
/// Queued failures are returned by the next matching call, one per call.
#[derive(Default)]
pub struct MockNodeRegistry {
    state: Mutex<State>,
}

impl MockNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node whose id and correlation key are both `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not a valid key.
    pub fn add_node(&self, key: &str, state: NodeState) {
        let record = NodeRecord {
            id: NodeId::parse(key).unwrap_or_else(|e| panic!("invalid mock node key {key:?}: {e}")),
            correlation_key: CorrelationKey::parse(key).ok(),
            state,
            nickname: None,
            region: None,
        };
        self.lock().nodes.push(record);
    }

    /// Add an arbitrary record.
    pub fn add_record(&self, record: NodeRecord) {
        self.lock().nodes.push(record);
    }

    pub fn fail_next_list(&self, error: ProviderError) {
        self.lock().list_failures.push_back(error);
    }

    pub fn fail_next_delete(&self, error: ProviderError) {
        self.lock().delete_failures.push_back(error);
    }

    pub fn list_calls(&self) -> Vec<NodeState> {
        self.lock().list_calls.clone()
    }

    /// Number of delete calls made for `key`.
    pub fn delete_count(&self, key: &str) -> usize {
        self.lock()
            .delete_calls
            .iter()
            .filter(|k| k.as_str() == key)
            .count()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl NodeRegistry for MockNodeRegistry {
    async fn list_by_state(&self, state: &NodeState) -> Result<Vec<NodeRecord>, ProviderError> {
        let mut guard = self.lock();
        guard.list_calls.push(state.clone());

        if let Some(error) = guard.list_failures.pop_front() {
            return Err(error);
        }

        let nodes: Vec<_> = guard
            .nodes
            .iter()
            .filter(|n| &n.state == state)
            .cloned()
            .collect();
        debug!(state = %state, count = nodes.len(), "[MOCK] Listing registry nodes");
        Ok(nodes)
    }

    async fn delete_by_correlation_key(&self, key: &CorrelationKey) -> Result<(), ProviderError> {
        let mut guard = self.lock();
        guard.delete_calls.push(key.clone());

        if let Some(error) = guard.delete_failures.pop_front() {
            return Err(error);
        }

        info!(correlation_key = %key, "[MOCK] Deleting registry node");
        guard
            .nodes
            .retain(|n| n.correlation_key.as_ref() != Some(key));
        Ok(())
    }
}
