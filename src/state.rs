//! Preview instance types, the ordered registry and shared application state.

use crate::manager::PreviewManager;
use crate::site::ServerHandle;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// A running preview server for one project snapshot.
#[derive(Debug)]
pub struct PreviewInstance {
    pub id: String,
    pub port: u16,
    pub url: String,
    /// Private directory holding the materialized files
    pub root_directory: PathBuf,
    /// Paths written so far; also guards writes into `root_directory`
    pub files: Arc<RwLock<BTreeSet<String>>>,
    pub created_at: Instant,
    pub(crate) handle: ServerHandle,
}

impl PreviewInstance {
    pub fn summary(&self) -> ActivePreview {
        ActivePreview {
            id: self.id.clone(),
            port: self.port,
            url: self.url.clone(),
        }
    }
}

/// Returned to the caller of create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPreview {
    pub port: u16,
    pub url: String,
    pub server_id: String,
}

/// Snapshot entry of the active preview list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePreview {
    pub id: String,
    pub port: u16,
    pub url: String,
}

/// Detailed view of one preview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDetails {
    pub id: String,
    pub port: u16,
    pub url: String,
    pub age_secs: u64,
    pub files: Vec<String>,
}

/// Active instances in insertion order (oldest first).
///
/// `pending` counts creates that hold a capacity slot but are not registered
/// yet, so concurrent creates cannot overshoot the bound.
#[derive(Debug, Default)]
pub struct Registry {
    instances: HashMap<String, PreviewInstance>,
    order: VecDeque<String>,
    pending: usize,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Slots in use, counting creates still in flight.
    pub fn occupied(&self) -> usize {
        self.instances.len() + self.pending
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PreviewInstance> {
        self.instances.get(id)
    }

    pub fn insert(&mut self, instance: PreviewInstance) {
        let id = instance.id.clone();
        if self.instances.insert(id.clone(), instance).is_none() {
            self.order.push_back(id);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PreviewInstance> {
        let instance = self.instances.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(instance)
    }

    /// Remove and return the oldest instance.
    pub fn pop_oldest(&mut self) -> Option<PreviewInstance> {
        while let Some(id) = self.order.pop_front() {
            if let Some(instance) = self.instances.remove(&id) {
                return Some(instance);
            }
        }
        None
    }

    /// Remove every instance, oldest first.
    pub fn drain(&mut self) -> Vec<PreviewInstance> {
        let mut drained = Vec::with_capacity(self.instances.len());
        while let Some(instance) = self.pop_oldest() {
            drained.push(instance);
        }
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &PreviewInstance> {
        self.order.iter().filter_map(|id| self.instances.get(id))
    }

    pub(crate) fn begin_create(&mut self) {
        self.pending += 1;
    }

    pub(crate) fn finish_create(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }
}

/// Shared state of the control API.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PreviewManager>,
}

impl AppState {
    pub fn new(manager: Arc<PreviewManager>) -> Self {
        Self { manager }
    }
}
