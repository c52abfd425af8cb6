use dockbox_core::{DockboxError, Profile, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::traits::ContainerRuntime;

/// Containers created by one engine, with the profile each was created under.
#[derive(Debug, Default)]
pub struct ContainerTracker {
    created: Vec<String>,
    profiles: HashMap<String, Profile>,
}

impl ContainerTracker {
    pub fn track(&mut self, id: &str, profile: Profile) {
        if self.profiles.insert(id.to_string(), profile).is_none() {
            self.created.push(id.to_string());
        }
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn forget(&mut self, id: &str) {
        self.profiles.remove(id);
        self.created.retain(|c| c != id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    /// Ids in creation order.
    pub fn ids(&self) -> Vec<String> {
        self.created.clone()
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

/// Tracker shared between an engine and its shutdown hook.
#[derive(Debug, Clone, Default)]
pub struct SharedTracker(Arc<Mutex<ContainerTracker>>);

impl SharedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ContainerTracker> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Force-removes every tracked container the runtime still knows about.
///
/// Returns the ids that were removed.
pub async fn reclaim(
    runtime: &dyn ContainerRuntime,
    tracker: &SharedTracker,
) -> Result<Vec<String>> {
    let ids = tracker.lock().ids();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let listed = runtime
        .list_containers(&ids)
        .await
        .map_err(|e| DockboxError::runtime("list_containers", e))?;

    let mut removed = Vec::with_capacity(listed.len());
    for id in listed {
        runtime
            .remove_container(&id)
            .await
            .map_err(|e| DockboxError::runtime("remove_container", e))?;
        tracker.lock().forget(&id);
        removed.push(id);
    }

    // Whatever the runtime no longer lists is gone already
    let stale: Vec<String> = tracker.lock().ids();
    if !stale.is_empty() {
        warn!("Dropping {} containers the runtime no longer lists", stale.len());
        let mut guard = tracker.lock();
        for id in &stale {
            guard.forget(id);
        }
    }

    info!("Reclaimed {} containers", removed.len());
    Ok(removed)
}
