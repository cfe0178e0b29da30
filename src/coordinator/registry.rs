//! Location registry and medium policy
//!
//! Stores:
//! - Locations (uuid → node, medium, liveness)
//! - Media (name → `enable_sequoia_replicas`)
//!
//! Liveness transitions go through [`LocationRegistry::with_location`], which
//! holds the per-location mutex; only the reconciliation loop calls it with
//! mutating closures.

use crate::common::{
    timestamp_now_millis, LocationId, LocationState, MediumConfig, Result, DEFAULT_MEDIUM,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Medium policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medium {
    pub name: String,
    pub enable_sequoia_replicas: bool,
}

/// Location metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    pub location_uuid: LocationId,
    pub node_address: String,
    pub default_medium: String,
    pub medium_override: Option<String>,
    pub state: LocationState,
    pub last_heartbeat: u64,
    pub state_changed_at: u64,
    /// Number of times this location has been declared down
    pub down_epoch: u64,
}

impl LocationInfo {
    /// Medium replicas placed here are assigned to
    pub fn medium(&self) -> &str {
        self.medium_override
            .as_deref()
            .unwrap_or(self.default_medium.as_str())
    }

    pub(crate) fn set_state(&mut self, state: LocationState, now: u64) {
        if state == LocationState::Down {
            self.down_epoch += 1;
        }
        self.state = state;
        self.state_changed_at = now;
    }
}

/// What the directory needs to know about a location when recording a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub medium: String,
    pub state: LocationState,
    pub sequoia_medium: bool,
    /// `down_epoch` of the location when the target was read
    pub down_epoch: u64,
}

/// Registry of locations and media
pub struct LocationRegistry {
    locations: RwLock<HashMap<LocationId, Arc<Mutex<LocationInfo>>>>,
    media: RwLock<HashMap<String, Medium>>,
}

impl LocationRegistry {
    pub fn new(media: &[MediumConfig]) -> Self {
        let mut table: HashMap<String, Medium> = media
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    Medium {
                        name: m.name.clone(),
                        enable_sequoia_replicas: m.enable_sequoia_replicas,
                    },
                )
            })
            .collect();
        table.entry(DEFAULT_MEDIUM.to_string()).or_insert_with(|| Medium {
            name: DEFAULT_MEDIUM.to_string(),
            enable_sequoia_replicas: false,
        });

        Self {
            locations: RwLock::new(HashMap::new()),
            media: RwLock::new(table),
        }
    }

    // === Medium operations ===

    /// Create a medium or change its sequoia flag. Already placed replicas keep
    /// their classification.
    pub fn set_medium_policy(&self, name: &str, enable_sequoia_replicas: bool) -> Result<Medium> {
        if name.is_empty() {
            return Err(crate::Error::InvalidArgument("medium name cannot be empty".into()));
        }
        let medium = Medium {
            name: name.to_string(),
            enable_sequoia_replicas,
        };
        let mut media = self.media.write().map_err(poisoned)?;
        let previous = media.insert(name.to_string(), medium.clone());
        if previous.map(|m| m.enable_sequoia_replicas) != Some(enable_sequoia_replicas) {
            tracing::info!(
                "Medium {}: enable_sequoia_replicas = {}",
                name,
                enable_sequoia_replicas
            );
        }
        Ok(medium)
    }

    pub fn medium(&self, name: &str) -> Option<Medium> {
        self.media.read().ok()?.get(name).cloned()
    }

    pub fn list_media(&self) -> Vec<Medium> {
        let mut media: Vec<Medium> = self
            .media
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        media.sort_by(|a, b| a.name.cmp(&b.name));
        media
    }

    fn is_sequoia_medium(&self, name: &str) -> bool {
        self.medium(name)
            .map(|m| m.enable_sequoia_replicas)
            .unwrap_or(false)
    }

    // === Location operations ===

    /// Register a new location
    pub fn register_location(
        &self,
        location_uuid: LocationId,
        node_address: &str,
        medium: &str,
    ) -> Result<LocationInfo> {
        if self.medium(medium).is_none() {
            return Err(crate::Error::NoSuchMedium(medium.to_string()));
        }

        let now = timestamp_now_millis();
        let info = LocationInfo {
            location_uuid,
            node_address: node_address.to_string(),
            default_medium: medium.to_string(),
            medium_override: None,
            state: LocationState::Up,
            last_heartbeat: now,
            state_changed_at: now,
            down_epoch: 0,
        };

        let mut locations = self.locations.write().map_err(poisoned)?;
        if locations.contains_key(&location_uuid) {
            return Err(crate::Error::LocationExists(location_uuid));
        }
        locations.insert(location_uuid, Arc::new(Mutex::new(info.clone())));
        tracing::info!(
            "Registered location {} on {} (medium {})",
            location_uuid,
            node_address,
            medium
        );
        Ok(info)
    }

    /// Run `f` on a location under its mutex
    pub fn with_location<R>(
        &self,
        location_uuid: &LocationId,
        f: impl FnOnce(&mut LocationInfo) -> R,
    ) -> Option<R> {
        let entry = self.locations.read().ok()?.get(location_uuid).cloned()?;
        let mut info = entry.lock().ok()?;
        Some(f(&mut info))
    }

    /// Snapshot of one location
    pub fn location(&self, location_uuid: &LocationId) -> Option<LocationInfo> {
        self.with_location(location_uuid, |info| info.clone())
    }

    pub fn list_locations(&self) -> Vec<LocationInfo> {
        let entries: Vec<Arc<Mutex<LocationInfo>>> = match self.locations.read() {
            Ok(locations) => locations.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut infos: Vec<LocationInfo> = entries
            .iter()
            .filter_map(|e| e.lock().ok().map(|info| info.clone()))
            .collect();
        infos.sort_by_key(|info| info.location_uuid);
        infos
    }

    pub fn location_ids(&self) -> Vec<LocationId> {
        self.locations
            .read()
            .map(|l| l.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Medium, liveness and policy of a location, read at record time
    pub fn replica_target(&self, location_uuid: &LocationId) -> Option<ReplicaTarget> {
        self.with_replica_target(location_uuid, ReplicaTarget::clone)
    }

    /// Run `f` on the location's target with the location mutex held, so its
    /// liveness cannot change before `f` returns
    pub fn with_replica_target<R>(
        &self,
        location_uuid: &LocationId,
        f: impl FnOnce(&ReplicaTarget) -> R,
    ) -> Option<R> {
        self.with_location(location_uuid, |info| {
            let medium = info.medium().to_string();
            let target = ReplicaTarget {
                sequoia_medium: self.is_sequoia_medium(&medium),
                medium,
                state: info.state,
                down_epoch: info.down_epoch,
            };
            f(&target)
        })
    }

    /// Administrative medium reassignment; `None` clears the override
    pub fn set_medium_override(
        &self,
        location_uuid: &LocationId,
        medium: Option<&str>,
    ) -> Result<LocationInfo> {
        if let Some(name) = medium {
            if self.medium(name).is_none() {
                return Err(crate::Error::NoSuchMedium(name.to_string()));
            }
        }
        self.with_location(location_uuid, |info| {
            info.medium_override = medium.map(str::to_string);
            tracing::info!("Location {} now on medium {}", info.location_uuid, info.medium());
            info.clone()
        })
        .ok_or(crate::Error::NoSuchLocation(*location_uuid))
    }

    /// Remember the latest heartbeat; liveness itself is left to the loop
    pub fn record_heartbeat(&self, location_uuid: &LocationId, at: u64) -> Result<LocationState> {
        self.with_location(location_uuid, |info| {
            info.last_heartbeat = info.last_heartbeat.max(at);
            info.state
        })
        .ok_or(crate::Error::NoSuchLocation(*location_uuid))
    }

    /// Forget a location (decommission)
    pub fn remove_location(&self, location_uuid: &LocationId) -> Option<LocationInfo> {
        let entry = self.locations.write().ok()?.remove(location_uuid)?;
        let info = entry.lock().ok()?.clone();
        tracing::info!("Removed location {}", location_uuid);
        Some(info)
    }

    /// (up, suspect, down-or-reaped) location counts
    pub fn state_counts(&self) -> (u64, u64, u64) {
        let mut counts = (0, 0, 0);
        for info in self.list_locations() {
            match info.state {
                LocationState::Up => counts.0 += 1,
                LocationState::Suspect => counts.1 += 1,
                LocationState::Down | LocationState::Reaped => counts.2 += 1,
            }
        }
        counts
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> crate::Error {
    crate::Error::Internal("registry lock poisoned".into())
}
