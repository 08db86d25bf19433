//! Backend service registry with round-robin instance selection
//!
//! A service name maps to an ordered instance list. Selection walks the
//! healthy subset round-robin; when nothing is healthy the full list is the
//! last-resort pool, so a registered service always yields a URL.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ServiceEntryConfig;
use crate::error::{Error, Result};

/// A single backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Instance id, unique within the service
    pub id: String,

    /// Service name this instance belongs to
    pub service: String,

    /// Base URL (`http://erp:5001`)
    pub base_url: String,

    /// Current health flag
    pub healthy: bool,

    /// Registration timestamp
    pub registered_at: DateTime<Utc>,

    /// Relative weight (reserved for weighted balancing)
    pub weight: u32,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create an instance with defaults for the bookkeeping fields
    pub fn new(id: impl Into<String>, service: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            base_url: base_url.into(),
            healthy: true,
            registered_at: Utc::now(),
            weight: 1,
            metadata: HashMap::new(),
        }
    }
}

/// Per-service state: ordered instances plus the round-robin cursor
struct ServiceEntry {
    instances: Vec<ServiceInstance>,
    cursor: AtomicUsize,
}

/// Registry of backend services
///
/// Mutation is serialized per service name through the map's entry locks;
/// reads are lock-free snapshots.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from configuration
    pub fn from_config(entries: &[ServiceEntryConfig]) -> Self {
        let registry = Self::new();
        for entry in entries {
            for instance in &entry.instances {
                let mut si = ServiceInstance::new(&instance.id, &entry.name, &instance.base_url);
                si.healthy = instance.healthy;
                si.weight = instance.weight;
                si.metadata = instance.metadata.clone();
                registry.register(si);
            }
        }
        registry
    }

    /// Register an instance; same-id registration replaces in place
    pub fn register(&self, instance: ServiceInstance) {
        let mut entry = self
            .services
            .entry(instance.service.clone())
            .or_insert_with(|| ServiceEntry {
                instances: Vec::new(),
                cursor: AtomicUsize::new(0),
            });

        if let Some(existing) = entry.instances.iter_mut().find(|i| i.id == instance.id) {
            *existing = instance;
        } else {
            entry.instances.push(instance);
        }
    }

    /// Remove an instance by id; empty services stay registered with an
    /// empty pool
    pub fn deregister(&self, instance_id: &str) -> bool {
        for mut entry in self.services.iter_mut() {
            let before = entry.instances.len();
            entry.instances.retain(|i| i.id != instance_id);
            if entry.instances.len() != before {
                return true;
            }
        }
        false
    }

    /// Flip an instance's health flag
    pub fn update_health(&self, instance_id: &str, healthy: bool) -> bool {
        for mut entry in self.services.iter_mut() {
            if let Some(instance) = entry.instances.iter_mut().find(|i| i.id == instance_id) {
                instance.healthy = healthy;
                return true;
            }
        }
        false
    }

    /// Snapshot the instances of a service
    pub fn instances_of(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service)
            .map(|entry| entry.instances.clone())
            .unwrap_or_default()
    }

    /// Names of all registered services
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Select the next instance for a service round-robin
    ///
    /// Healthy instances are preferred; an all-unhealthy pool is still used
    /// rather than failing the request here.
    pub fn select(&self, service: &str) -> Result<ServiceInstance> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| Error::Internal(format!("Unknown service '{}'", service)))?;

        if entry.instances.is_empty() {
            return Err(Error::Internal(format!(
                "Service '{}' has no registered instances",
                service
            )));
        }

        let healthy: Vec<&ServiceInstance> =
            entry.instances.iter().filter(|i| i.healthy).collect();
        let pool: Vec<&ServiceInstance> = if healthy.is_empty() {
            entry.instances.iter().collect()
        } else {
            healthy
        };

        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[index].clone())
    }

    /// Base URL of the next instance for a service
    pub fn url_for(&self, service: &str) -> Result<String> {
        Ok(self.select(service)?.base_url.clone())
    }
}
