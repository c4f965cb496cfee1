//! Round-robin instance selection with per-instance request/error counters.

use crate::config::{ConfigError, ConfigResult};
use crate::io_struct::StatsSnapshot;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub address: String,
}

impl InstanceInfo {
    pub fn new(address: impl Into<String>) -> Self {
        InstanceInfo {
            address: address.into(),
        }
    }

    /// Bare `host:port` addresses are reached over plain http.
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    pub fn api_path(&self, api_path: &str) -> String {
        if api_path.starts_with('/') {
            format!("{}{}", self.base_url(), api_path)
        } else {
            format!("{}/{}", self.base_url(), api_path)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstanceStats {
    pub requests: u64,
    pub errors: u64,
}

/// Rotation state shared by every request routed through one dispatcher.
///
/// The instance list is fixed at construction. The cursor always stays in
/// `[0, len)` and is advanced with a single atomic read-modify-write, so
/// concurrent callers never observe the same cursor value.
#[derive(Debug)]
pub struct RoundRobin {
    instances: Vec<InstanceInfo>,
    cursor: AtomicUsize,
    stats: DashMap<String, InstanceStats>,
}

impl RoundRobin {
    pub fn new(instances: Vec<InstanceInfo>) -> ConfigResult<Self> {
        if instances.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "instances".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for instance in &instances {
            if !seen.insert(instance.address.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "instances".to_string(),
                    value: instance.address.clone(),
                    reason: "duplicate instance address".to_string(),
                });
            }
        }

        let stats = instances
            .iter()
            .map(|i| (i.address.clone(), InstanceStats::default()))
            .collect();
        Ok(RoundRobin {
            instances,
            cursor: AtomicUsize::new(0),
            stats,
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[InstanceInfo] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> &InstanceInfo {
        &self.instances[index % self.instances.len()]
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Returns the index under the cursor and advances the cursor by one.
    pub fn next_index(&self) -> usize {
        let len = self.instances.len();
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub fn next_instance(&self) -> &InstanceInfo {
        &self.instances[self.next_index()]
    }

    pub fn record_request(&self, address: &str) {
        self.stats.entry(address.to_string()).or_default().requests += 1;
    }

    pub fn record_outcome(&self, address: &str, success: bool) {
        if !success {
            self.stats.entry(address.to_string()).or_default().errors += 1;
        }
    }

    pub fn stats(&self, address: &str) -> InstanceStats {
        self.stats
            .get(address)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            instances: self.instances.iter().map(|i| i.address.clone()).collect(),
            stats: self
                .stats
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}
