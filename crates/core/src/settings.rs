//! Environment-driven settings shared by the engine crates.

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

pub(crate) fn max_yaml_bytes() -> usize {
    env_or("MANIFOLD_MAX_YAML_BYTES", 1_000_000) // 1 MiB default
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Capacity of each collection's mutation queue.
    pub queue_cap: usize,
    /// Window in which queued source events are coalesced into one batch.
    pub tick_ms: u64,
    pub kubectl: String,
    pub kube_context: Option<String>,
    pub transfer_timeout_secs: u64,
    pub max_yaml_bytes: usize,
    /// Extra reference rules (YAML or JSON list of rule specs).
    pub rules_file: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_cap: 1024,
            tick_ms: 8,
            kubectl: "kubectl".into(),
            kube_context: None,
            transfer_timeout_secs: 60,
            max_yaml_bytes: 1_000_000,
            rules_file: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_cap: env_or("MANIFOLD_QUEUE_CAP", d.queue_cap).max(1),
            tick_ms: env_or("MANIFOLD_TICK_MS", d.tick_ms).max(1),
            kubectl: std::env::var("MANIFOLD_KUBECTL").unwrap_or(d.kubectl),
            kube_context: std::env::var("MANIFOLD_KUBE_CONTEXT").ok().filter(|s| !s.is_empty()),
            transfer_timeout_secs: env_or("MANIFOLD_TRANSFER_TIMEOUT_SECS", d.transfer_timeout_secs),
            max_yaml_bytes: max_yaml_bytes(),
            rules_file: std::env::var("MANIFOLD_RULES").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn transfer_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn tick(&self) -> std::time::Duration { std::time::Duration::from_millis(self.tick_ms) }
}
