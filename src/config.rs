//! Typed, environment-overridable configuration (spec §6 "Configuration (enumerated)").
//!
//! Mirrors the teacher's preference for an explicit config struct handed to the
//! router/server at construction (see `router::Router::state`) rather than ambient
//! globals read ad hoc — the cold-start instance state (spec §9 Design Note) is built
//! from one of these and threaded through explicitly.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::DeploymentNumber;

/// Backoff schedule parameters (spec §6 `backoff.*`, defaults per spec §4.4/§8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
  pub max_attempts: u32,
  pub initial_ms: u64,
  pub max_ms: u64,
  pub factor: f64,
  pub randomization: f64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_ms: 1000,
      max_ms: 5000,
      factor: 2.0,
      randomization: 0.5,
    }
  }
}

/// Metadata cache size bounds (spec §6 `cache.*.max`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  pub inode_max: usize,
  pub acl_max: usize,
  pub ez_max: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      inode_max: 10_000,
      acl_max: 10_000,
      ez_max: 10_000,
    }
  }
}

/// Top-level configuration, covering every key of spec §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  /// `deployments.count`, `N >= 1`.
  pub deployments_count: u32,
  /// This instance's own deployment number, derived from its function name suffix
  /// (spec §4 Data Model "Instance identity"). Write authorization compares
  /// `deploymentOf(parentInode(p), N)` directly against this field.
  pub self_deployment: DeploymentNumber,
  /// `tcp.enabled`.
  pub tcp_enabled: bool,
  /// `tcp.port.base`; the client-side receive server increments on conflict.
  pub tcp_port_base: u16,
  /// `http.timeoutMs`.
  pub http_timeout_ms: u64,
  /// `worker.timeoutMs`.
  pub worker_timeout_ms: u64,
  pub backoff: BackoffConfig,
  pub cache: CacheConfig,
  /// `consistency.protocol.enabled`.
  pub consistency_protocol_enabled: bool,
  /// `log.level`.
  pub log_level: String,
  /// `registry.endpoint`.
  pub registry_endpoint: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      deployments_count: 1,
      self_deployment: 0,
      tcp_enabled: true,
      tcp_port_base: 30_000,
      http_timeout_ms: 5_000,
      worker_timeout_ms: 10_000,
      backoff: BackoffConfig::default(),
      cache: CacheConfig::default(),
      consistency_protocol_enabled: false,
      log_level: "info".to_string(),
      registry_endpoint: "localhost:2181".to_string(),
    }
  }
}

impl Config {
  /// Loads defaults, then applies `NIMBUSFS_*` environment overrides. Unknown or
  /// unparsable overrides are ignored; this mirrors how lenient the original
  /// serverless host's config surface is expected to be (not part of this core).
  pub fn from_env() -> Self {
    let mut cfg = Self::default();

    if let Ok(v) = env::var("NIMBUSFS_DEPLOYMENTS_COUNT") {
      if let Ok(n) = v.parse() {
        cfg.deployments_count = n;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_SELF_DEPLOYMENT") {
      if let Ok(n) = v.parse() {
        cfg.self_deployment = n;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_TCP_ENABLED") {
      if let Ok(b) = v.parse() {
        cfg.tcp_enabled = b;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_TCP_PORT_BASE") {
      if let Ok(p) = v.parse() {
        cfg.tcp_port_base = p;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_HTTP_TIMEOUT_MS") {
      if let Ok(ms) = v.parse() {
        cfg.http_timeout_ms = ms;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_WORKER_TIMEOUT_MS") {
      if let Ok(ms) = v.parse() {
        cfg.worker_timeout_ms = ms;
      }
    }
    if let Ok(v) = env::var("NIMBUSFS_REGISTRY_ENDPOINT") {
      cfg.registry_endpoint = v;
    }
    if let Ok(v) = env::var("NIMBUSFS_LOG_LEVEL") {
      cfg.log_level = v;
    }

    cfg
  }

  pub fn http_timeout(&self) -> Duration {
    Duration::from_millis(self.http_timeout_ms)
  }

  pub fn worker_timeout(&self) -> Duration {
    Duration::from_millis(self.worker_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_spec_backoff_schedule() {
    let cfg = Config::default();
    assert_eq!(cfg.backoff.max_attempts, 5);
    assert_eq!(cfg.backoff.initial_ms, 1000);
    assert_eq!(cfg.backoff.max_ms, 5000);
    assert_eq!(cfg.backoff.factor, 2.0);
    assert_eq!(cfg.backoff.randomization, 0.5);
  }
}
