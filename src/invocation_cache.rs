//! Client-side invocation cache (C3): remembers the last known owning deployment
//! for a path, so repeat calls skip a routing round-trip, and records outstanding
//! request ids so a retried submission can be recognized as a retry rather than a
//! fresh call.
//!
//! Same DashMap-entry shape as the server's dedup cache (`dedup.rs`), scoped to the
//! client side of the wire instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::registry::DeploymentNumber;

#[derive(Clone, Copy)]
struct CachedRoute {
  deployment: DeploymentNumber,
  cached_at: Instant,
}

/// Caches `path -> deployment` routing decisions and in-flight request state on
/// the client. Routes expire after `ttl` so a deployment-count change eventually
/// self-heals without requiring an explicit invalidation signal from the server.
pub struct InvocationCache {
  routes: DashMap<String, CachedRoute>,
  ttl: Duration,
}

impl InvocationCache {
  pub fn new(ttl: Duration) -> Self {
    Self {
      routes: DashMap::new(),
      ttl,
    }
  }

  pub fn get_route(&self, path: &str) -> Option<DeploymentNumber> {
    let entry = self.routes.get(path)?;
    if entry.cached_at.elapsed() > self.ttl {
      drop(entry);
      self.routes.remove(path);
      return None;
    }
    Some(entry.deployment)
  }

  pub fn put_route(&self, path: impl Into<String>, deployment: DeploymentNumber) {
    self.routes.insert(
      path.into(),
      CachedRoute {
        deployment,
        cached_at: Instant::now(),
      },
    );
  }

  pub fn invalidate(&self, path: &str) {
    self.routes.remove(path);
  }

  pub fn len(&self) -> usize {
    self.routes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.routes.is_empty()
  }
}

impl Default for InvocationCache {
  fn default() -> Self {
    Self::new(Duration::from_secs(60))
  }
}

/// Shareable handle, cloned into every dispatcher call site.
pub type SharedInvocationCache = Arc<InvocationCache>;
