//! Deployment Registry (C1): tracks which instance IDs are live for each deployment
//! number, plus the permanent record of how many deployments exist.
//!
//! The original system leans on an external coordination service (ZooKeeper-like)
//! for ephemeral instance membership and permanent configuration records. Rather
//! than depend on a concrete coordination client, membership is expressed as a
//! trait (`RegistryBackend`) so a real backend can be plugged in later; the
//! in-process implementation here is what every other module is built and tested
//! against. Write authority is never derived from this registry (see
//! `engine::execute`'s `deploymentOf(parentInode, N) == self.deployment` check);
//! C1 only answers liveness questions for the dispatcher's TCP channel cache.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

/// A deployment number, `0..deployments.count`.
pub type DeploymentNumber = u32;

/// Opaque identifier for a running server instance (one cold-started process).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub String);

impl InstanceId {
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }
}

/// The permanent, slow-changing configuration record (spec §4.1 "the permanent
/// record of how many deployments exist").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentTopology {
  pub deployments_count: u32,
}

/// Pluggable coordination backend. An in-process implementation is provided
/// (`InProcessRegistry`); a real deployment would back this with an external
/// coordination service, swapped in without touching call sites.
///
/// Multiple instances may legitimately be members of the same deployment at once
/// (spec §4 Data Model, §4.5 "Parallelism comes from the deployment count *and
/// from multiple instances per deployment*") — this trait tracks membership, not
/// exclusive ownership.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
  /// Creates an ephemeral membership record for `instance` under `deployment`, and
  /// the permanent per-instance record if this is the first deployment `instance`
  /// has ever joined (spec §4.1 "create ephemeral member; create permanent record
  /// once").
  async fn join(&self, deployment: DeploymentNumber, instance: InstanceId);

  /// Best-effort removal of the ephemeral membership record (spec §4.1 "ephemeral
  /// cleanup on disconnect is mandatory").
  async fn leave(&self, deployment: DeploymentNumber, instance: &InstanceId);

  /// Live instance ids currently joined to `deployment`, ordered ascending by id
  /// (spec §4.1).
  async fn list_live(&self, deployment: DeploymentNumber) -> Vec<InstanceId>;

  /// Cross-deployment liveness check. Conservative: a lookup failure must never
  /// report `false` (spec §4.1 "avoids false eviction of TCP channels"); the
  /// in-process backend has no failure mode, so this simply answers whether
  /// `instance` has ever joined any deployment.
  async fn is_alive(&self, instance: &InstanceId) -> bool;

  /// Pulls the latest membership snapshot from the backing coordination service.
  /// A no-op for the in-process backend, whose membership is already shared
  /// in-process.
  async fn refresh(&self);

  /// Reads the current permanent topology record.
  async fn topology(&self) -> DeploymentTopology;

  /// Updates the permanent topology record (deployment count change).
  async fn set_topology(&self, topology: DeploymentTopology);
}

struct Inner {
  live: DashMap<DeploymentNumber, parking_lot::Mutex<std::collections::BTreeSet<InstanceId>>>,
  permanent: DashSet<InstanceId>,
  topology: parking_lot::RwLock<DeploymentTopology>,
}

/// In-process `RegistryBackend`, suitable for a single-process deployment or for
/// tests. Membership and topology live in memory only; nothing survives a restart.
#[derive(Clone)]
pub struct InProcessRegistry {
  inner: Arc<Inner>,
}

impl InProcessRegistry {
  pub fn new(initial_deployments_count: u32) -> Self {
    Self {
      inner: Arc::new(Inner {
        live: DashMap::new(),
        permanent: DashSet::new(),
        topology: parking_lot::RwLock::new(DeploymentTopology {
          deployments_count: initial_deployments_count,
        }),
      }),
    }
  }
}

impl Default for InProcessRegistry {
  fn default() -> Self {
    Self::new(1)
  }
}

#[async_trait]
impl RegistryBackend for InProcessRegistry {
  async fn join(&self, deployment: DeploymentNumber, instance: InstanceId) {
    self.inner.permanent.insert(instance.clone());
    self
      .inner
      .live
      .entry(deployment)
      .or_insert_with(|| parking_lot::Mutex::new(std::collections::BTreeSet::new()))
      .lock()
      .insert(instance);
  }

  async fn leave(&self, deployment: DeploymentNumber, instance: &InstanceId) {
    if let Some(members) = self.inner.live.get(&deployment) {
      members.lock().remove(instance);
    }
  }

  async fn list_live(&self, deployment: DeploymentNumber) -> Vec<InstanceId> {
    self
      .inner
      .live
      .get(&deployment)
      .map(|members| members.lock().iter().cloned().collect())
      .unwrap_or_default()
  }

  async fn is_alive(&self, instance: &InstanceId) -> bool {
    self.inner.permanent.contains(instance)
  }

  async fn refresh(&self) {}

  async fn topology(&self) -> DeploymentTopology {
    *self.inner.topology.read()
  }

  async fn set_topology(&self, topology: DeploymentTopology) {
    *self.inner.topology.write() = topology;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn join_then_list_live_round_trips() {
    let reg = InProcessRegistry::default();
    let instance = InstanceId::generate();
    reg.join(0, instance.clone()).await;
    assert_eq!(reg.list_live(0).await, vec![instance]);
  }

  #[tokio::test]
  async fn multiple_instances_may_join_the_same_deployment() {
    let reg = InProcessRegistry::default();
    let a = InstanceId::generate();
    let b = InstanceId::generate();
    reg.join(0, a.clone()).await;
    reg.join(0, b.clone()).await;

    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(reg.list_live(0).await, expected);
  }

  #[tokio::test]
  async fn leave_removes_only_that_deployments_membership() {
    let reg = InProcessRegistry::default();
    let a = InstanceId::generate();
    reg.join(0, a.clone()).await;
    reg.join(1, a.clone()).await;
    reg.leave(0, &a).await;

    assert!(reg.list_live(0).await.is_empty());
    assert_eq!(reg.list_live(1).await, vec![a.clone()]);
    // The permanent record survives a leave from one deployment.
    assert!(reg.is_alive(&a).await);
  }

  #[tokio::test]
  async fn is_alive_is_true_cross_deployment_once_joined_anywhere() {
    let reg = InProcessRegistry::default();
    let a = InstanceId::generate();
    let stranger = InstanceId::generate();
    reg.join(3, a.clone()).await;
    assert!(reg.is_alive(&a).await);
    assert!(!reg.is_alive(&stranger).await);
  }

  #[tokio::test]
  async fn topology_updates_are_visible_immediately() {
    let reg = InProcessRegistry::new(4);
    assert_eq!(reg.topology().await.deployments_count, 4);
    reg.set_topology(DeploymentTopology {
      deployments_count: 8,
    })
    .await;
    assert_eq!(reg.topology().await.deployments_count, 8);
  }
}
