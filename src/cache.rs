//! Function-local metadata cache (C6): write-authoritative cache of inodes, kept
//! warm across invocations of the same instance, plus the dependent ACL and
//! encryption-zone caches that must be invalidated alongside it.
//!
//! Grounded on the dedup store's DashMap-of-entries shape in
//! `plugins/idempotency.rs`, generalized to three cross-referenced indices instead
//! of one: by id, by path, and by (parent, name) — spec §3/§4.3 require looking an
//! inode up any of those three ways without a linear scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::config::CacheConfig;

/// Stable identifier for a cached inode, independent of its current path (paths can
/// be invalidated and re-resolved; the id does not change across a rename).
pub type InodeId = u64;

/// Opaque inode payload (spec §3 SUPPLEMENT: "a minimal opaque shape sufficient to
/// exercise the cache without this crate knowing real HDFS inode semantics").
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
  pub id: InodeId,
  pub path: String,
  pub parent_id: InodeId,
  pub name: String,
  pub is_directory: bool,
  pub attributes: Value,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct ParentName(InodeId, String);

struct Indices {
  by_id: DashMap<InodeId, Arc<Inode>>,
  by_path: DashMap<String, InodeId>,
  by_parent_name: DashMap<ParentName, InodeId>,
}

/// Per-request cache-hit/miss counters (spec §6 response body `cacheHits`/`cacheMisses`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
  pub hits: u64,
  pub misses: u64,
}

/// The function-local metadata cache, along with its dependent ACL and
/// encryption-zone caches. One instance lives for the lifetime of a server
/// instance (spec §4.3/§9 "function-local... survives across invocations of the
/// same warm instance, evicted on cold start").
pub struct MetadataCache {
  inodes: Indices,
  acls: DashMap<InodeId, Arc<Value>>,
  encryption_zones: DashMap<InodeId, Arc<Value>>,
  inode_max: usize,
  acl_max: usize,
  ez_max: usize,
  insert_order: parking_lot::Mutex<std::collections::VecDeque<InodeId>>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl MetadataCache {
  pub fn new(cfg: &CacheConfig) -> Self {
    Self {
      inodes: Indices {
        by_id: DashMap::new(),
        by_path: DashMap::new(),
        by_parent_name: DashMap::new(),
      },
      acls: DashMap::new(),
      encryption_zones: DashMap::new(),
      inode_max: cfg.inode_max,
      acl_max: cfg.acl_max,
      ez_max: cfg.ez_max,
      insert_order: parking_lot::Mutex::new(std::collections::VecDeque::new()),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  /// Records a lookup outcome and returns whether it counted as a hit (spec §6 per-
  /// request counters double as running totals here; the dispatcher/engine samples
  /// the delta per request).
  fn record(&self, hit: bool) {
    if hit {
      self.hits.fetch_add(1, Ordering::Relaxed);
    } else {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Lifetime-cumulative totals. Prefer `drain` for the per-request counters the
  /// response envelope reports (spec §4.6 "thread-scoped hit/miss counters...
  /// drained by C5 after each operation").
  pub fn counters(&self) -> CacheCounters {
    CacheCounters {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
    }
  }

  /// Reads and resets both counters atomically, returning only what accumulated
  /// since the previous drain (spec §6 response body `cacheHits`/`cacheMisses` are
  /// per-operation, not lifetime totals).
  pub fn drain(&self) -> CacheCounters {
    CacheCounters {
      hits: self.hits.swap(0, Ordering::Relaxed),
      misses: self.misses.swap(0, Ordering::Relaxed),
    }
  }

  pub fn get_by_id(&self, id: InodeId) -> Option<Arc<Inode>> {
    let hit = self.inodes.by_id.get(&id).map(|e| e.clone());
    self.record(hit.is_some());
    hit
  }

  pub fn get_by_path(&self, path: &str) -> Option<Arc<Inode>> {
    let found = self
      .inodes
      .by_path
      .get(path)
      .and_then(|id| self.inodes.by_id.get(&*id).map(|e| e.clone()));
    self.record(found.is_some());
    found
  }

  pub fn get_by_parent_name(&self, parent_id: InodeId, name: &str) -> Option<Arc<Inode>> {
    let key = ParentName(parent_id, name.to_string());
    let found = self
      .inodes
      .by_parent_name
      .get(&key)
      .and_then(|id| self.inodes.by_id.get(&*id).map(|e| e.clone()));
    self.record(found.is_some());
    found
  }

  /// Inserts or replaces an inode across all three indices, evicting the oldest
  /// entry first if the cache is at capacity (spec §4.3 "bounded size; eviction
  /// policy left to the implementer").
  pub fn put(&self, inode: Inode) {
    if self.inodes.by_id.len() >= self.inode_max && !self.inodes.by_id.contains_key(&inode.id) {
      let evicted = self.insert_order.lock().pop_front();
      if let Some(evict_id) = evicted {
        self.invalidate_id(evict_id);
      }
    }

    let id = inode.id;
    let path = inode.path.clone();
    let parent_name = ParentName(inode.parent_id, inode.name.clone());

    self.inodes.by_id.insert(id, Arc::new(inode));
    self.inodes.by_path.insert(path, id);
    self.inodes.by_parent_name.insert(parent_name, id);
    self.insert_order.lock().push_back(id);
  }

  /// Invalidates one inode by id, and its dependent ACL/encryption-zone entries
  /// (spec §4.3 "cascading invalidation").
  pub fn invalidate_id(&self, id: InodeId) {
    if let Some((_, inode)) = self.inodes.by_id.remove(&id) {
      self.inodes.by_path.remove(&inode.path);
      self
        .inodes
        .by_parent_name
        .remove(&ParentName(inode.parent_id, inode.name.clone()));
    }
    self.acls.remove(&id);
    self.encryption_zones.remove(&id);
  }

  pub fn invalidate_path(&self, path: &str) {
    if let Some((_, id)) = self.inodes.by_path.remove(path) {
      self.invalidate_id(id);
    }
  }

  /// Invalidates every cached inode whose path falls under `prefix` (a rename or
  /// delete of a directory moves or removes its whole subtree, spec §4.3/§8
  /// "cache eviction under prefix").
  pub fn invalidate_prefix(&self, prefix: &str) {
    let ids: Vec<InodeId> = self
      .inodes
      .by_path
      .iter()
      .filter(|e| {
        let path = e.key();
        path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
      })
      .map(|e| *e.value())
      .collect();
    for id in ids {
      self.invalidate_id(id);
    }
  }

  /// Drops every cached entry (spec §4.3 "evicted on cold start", and used when a
  /// write lands on a subtree this instance can no longer vouch for).
  pub fn invalidate_all(&self) {
    self.inodes.by_id.clear();
    self.inodes.by_path.clear();
    self.inodes.by_parent_name.clear();
    self.acls.clear();
    self.encryption_zones.clear();
    self.insert_order.lock().clear();
  }

  pub fn put_acl(&self, id: InodeId, acl: Value) {
    if self.acls.len() >= self.acl_max && !self.acls.contains_key(&id) {
      if let Some(evict) = self.acls.iter().next().map(|e| *e.key()) {
        self.acls.remove(&evict);
      }
    }
    self.acls.insert(id, Arc::new(acl));
  }

  pub fn get_acl(&self, id: InodeId) -> Option<Arc<Value>> {
    let found = self.acls.get(&id).map(|e| e.clone());
    self.record(found.is_some());
    found
  }

  pub fn put_encryption_zone(&self, id: InodeId, ez: Value) {
    if self.encryption_zones.len() >= self.ez_max && !self.encryption_zones.contains_key(&id) {
      if let Some(evict) = self.encryption_zones.iter().next().map(|e| *e.key()) {
        self.encryption_zones.remove(&evict);
      }
    }
    self.encryption_zones.insert(id, Arc::new(ez));
  }

  pub fn get_encryption_zone(&self, id: InodeId) -> Option<Arc<Value>> {
    let found = self.encryption_zones.get(&id).map(|e| e.clone());
    self.record(found.is_some());
    found
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(id: InodeId, parent: InodeId, name: &str) -> Inode {
    Inode {
      id,
      path: format!("/{name}"),
      parent_id: parent,
      name: name.to_string(),
      is_directory: false,
      attributes: Value::Null,
    }
  }

  #[test]
  fn all_three_indices_find_the_same_inode() {
    let cache = MetadataCache::new(&CacheConfig::default());
    cache.put(sample(1, 0, "a"));
    assert_eq!(cache.get_by_id(1).unwrap().id, 1);
    assert_eq!(cache.get_by_path("/a").unwrap().id, 1);
    assert_eq!(cache.get_by_parent_name(0, "a").unwrap().id, 1);
  }

  #[test]
  fn invalidate_id_removes_from_every_index_and_dependents() {
    let cache = MetadataCache::new(&CacheConfig::default());
    cache.put(sample(1, 0, "a"));
    cache.put_acl(1, Value::String("rwx".into()));
    cache.invalidate_id(1);
    assert!(cache.get_by_id(1).is_none());
    assert!(cache.get_by_path("/a").is_none());
    assert!(cache.get_by_parent_name(0, "a").is_none());
    assert!(cache.get_acl(1).is_none());
  }

  #[test]
  fn invalidate_prefix_drops_the_whole_subtree_but_not_siblings() {
    let cache = MetadataCache::new(&CacheConfig::default());
    cache.put(Inode {
      id: 1,
      path: "/dir".into(),
      parent_id: 0,
      name: "dir".into(),
      is_directory: true,
      attributes: Value::Null,
    });
    cache.put(Inode {
      id: 2,
      path: "/dir/child".into(),
      parent_id: 1,
      name: "child".into(),
      is_directory: false,
      attributes: Value::Null,
    });
    cache.put(Inode {
      id: 3,
      path: "/sibling".into(),
      parent_id: 0,
      name: "sibling".into(),
      is_directory: false,
      attributes: Value::Null,
    });

    cache.invalidate_prefix("/dir");

    assert!(cache.get_by_id(1).is_none());
    assert!(cache.get_by_id(2).is_none());
    assert!(cache.get_by_id(3).is_some());
  }

  #[test]
  fn eviction_respects_bounded_size() {
    let cfg = CacheConfig {
      inode_max: 2,
      acl_max: 2,
      ez_max: 2,
    };
    let cache = MetadataCache::new(&cfg);
    cache.put(sample(1, 0, "a"));
    cache.put(sample(2, 0, "b"));
    cache.put(sample(3, 0, "c"));
    assert!(cache.get_by_id(1).is_none());
    assert!(cache.get_by_id(3).is_some());
  }

  #[test]
  fn counters_track_hits_and_misses() {
    let cache = MetadataCache::new(&CacheConfig::default());
    cache.put(sample(1, 0, "a"));
    let _ = cache.get_by_id(1);
    let _ = cache.get_by_id(2);
    let counters = cache.counters();
    assert_eq!(counters.hits, 1);
    assert_eq!(counters.misses, 1);
  }

  #[test]
  fn drain_resets_counters_to_the_next_operations_delta() {
    let cache = MetadataCache::new(&CacheConfig::default());
    cache.put(sample(1, 0, "a"));
    let _ = cache.get_by_id(1);
    let _ = cache.get_by_id(2);

    let first = cache.drain();
    assert_eq!(first.hits, 1);
    assert_eq!(first.misses, 1);

    // A drain with no lookups in between reports zero, not the prior total.
    let second = cache.drain();
    assert_eq!(second.hits, 0);
    assert_eq!(second.misses, 0);

    let _ = cache.get_by_id(1);
    let third = cache.drain();
    assert_eq!(third.hits, 1);
    assert_eq!(third.misses, 0);
  }
}
