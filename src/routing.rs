//! Consistent-hash routing from a path or inode id onto a deployment number (C2).
//!
//! Uses Jump Consistent Hash (Lamping & Veach, 2014): O(1) memory, O(log N) time, and
//! moving only `O(1/N)` keys when the deployment count changes — the "stable" hash
//! spec §4.2 requires. The same function runs on client and server so both sides
//! agree on ownership without coordination (spec §3 "Deterministic routing").

use std::hash::{Hash, Hasher};

/// Computes the owning deployment for `key` out of `deployment_count` deployments.
///
/// `deployment_count` must be `>= 1` (spec §6 `deployments.count`, `N >= 1`); a count
/// of zero would make every key unroutable, so it is treated as a single deployment.
pub fn jump_consistent_hash(mut key: u64, deployment_count: u32) -> u32 {
  if deployment_count <= 1 {
    return 0;
  }

  let deployment_count = deployment_count as i64;
  let mut b: i64 = -1;
  let mut j: i64 = 0;

  while j < deployment_count {
    b = j;
    key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
    j = ((b.wrapping_add(1)) as f64 * ((1i64 << 31) as f64 / (((key >> 33).wrapping_add(1)) as f64)))
      as i64;
  }

  b as u32
}

/// Hashes a full path string into the `u64` key space, used as the fallback key when
/// no parent inode id is available yet (spec §4.2, creation fallback).
pub fn hash_path(path: &str) -> u64 {
  let mut hasher = std::collections::hash_map::DefaultHasher::new();
  path.hash(&mut hasher);
  hasher.finish()
}

/// Routes a parent inode id onto a deployment number (spec §4.2/§3 "Deterministic
/// routing": `hash(parentInodeId) mod N` — jump consistent hash stands in for the
/// literal modulus while preserving that same determinism and stability property).
pub fn deployment_of_inode(parent_inode_id: u64, deployment_count: u32) -> u32 {
  jump_consistent_hash(parent_inode_id, deployment_count)
}

/// Routes a full path onto a deployment number, for paths with no resolved parent
/// inode yet (spec §4.2, creation fallback).
pub fn deployment_of_path(path: &str, deployment_count: u32) -> u32 {
  jump_consistent_hash(hash_path(path), deployment_count)
}

/// Returns the parent directory path of `path`, per spec §3/§8: the root path `/`
/// maps to itself.
pub fn parent_path(path: &str) -> &str {
  if path == "/" {
    return "/";
  }
  let trimmed = path.trim_end_matches('/');
  match trimmed.rfind('/') {
    Some(0) => "/",
    Some(idx) => &trimmed[..idx],
    None => "/",
  }
}
