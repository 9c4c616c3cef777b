//! Server-side request deduplication (part of C5): in-flight coalescing and replay
//! of completed results, keyed by request id.
//!
//! Directly grounded on `plugins/idempotency.rs`'s `Store`/`Entry` design: a DashMap
//! of `InFlight { notify }` / `Completed { result }` entries, where a second arrival
//! for the same key waits on the first's `Notify` instead of re-running the
//! operation (spec §4.4 step 3/4: "if a completed result exists for this requestId,
//! return it without re-executing; if execution is in flight, wait for it").

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::wire::ResponseBody;

#[derive(Clone)]
enum Entry {
  InFlight(Arc<Notify>),
  Completed(Arc<ResponseBody>),
}

/// What the caller should do after consulting the dedup cache.
pub enum Lookup {
  /// No record of this request id; the caller claimed the in-flight slot and must
  /// execute the operation and call `complete`.
  Claimed,
  /// Another call is already executing this request id; wait on the handle, then
  /// look up again.
  InProgress(Arc<Notify>),
  /// A result already exists; replay it instead of re-executing (spec §3
  /// `duplicateRequest = true`).
  Replay(Arc<ResponseBody>),
}

/// Server-side in-flight/completed cache, one per server instance (spec §4.4 "the
/// dedup cache is function-local, like the metadata cache, and is consulted before
/// every execution").
#[derive(Clone, Default)]
pub struct DedupCache {
  entries: Arc<DashMap<Uuid, Entry>>,
}

impl DedupCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Looks up `request_id`, claiming the in-flight slot if nobody else holds it.
  /// `force_redo` bypasses a `Completed` entry, per spec §4.4 step 4: "forceRedo
  /// causes the server to discard any completed result and re-execute".
  pub fn lookup_or_claim(&self, request_id: Uuid, force_redo: bool) -> Lookup {
    match self.entries.entry(request_id) {
      MapEntry::Vacant(slot) => {
        let notify = Arc::new(Notify::new());
        slot.insert(Entry::InFlight(notify));
        Lookup::Claimed
      }
      MapEntry::Occupied(mut slot) => match slot.get().clone() {
        Entry::InFlight(notify) => Lookup::InProgress(notify),
        Entry::Completed(_) if force_redo => {
          let notify = Arc::new(Notify::new());
          slot.insert(Entry::InFlight(notify));
          Lookup::Claimed
        }
        Entry::Completed(result) => Lookup::Replay(result),
      },
    }
  }

  /// Records a finished result and wakes anyone waiting on it.
  pub fn complete(&self, request_id: Uuid, result: ResponseBody) {
    if let Some(MapEntry::Occupied(slot)) =
      Some(self.entries.entry(request_id)).filter(|e| matches!(e, MapEntry::Occupied(_)))
    {
      if let Entry::InFlight(notify) = slot.get() {
        notify.notify_waiters();
      }
    }
    self
      .entries
      .insert(request_id, Entry::Completed(Arc::new(result)));
  }

  /// Drops a claimed-but-abandoned slot (e.g. the worker panicked) so a future
  /// retry is not stuck waiting forever.
  pub fn abandon(&self, request_id: Uuid) {
    if let Some((_, Entry::InFlight(notify))) = self.entries.remove(&request_id) {
      notify.notify_waiters();
    }
  }

  pub fn get_completed(&self, request_id: Uuid) -> Option<Arc<ResponseBody>> {
    match self.entries.get(&request_id).map(|e| e.clone()) {
      Some(Entry::Completed(result)) => Some(result),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_body(request_id: Uuid) -> ResponseBody {
    ResponseBody {
      request_id,
      operation: "getFileInfo".into(),
      name_node_id: 1,
      deployment_number: 0,
      cache_hits: 0,
      cache_misses: 0,
      fn_start_time: 0,
      fn_end_time: 0,
      enqueued_time: 0,
      dequeued_time: 0,
      processing_finished_time: 0,
      cold_start: false,
      cancelled: false,
      duplicate_request: false,
      result: Some("eyJ9".into()),
      exceptions: vec![],
      deployment_mapping: None,
      statistics_package: None,
      transaction_events: None,
    }
  }

  #[test]
  fn first_caller_claims_second_waits() {
    let cache = DedupCache::new();
    let id = Uuid::new_v4();
    assert!(matches!(cache.lookup_or_claim(id, false), Lookup::Claimed));
    assert!(matches!(
      cache.lookup_or_claim(id, false),
      Lookup::InProgress(_)
    ));
  }

  #[test]
  fn completed_result_replays_without_reexecution() {
    let cache = DedupCache::new();
    let id = Uuid::new_v4();
    cache.lookup_or_claim(id, false);
    cache.complete(id, sample_body(id));
    assert!(matches!(cache.lookup_or_claim(id, false), Lookup::Replay(_)));
  }

  #[test]
  fn force_redo_bypasses_completed_entry() {
    let cache = DedupCache::new();
    let id = Uuid::new_v4();
    cache.lookup_or_claim(id, false);
    cache.complete(id, sample_body(id));
    assert!(matches!(cache.lookup_or_claim(id, true), Lookup::Claimed));
  }

  #[test]
  fn abandon_wakes_waiters_without_leaving_a_completed_entry() {
    let cache = DedupCache::new();
    let id = Uuid::new_v4();
    cache.lookup_or_claim(id, false);
    cache.abandon(id);
    assert!(matches!(cache.lookup_or_claim(id, false), Lookup::Claimed));
  }
}
