//! Server Execution Engine (C5): the per-instance worker that turns a decoded
//! request envelope into a response envelope.
//!
//! The accept loop in `server.rs` spawns one task per connection and dispatches
//! through a shared `Router`; this module keeps that same "one shared handle, many
//! callers" shape but narrows dispatch to a single FIFO queue drained by one
//! consumer task, per the single-writer/single-consumer execution model (spec §5
//! "exactly one task executes operations for a given instance at a time"). State
//! (registry handle, caches, dedup store, handler table) is built once at
//! construction and passed by value into the worker loop — explicit state, not a
//! `state.rs`-style global singleton (spec §9 design note).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::dedup::{DedupCache, Lookup};
use crate::errors::ExecutionError;
use crate::registry::{DeploymentNumber, InProcessRegistry, InstanceId, RegistryBackend};
use crate::routing;
use crate::telemetry::{OperationLog, OperationOutcome, OperationPerformed, Transport};
use crate::wire::{DeploymentMapping, OperationArgs, RequestEnvelopeValue, ResponseBody, now_millis};

/// A registered operation handler. Returns the JSON payload that becomes
/// `ResponseBody::result` (base64-encoded by the caller) or an `ExecutionError`.
pub type OperationHandler =
  Arc<dyn Fn(OperationArgs) -> BoxFuture<'static, Result<serde_json::Value, ExecutionError>> + Send + Sync>;

#[derive(Clone)]
struct Registered {
  handler: OperationHandler,
  /// Whether this operation mutates state and therefore must land on the owning
  /// deployment (spec §4.4/§8 "write to wrong deployment" scenario). Reads are
  /// never rejected for ownership.
  is_write: bool,
}

struct Task {
  envelope: RequestEnvelopeValue,
  deployment: DeploymentNumber,
  cold_start: bool,
  enqueued_time: i64,
  reply: oneshot::Sender<ResponseBody>,
}

struct Inner {
  instance: InstanceId,
  config: Config,
  registry: Arc<dyn RegistryBackend>,
  cache: MetadataCache,
  dedup: DedupCache,
  handlers: HashMap<String, Registered>,
  telemetry: OperationLog,
  cold_start_done: AtomicBool,
}

/// The server execution engine. Cheaply cloneable; clones share the same queue,
/// caches, and dedup store.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
  queue: mpsc::UnboundedSender<Task>,
}

/// Declares the operation table a concrete deployment exposes. Built once, then
/// handed to `Engine::start`.
pub struct OperationTable {
  handlers: HashMap<String, Registered>,
}

impl OperationTable {
  pub fn new() -> Self {
    Self {
      handlers: HashMap::new(),
    }
  }

  pub fn register(
    &mut self,
    name: impl Into<String>,
    is_write: bool,
    handler: OperationHandler,
  ) -> &mut Self {
    self.handlers.insert(
      name.into(),
      Registered {
        handler,
        is_write,
      },
    );
    self
  }
}

impl Default for OperationTable {
  fn default() -> Self {
    Self::new()
  }
}

impl Engine {
  /// Builds the function-local caches and spawns the serial worker loop. Joining
  /// the Deployment Registry happens lazily, on the first request this instance
  /// handles (spec §4.5 step 1 "instance init guard... runs exactly once per cold
  /// start"), not here at construction.
  pub fn start(
    config: Config,
    registry: Arc<dyn RegistryBackend>,
    operations: OperationTable,
  ) -> Self {
    let inner = Arc::new(Inner {
      instance: InstanceId::generate(),
      cache: MetadataCache::new(&config.cache),
      dedup: DedupCache::new(),
      handlers: operations.handlers,
      telemetry: OperationLog::default(),
      config,
      registry,
      cold_start_done: AtomicBool::new(false),
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Self {
      inner: inner.clone(),
      queue: tx,
    };
    tokio::spawn(worker_loop(inner, rx));
    engine
  }

  /// Test/single-process convenience: an in-process registry with no pre-seeded
  /// membership. The engine joins it itself on its first request, same as any
  /// other backend.
  pub async fn start_standalone(config: Config, operations: OperationTable) -> Self {
    let registry = Arc::new(InProcessRegistry::new(config.deployments_count));
    Self::start(config, registry, operations)
  }

  pub fn instance_id(&self) -> &InstanceId {
    &self.inner.instance
  }

  pub fn cache(&self) -> &MetadataCache {
    &self.inner.cache
  }

  /// Handles one incoming request end to end: dedup check, ownership check,
  /// enqueue-and-await, response assembly (spec §4.4 steps 2-6).
  pub async fn handle(&self, envelope: RequestEnvelopeValue, transport: Transport) -> ResponseBody {
    let was_cold = !self.inner.cold_start_done.swap(true, Ordering::SeqCst);
    if was_cold {
      self
        .inner
        .registry
        .join(self.inner.config.self_deployment, self.inner.instance.clone())
        .await;
    }
    let request_id = envelope.request_id;

    loop {
      match self.inner.dedup.lookup_or_claim(request_id, envelope.force_redo) {
        Lookup::Replay(body) => {
          let mut replayed = (*body).clone();
          replayed.duplicate_request = true;
          return replayed;
        }
        Lookup::InProgress(notify) => {
          notify.notified().await;
          continue;
        }
        Lookup::Claimed => break,
      }
    }

    let enqueued_time = now_millis();
    let deployment = self.route(&envelope);

    let (reply_tx, reply_rx) = oneshot::channel();
    let task = Task {
      envelope: envelope.clone(),
      deployment,
      cold_start: was_cold,
      enqueued_time,
      reply: reply_tx,
    };

    if self.queue.send(task).is_err() {
      let body = self.error_body(&envelope, deployment, was_cold, enqueued_time, "engine shut down".into());
      self.inner.dedup.complete(request_id, body.clone());
      return body;
    }

    let body = match reply_rx.await {
      Ok(body) => body,
      Err(_) => self.error_body(&envelope, deployment, was_cold, enqueued_time, "worker dropped reply".into()),
    };

    self.inner.dedup.complete(request_id, body.clone());

    let outcome = if !body.exceptions.is_empty() {
      OperationOutcome::Failed
    } else {
      OperationOutcome::Success
    };
    self.inner.telemetry.record(OperationPerformed {
      request_id,
      operation_name: envelope.op.clone(),
      deployment,
      transport,
      start_time: enqueued_time,
      end_time: now_millis(),
      enqueued_time: Some(body.enqueued_time),
      dequeued_time: Some(body.dequeued_time),
      fn_start_time: Some(body.fn_start_time),
      fn_end_time: Some(body.fn_end_time),
      cache_hits: body.cache_hits,
      cache_misses: body.cache_misses,
      outcome,
    });

    body
  }

  pub fn telemetry(&self) -> &OperationLog {
    &self.inner.telemetry
  }

  fn route(&self, envelope: &RequestEnvelopeValue) -> DeploymentNumber {
    let n = self.inner.config.deployments_count;
    match envelope.fs_args.src() {
      Some(path) => routing::deployment_of_path(routing::parent_path(path), n),
      None => 0,
    }
  }

  fn error_body(
    &self,
    envelope: &RequestEnvelopeValue,
    deployment: DeploymentNumber,
    cold_start: bool,
    enqueued_time: i64,
    message: String,
  ) -> ResponseBody {
    let mapping = mapping_hint(&self.inner.cache, envelope, deployment);
    let counters = self.inner.cache.drain();
    let now = now_millis();
    ResponseBody {
      request_id: envelope.request_id,
      operation: envelope.op.clone(),
      name_node_id: 0,
      deployment_number: deployment,
      cache_hits: counters.hits,
      cache_misses: counters.misses,
      fn_start_time: now,
      fn_end_time: now,
      enqueued_time,
      dequeued_time: now,
      processing_finished_time: now,
      cold_start,
      cancelled: false,
      duplicate_request: false,
      result: None,
      exceptions: vec![message],
      deployment_mapping: mapping,
      statistics_package: None,
      transaction_events: None,
    }
  }
}

/// Computes the authoritative mapping hint for the envelope's primary path, if it
/// has one (spec §4.5 step 5 "if the handler identified a primary path, compute
/// the authoritative mapping via C2 and attach it to the result"). `parentId` is
/// best-effort: populated from the metadata cache when the parent is warm, `-1`
/// otherwise (this core never resolves inode ids itself, spec §1 Non-goals).
fn mapping_hint(
  cache: &MetadataCache,
  envelope: &RequestEnvelopeValue,
  deployment: DeploymentNumber,
) -> Option<DeploymentMapping> {
  let path = envelope.fs_args.src()?;
  let parent = routing::parent_path(path);
  let parent_id = cache.get_by_path(parent).map(|inode| inode.id as i64).unwrap_or(-1);
  Some(DeploymentMapping {
    file_or_dir: path.to_string(),
    parent_id,
    function: deployment,
  })
}

async fn worker_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Task>) {
  while let Some(task) = rx.recv().await {
    let dequeued_time = now_millis();
    let body = execute(
      &inner,
      task.envelope,
      task.deployment,
      task.cold_start,
      task.enqueued_time,
      dequeued_time,
    )
    .await;
    let _ = task.reply.send(body);
  }
}

async fn execute(
  inner: &Arc<Inner>,
  envelope: RequestEnvelopeValue,
  deployment: DeploymentNumber,
  was_cold: bool,
  enqueued_time: i64,
  dequeued_time: i64,
) -> ResponseBody {
  let fn_start_time = now_millis();

  let registered = match inner.handlers.get(&envelope.op) {
    Some(r) => r.clone(),
    None => {
      return body_for(
        &inner.cache,
        &envelope,
        deployment,
        was_cold,
        enqueued_time,
        dequeued_time,
        fn_start_time,
        None,
        vec![ExecutionError::NoSuchOperation(envelope.op.clone()).as_exception_string()],
      );
    }
  };

  // Write authorization compares the routing hash directly against this
  // instance's own fixed deployment number (spec §4.5 "Write authorization":
  // `d = deploymentOf(parentInode(p), N); if d != self.deployment, fail"). This
  // is independent of the registry: ownership here is a routing fact, not a
  // membership race.
  if registered.is_write && deployment != inner.config.self_deployment {
    return body_for(
      &inner.cache,
      &envelope,
      deployment,
      was_cold,
      enqueued_time,
      dequeued_time,
      fn_start_time,
      None,
      vec![ExecutionError::NotAuthorizedHere { owner: deployment }.as_exception_string()],
    );
  }

  let outcome = tokio::time::timeout(
    inner.config.worker_timeout(),
    (registered.handler)(envelope.fs_args.clone()),
  )
  .await;

  let (result, exceptions) = match outcome {
    Ok(Ok(value)) => (
      Some(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        serde_json::to_vec(&value).unwrap_or_default(),
      )),
      vec![],
    ),
    Ok(Err(err)) => (None, vec![err.as_exception_string()]),
    Err(_) => (
      None,
      vec![ExecutionError::OperationTimedOut(inner.config.worker_timeout()).as_exception_string()],
    ),
  };

  body_for(
    &inner.cache,
    &envelope,
    deployment,
    was_cold,
    enqueued_time,
    dequeued_time,
    fn_start_time,
    result,
    exceptions,
  )
}

#[allow(clippy::too_many_arguments)]
fn body_for(
  cache: &MetadataCache,
  envelope: &RequestEnvelopeValue,
  deployment: DeploymentNumber,
  cold_start: bool,
  enqueued_time: i64,
  dequeued_time: i64,
  fn_start_time: i64,
  result: Option<String>,
  exceptions: Vec<String>,
) -> ResponseBody {
  let mapping = mapping_hint(cache, envelope, deployment);
  let counters = cache.drain();
  let fn_end_time = now_millis();
  ResponseBody {
    request_id: envelope.request_id,
    operation: envelope.op.clone(),
    name_node_id: 0,
    deployment_number: deployment,
    cache_hits: counters.hits,
    cache_misses: counters.misses,
    fn_start_time,
    fn_end_time,
    enqueued_time,
    dequeued_time,
    processing_finished_time: fn_end_time,
    cold_start,
    cancelled: false,
    duplicate_request: false,
    result,
    exceptions,
    deployment_mapping: mapping,
    statistics_package: None,
    transaction_events: None,
  }
}
