//! Structured logging and the operation-performed telemetry log (spec §4.4 point 5).

#[cfg(feature = "init-tracing")]
use tracing::level_filters::LevelFilter;
#[cfg(feature = "init-tracing")]
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::wire::TimestampMillis;

/// Initializes the global tracing subscriber. Honors `RUST_LOG` if set, otherwise
/// falls back to `log.level` from `Config`.
#[cfg(feature = "init-tracing")]
pub fn init_tracing(default_level: &str) {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

  let _ = tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_file(true)
        .with_line_number(true)
        .with_filter(LevelFilter::TRACE)
        .and_then(filter),
    )
    .try_init();
}

#[cfg(not(feature = "init-tracing"))]
pub fn init_tracing(_default_level: &str) {}

/// One record of a completed client operation (spec §4.4 point 5: "record an
/// operation-performed telemetry record").
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPerformed {
  pub request_id: Uuid,
  pub operation_name: String,
  pub deployment: u32,
  pub transport: Transport,
  pub start_time: TimestampMillis,
  pub end_time: TimestampMillis,
  pub enqueued_time: Option<TimestampMillis>,
  pub dequeued_time: Option<TimestampMillis>,
  pub fn_start_time: Option<TimestampMillis>,
  pub fn_end_time: Option<TimestampMillis>,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
  Tcp,
  Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
  Success,
  Duplicate,
  Cancelled,
  Failed,
}

/// Process-wide append-only log of operations performed, as the client dispatcher's
/// bookkeeping store (spec §4.4/§8 scenario 3: "client records two operation-performed
/// entries"). Bounded to avoid unbounded growth in long-lived clients; oldest entries
/// are dropped once the cap is hit.
#[derive(Clone)]
pub struct OperationLog {
  entries: Arc<Mutex<Vec<OperationPerformed>>>,
  cap: usize,
}

impl OperationLog {
  pub fn new(cap: usize) -> Self {
    Self {
      entries: Arc::new(Mutex::new(Vec::new())),
      cap,
    }
  }

  pub fn record(&self, entry: OperationPerformed) {
    tracing::debug!(
      request_id = %entry.request_id,
      operation = %entry.operation_name,
      deployment = entry.deployment,
      transport = ?entry.transport,
      outcome = ?entry.outcome,
      "operation performed"
    );
    let mut entries = self.entries.lock();
    if entries.len() >= self.cap {
      entries.remove(0);
    }
    entries.push(entry);
  }

  pub fn snapshot(&self) -> Vec<OperationPerformed> {
    self.entries.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for OperationLog {
  fn default() -> Self {
    Self::new(10_000)
  }
}
