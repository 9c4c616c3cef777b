//! The error taxonomy of the dispatcher and execution engine.
//!
//! These are *kinds*, not wire types: everything that crosses a transport boundary
//! is flattened to a string in the envelope's `exceptions` array (spec §6/§9), but
//! internally every fallible path returns one of these variants so callers can match
//! on retryability instead of parsing messages.

use std::time::Duration;

use thiserror::Error;

/// Errors observed by the client dispatcher (C4) while submitting an operation.
#[derive(Debug, Error)]
pub enum DispatchError {
  /// TCP attempt timed out, or the HTTP socket errored. Retryable.
  #[error("transient network error: {0}")]
  TransientNetwork(#[source] std::io::Error),

  /// The TCP peer dropped the connection mid-request. The dispatcher falls back to
  /// HTTP with `forceRedo=true`; this variant is surfaced only if that fall back
  /// also exhausts its attempts.
  #[error("tcp channel closed by peer")]
  ChannelClosed,

  /// Every attempt in the backoff schedule timed out.
  #[error("operation timed out after {attempts} attempts ({elapsed:?} elapsed)")]
  BackoffExhausted { attempts: u32, elapsed: Duration },

  /// The deployment rejected a write because this instance does not own the inode.
  #[error("not authorized here: owning deployment is {owner}")]
  NotAuthorizedHere { owner: u32 },

  /// The handler raised; message captured from the envelope's `exceptions` entry.
  #[error("operation failed: {0}")]
  OperationFailed(String),

  /// Envelope could not be decoded (malformed JSON, missing fields).
  #[error("malformed response envelope: {0}")]
  MalformedEnvelope(String),
}

impl DispatchError {
  /// Whether the dispatcher should retry (possibly via the other transport) on this
  /// error, per spec §7's propagation rules. `NotAuthorizedHere` is retryable
  /// because the dispatcher refreshes C3 from the mapping hint before the next
  /// attempt (spec §4.5 "the client is expected to refresh C3... and retry").
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      DispatchError::TransientNetwork(_) | DispatchError::ChannelClosed | DispatchError::NotAuthorizedHere { .. }
    )
  }
}

/// Errors observed by the server execution engine (C5) while processing a task.
#[derive(Debug, Error)]
pub enum ExecutionError {
  /// `opName` has no registered handler.
  #[error("no such operation: {0}")]
  NoSuchOperation(String),

  /// The worker exceeded `worker.timeoutMs`. The envelope is still returned, per
  /// spec §7 ("result envelope still returned").
  #[error("operation timed out after {0:?}")]
  OperationTimedOut(Duration),

  /// A write landed on a deployment that does not own the target inode.
  #[error("not authorized here: owning deployment is {owner}")]
  NotAuthorizedHere { owner: u32 },

  /// The handler itself raised. Message only; real cause is opaque to the core.
  #[error("handler failed: {0}")]
  HandlerFailed(String),

  /// Cold-start initialization (config load, registry join) failed. Fatal: the
  /// caller is expected to terminate the instance after this is returned.
  #[error("fatal initialization error: {0}")]
  Fatal(String),
}

impl ExecutionError {
  /// The string recorded in the envelope's `exceptions` array for this error.
  pub fn as_exception_string(&self) -> String {
    self.to_string()
  }

  /// Whether this error should terminate the serverless instance rather than being
  /// packaged into a response envelope.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ExecutionError::Fatal(_))
  }
}
