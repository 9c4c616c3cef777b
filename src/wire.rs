//! Wire envelope types shared by the HTTP and TCP transports (spec §6).
//!
//! Both transports carry the same JSON payload shape; TCP additionally carries
//! `cancelled`/`reason`/`shouldRetry` fields used only for channel-close
//! cancellation replies. Field names intentionally mirror spec §6 verbatim (including
//! casing) since they are part of the cross-language wire contract.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch. Plain `i64` alias kept distinct so call sites
/// read as timestamps rather than arbitrary integers.
pub type TimestampMillis = i64;

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_millis() -> TimestampMillis {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or_default()
}

/// Opaque keyed arguments for an operation (spec §3 "arguments").
///
/// Backed by a JSON object so any filesystem-operation shape can pass through
/// without this crate knowing its semantics (spec §1 Non-goals). `src` and
/// `forceRedo` are pulled out as typed accessors because the core routes and
/// deduplicates on them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct OperationArgs(pub HashMap<String, serde_json::Value>);

impl OperationArgs {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_src(src: impl Into<String>) -> Self {
    let mut map = HashMap::new();
    map.insert("src".to_string(), serde_json::Value::String(src.into()));
    Self(map)
  }

  /// The `src` path used for routing, if present.
  pub fn src(&self) -> Option<&str> {
    self.0.get("src").and_then(|v| v.as_str())
  }

  /// Whether `forceRedo` is set, per spec §4.4 step 3/4.
  pub fn force_redo(&self) -> bool {
    self
      .0
      .get("forceRedo")
      .and_then(|v| v.as_bool())
      .unwrap_or(false)
  }

  pub fn set_force_redo(&mut self, value: bool) {
    self
      .0
      .insert("forceRedo".to_string(), serde_json::Value::Bool(value));
  }
}

/// The `value` object of the HTTP request envelope (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelopeValue {
  pub op: String,
  #[serde(rename = "requestId")]
  pub request_id: Uuid,
  #[serde(rename = "clientName")]
  pub client_name: String,
  #[serde(rename = "clientInternalIp")]
  pub client_internal_ip: String,
  #[serde(rename = "tcpEnabled")]
  pub tcp_enabled: bool,
  #[serde(rename = "tcpPort")]
  pub tcp_port: u16,
  #[serde(rename = "fsArgs")]
  pub fs_args: OperationArgs,
  #[serde(rename = "commandLineArgs", default)]
  pub command_line_args: Vec<String>,
  #[serde(rename = "debugNdb", skip_serializing_if = "Option::is_none", default)]
  pub debug_ndb: Option<bool>,
  #[serde(
    rename = "debugStringNdb",
    skip_serializing_if = "Option::is_none",
    default
  )]
  pub debug_string_ndb: Option<String>,
  #[serde(rename = "forceRedo", default)]
  pub force_redo: bool,
  #[serde(rename = "consistencyProtocolEnabled")]
  pub consistency_protocol_enabled: bool,
  #[serde(rename = "logLevel")]
  pub log_level: String,
  #[serde(rename = "isClientInvoker")]
  pub is_client_invoker: bool,
  #[serde(rename = "invokerIdentity")]
  pub invoker_identity: String,
}

/// Top-level HTTP request envelope: `{"value": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestEnvelope {
  pub value: RequestEnvelopeValue,
}

/// A `(fileOrDir, parentId, function)` routing hint (spec §6/glossary "mapping hint").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentMapping {
  #[serde(rename = "fileOrDir")]
  pub file_or_dir: String,
  #[serde(rename = "parentId")]
  pub parent_id: i64,
  pub function: u32,
}

/// The `body` object of the HTTP response envelope (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
  #[serde(rename = "requestId")]
  pub request_id: Uuid,
  pub operation: String,
  #[serde(rename = "nameNodeId")]
  pub name_node_id: u64,
  #[serde(rename = "deploymentNumber")]
  pub deployment_number: u32,
  #[serde(rename = "cacheHits")]
  pub cache_hits: u64,
  #[serde(rename = "cacheMisses")]
  pub cache_misses: u64,
  #[serde(rename = "fnStartTime")]
  pub fn_start_time: TimestampMillis,
  #[serde(rename = "fnEndTime")]
  pub fn_end_time: TimestampMillis,
  #[serde(rename = "enqueuedTime")]
  pub enqueued_time: TimestampMillis,
  #[serde(rename = "dequeuedTime")]
  pub dequeued_time: TimestampMillis,
  #[serde(rename = "processingFinishedTime")]
  pub processing_finished_time: TimestampMillis,
  #[serde(rename = "coldStart")]
  pub cold_start: bool,
  pub cancelled: bool,
  #[serde(rename = "duplicateRequest")]
  pub duplicate_request: bool,
  /// Base64-encoded serialized payload. Absent (`None`) when there is no result,
  /// per spec §3's `hasResult ⇔ payload ≠ null ∧ not duplicate` invariant.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub result: Option<String>,
  pub exceptions: Vec<String>,
  #[serde(rename = "deploymentMapping", skip_serializing_if = "Option::is_none", default)]
  pub deployment_mapping: Option<DeploymentMapping>,
  #[serde(
    rename = "statisticsPackage",
    skip_serializing_if = "Option::is_none",
    default
  )]
  pub statistics_package: Option<serde_json::Value>,
  #[serde(
    rename = "transactionEvents",
    skip_serializing_if = "Option::is_none",
    default
  )]
  pub transaction_events: Option<serde_json::Value>,
}

/// Top-level HTTP response envelope (spec §6). `statusCode` is always 200 when an
/// envelope exists; success/failure is carried in `success` and `exceptions`
/// (spec §7 "User-visible failure behavior").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseEnvelope {
  #[serde(rename = "statusCode")]
  pub status_code: u16,
  pub status: String,
  pub success: bool,
  pub headers: HashMap<String, String>,
  pub body: ResponseBody,
}

impl HttpResponseEnvelope {
  pub fn ok(body: ResponseBody) -> Self {
    let success = body.exceptions.is_empty();
    Self {
      status_code: 200,
      status: "OK".to_string(),
      success,
      headers: HashMap::new(),
      body,
    }
  }
}

/// One TCP frame in either direction: the same JSON body as the HTTP envelope value,
/// plus `cancelled`/`reason`/`shouldRetry` used for channel-close cancellation
/// (spec §6 "Wire envelope (TCP)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpRequestFrame {
  pub value: RequestEnvelopeValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpReplyFrame {
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub body: Option<ResponseBody>,
  #[serde(default)]
  pub cancelled: bool,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub reason: Option<String>,
  #[serde(rename = "shouldRetry", default)]
  pub should_retry: bool,
}

impl TcpReplyFrame {
  pub fn success(body: ResponseBody) -> Self {
    Self {
      body: Some(body),
      cancelled: false,
      reason: None,
      should_retry: false,
    }
  }

  pub fn cancellation(reason: impl Into<String>, should_retry: bool) -> Self {
    Self {
      body: None,
      cancelled: true,
      reason: Some(reason.into()),
      should_retry,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operation_args_src_and_force_redo_round_trip() {
    let mut args = OperationArgs::with_src("/a/b");
    assert_eq!(args.src(), Some("/a/b"));
    assert!(!args.force_redo());
    args.set_force_redo(true);
    assert!(args.force_redo());
  }

  #[test]
  fn response_body_serializes_without_result_when_absent() {
    let body = ResponseBody {
      request_id: Uuid::nil(),
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
      duplicate_request: true,
      result: None,
      exceptions: vec![],
      deployment_mapping: None,
      statistics_package: None,
      transaction_events: None,
    };
    let json = serde_json::to_string(&body).unwrap();
    assert!(!json.contains("\"result\""));
    assert!(json.contains("\"duplicateRequest\":true"));
  }
}
