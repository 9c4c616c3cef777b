//! Client Dispatcher (C4): submits one operation to the owning deployment,
//! preferring the persistent TCP channel and falling back to HTTP, retrying with
//! backoff and `forceRedo` on transient failure (spec §4.4).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::backoff;
use crate::channel::Channel;
use crate::config::Config;
use crate::errors::DispatchError;
use crate::http_transport::HttpTransport;
use crate::invocation_cache::SharedInvocationCache;
use crate::registry::DeploymentNumber;
use crate::routing;
use crate::telemetry::{OperationLog, OperationOutcome, OperationPerformed, Transport};
use crate::wire::{HttpRequestEnvelope, OperationArgs, RequestEnvelopeValue, ResponseBody, TcpRequestFrame, now_millis};

/// One deployment's reachable endpoints, as resolved by whatever naming/discovery
/// mechanism sits above this crate (out of scope here, spec §1 Non-goals).
#[derive(Clone)]
pub struct DeploymentEndpoint {
  pub host: String,
  pub http_port: u16,
  pub http_path: String,
  pub tcp_port: u16,
}

/// Resolves a deployment number to its endpoint. Implemented by the embedding
/// application; this crate only defines the shape (spec §1 Non-goals: "naming/
/// discovery of deployment instances").
#[async_trait::async_trait]
pub trait EndpointResolver: Send + Sync {
  async fn resolve(&self, deployment: DeploymentNumber) -> Option<DeploymentEndpoint>;
}

/// Submits operations to the server side, choosing a transport and retrying with
/// backoff (spec §4.4 steps 1-4).
///
/// Holds a persistent TCP channel and a persistent HTTP connection per deployment,
/// reused across `submit` calls instead of reconnecting on every attempt (spec
/// §4.4 "TCP channel lifecycle"). A channel observed closed is evicted; the next
/// attempt for that deployment falls back to HTTP until the cache is repopulated.
pub struct Dispatcher {
  config: Config,
  resolver: Arc<dyn EndpointResolver>,
  invocation_cache: SharedInvocationCache,
  telemetry: OperationLog,
  client_name: String,
  tcp_channels: DashMap<DeploymentNumber, Arc<Channel>>,
  http_transports: DashMap<DeploymentNumber, Arc<tokio::sync::Mutex<HttpTransport>>>,
}

impl Dispatcher {
  pub fn new(config: Config, resolver: Arc<dyn EndpointResolver>, client_name: impl Into<String>) -> Self {
    Self {
      config,
      resolver,
      invocation_cache: Arc::new(crate::invocation_cache::InvocationCache::default()),
      telemetry: OperationLog::default(),
      client_name: client_name.into(),
      tcp_channels: DashMap::new(),
      http_transports: DashMap::new(),
    }
  }

  pub fn telemetry(&self) -> &OperationLog {
    &self.telemetry
  }

  pub fn invocation_cache(&self) -> &SharedInvocationCache {
    &self.invocation_cache
  }

  /// Routes `path` onto a deployment, preferring a cached route.
  fn route(&self, path: &str) -> DeploymentNumber {
    let parent = routing::parent_path(path);
    if let Some(d) = self.invocation_cache.get_route(parent) {
      return d;
    }
    let d = routing::deployment_of_path(parent, self.config.deployments_count);
    self.invocation_cache.put_route(parent, d);
    d
  }

  /// Submits `op` with `args`, retrying per the backoff schedule with
  /// `forceRedo=true` on every retry after the first attempt (spec §4.4 step 4:
  /// "a retried submission sets forceRedo so the server does not just replay a
  /// result for a request it never finished").
  ///
  /// Every reply is inspected for a mapping hint (spec §4.5 step 5), which
  /// refreshes C3 opportunistically; a `NotAuthorizedHere` reply additionally
  /// re-routes the next attempt to the deployment the hint names (spec §4.5
  /// "Write authorization": "the client is expected to refresh C3 from the
  /// mapping hint and retry").
  pub async fn submit(&self, op: &str, mut args: OperationArgs) -> Result<ResponseBody, DispatchError> {
    let request_id = Uuid::new_v4();
    let path = args.src().map(|s| s.to_string()).unwrap_or_default();
    let start_time = now_millis();
    let cfg = self.config.backoff.clone();
    let last_deployment = AtomicU32::new(0);

    let result = backoff::retry(&cfg, DispatchError::is_retryable, |attempt| {
      if attempt > 0 {
        args.set_force_redo(true);
      }
      let deployment = self.route(&path);
      last_deployment.store(deployment, Ordering::Relaxed);
      let envelope = build_envelope(op, request_id, &self.client_name, &args, self.config.consistency_protocol_enabled);
      let tcp_enabled = self.config.tcp_enabled;

      async move {
        let endpoint = self
          .resolver
          .resolve(deployment)
          .await
          .ok_or(DispatchError::ChannelClosed)?;
        let body = self.attempt_once(deployment, &endpoint, envelope, tcp_enabled).await?;
        self.apply_mapping_hint(&body);
        if let Some(owner) = not_authorized_owner(&body) {
          return Err(DispatchError::NotAuthorizedHere { owner });
        }
        Ok(body)
      }
    })
    .await;

    let deployment = last_deployment.load(Ordering::Relaxed);
    let outcome = match &result {
      Ok(body) if body.exceptions.is_empty() => OperationOutcome::Success,
      Ok(_) => OperationOutcome::Failed,
      Err(_) => OperationOutcome::Failed,
    };
    let end_time = now_millis();
    if let Ok(body) = &result {
      self.telemetry.record(OperationPerformed {
        request_id,
        operation_name: op.to_string(),
        deployment,
        transport: Transport::Http,
        start_time,
        end_time,
        enqueued_time: Some(body.enqueued_time),
        dequeued_time: Some(body.dequeued_time),
        fn_start_time: Some(body.fn_start_time),
        fn_end_time: Some(body.fn_end_time),
        cache_hits: body.cache_hits,
        cache_misses: body.cache_misses,
        outcome,
      });
    }

    result
  }

  async fn attempt_once(
    &self,
    deployment: DeploymentNumber,
    endpoint: &DeploymentEndpoint,
    envelope: RequestEnvelopeValue,
    tcp_enabled: bool,
  ) -> Result<ResponseBody, DispatchError> {
    if tcp_enabled {
      match self.attempt_tcp(deployment, endpoint, envelope.clone()).await {
        Ok(body) => return Ok(body),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(_) => {} // fall through to HTTP
      }
    }
    self.attempt_http(deployment, endpoint, envelope).await
  }

  /// Returns the cached, known-live channel for `deployment` if one exists,
  /// otherwise establishes and caches a new one (spec §4.4 "a persistent channel
  /// to some instance in that deployment is known-live"). A channel observed
  /// closed is evicted rather than reused.
  async fn tcp_channel_for(&self, deployment: DeploymentNumber, endpoint: &DeploymentEndpoint) -> Option<Arc<Channel>> {
    if let Some(existing) = self.tcp_channels.get(&deployment) {
      if !existing.is_closed() {
        return Some(existing.clone());
      }
      drop(existing);
      self.tcp_channels.remove(&deployment);
    }

    let addr = format!("{}:{}", endpoint.host, endpoint.tcp_port);
    let channel = Arc::new(Channel::connect(&addr).await.ok()?);
    self.tcp_channels.insert(deployment, channel.clone());
    Some(channel)
  }

  async fn attempt_tcp(
    &self,
    deployment: DeploymentNumber,
    endpoint: &DeploymentEndpoint,
    envelope: RequestEnvelopeValue,
  ) -> Result<ResponseBody, DispatchError> {
    let channel = match self.tcp_channel_for(deployment, endpoint).await {
      Some(c) => c,
      None => return Err(DispatchError::TransientNetwork(std::io::Error::other("tcp channel unavailable"))),
    };

    let frame = TcpRequestFrame { value: envelope };
    let deadline = Duration::from_secs(5);
    let reply = match tokio::time::timeout(deadline, channel.call(frame)).await {
      Ok(Ok(reply)) => reply,
      Ok(Err(e)) => {
        self.tcp_channels.remove(&deployment);
        return Err(e);
      }
      Err(_) => return Err(DispatchError::ChannelClosed),
    };

    if reply.cancelled {
      self.tcp_channels.remove(&deployment);
      return Err(DispatchError::OperationFailed(
        reply.reason.unwrap_or_else(|| "cancelled".to_string()),
      ));
    }
    reply
      .body
      .ok_or_else(|| DispatchError::MalformedEnvelope("tcp reply missing body".to_string()))
  }

  /// Returns the cached HTTP connection for `deployment`, establishing one on
  /// first use (spec §9 AMBIENT "a persistent `hyper::client::conn::http1`
  /// connection per deployment endpoint, reused across calls"). Evicted on any
  /// request failure so the next attempt reconnects.
  async fn http_transport_for(
    &self,
    deployment: DeploymentNumber,
    endpoint: &DeploymentEndpoint,
  ) -> Result<Arc<tokio::sync::Mutex<HttpTransport>>, DispatchError> {
    if let Some(existing) = self.http_transports.get(&deployment) {
      return Ok(existing.clone());
    }
    let transport = HttpTransport::connect(&endpoint.host, endpoint.http_port, endpoint.http_path.clone()).await?;
    let transport = Arc::new(tokio::sync::Mutex::new(transport));
    self.http_transports.insert(deployment, transport.clone());
    Ok(transport)
  }

  async fn attempt_http(
    &self,
    deployment: DeploymentNumber,
    endpoint: &DeploymentEndpoint,
    envelope: RequestEnvelopeValue,
  ) -> Result<ResponseBody, DispatchError> {
    let transport = self.http_transport_for(deployment, endpoint).await?;
    let request = HttpRequestEnvelope { value: envelope };
    let mut guard = transport.lock().await;
    match guard.submit(&request).await {
      Ok(response) => Ok(response.body),
      Err(e) => {
        drop(guard);
        self.http_transports.remove(&deployment);
        Err(e)
      }
    }
  }

  /// Opportunistically refreshes C3 from a reply's mapping hint, regardless of
  /// whether the operation itself succeeded (spec §4.5 step 5).
  fn apply_mapping_hint(&self, body: &ResponseBody) {
    if let Some(mapping) = &body.deployment_mapping {
      let parent = routing::parent_path(&mapping.file_or_dir);
      self.invocation_cache.put_route(parent, mapping.function);
    }
  }
}

fn build_envelope(
  op: &str,
  request_id: Uuid,
  client_name: &str,
  args: &OperationArgs,
  consistency_protocol_enabled: bool,
) -> RequestEnvelopeValue {
  RequestEnvelopeValue {
    op: op.to_string(),
    request_id,
    client_name: client_name.to_string(),
    client_internal_ip: "0.0.0.0".to_string(),
    tcp_enabled: true,
    tcp_port: 0,
    fs_args: args.clone(),
    command_line_args: vec![],
    debug_ndb: None,
    debug_string_ndb: None,
    force_redo: args.force_redo(),
    consistency_protocol_enabled,
    log_level: "info".to_string(),
    is_client_invoker: true,
    invoker_identity: client_name.to_string(),
  }
}

/// Extracts the owning deployment from a `NotAuthorizedHere` reply, preferring the
/// mapping hint (authoritative) and falling back to parsing the exception string
/// when no hint was attached.
fn not_authorized_owner(body: &ResponseBody) -> Option<DeploymentNumber> {
  let flagged = body.exceptions.iter().any(|e| e.starts_with("not authorized here"));
  if !flagged {
    return None;
  }
  if let Some(mapping) = &body.deployment_mapping {
    return Some(mapping.function);
  }
  body.exceptions.iter().find_map(|e| {
    e.strip_prefix("not authorized here: owning deployment is ")
      .and_then(|s| s.parse::<DeploymentNumber>().ok())
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NoEndpoints;

  #[async_trait::async_trait]
  impl EndpointResolver for NoEndpoints {
    async fn resolve(&self, _deployment: DeploymentNumber) -> Option<DeploymentEndpoint> {
      None
    }
  }

  #[tokio::test]
  async fn submit_fails_fast_when_deployment_unreachable() {
    let dispatcher = Dispatcher::new(Config::default(), Arc::new(NoEndpoints), "test-client");
    let result = dispatcher.submit("getFileInfo", OperationArgs::with_src("/a")).await;
    assert!(result.is_err());
  }

  #[test]
  fn routing_is_cached_after_first_lookup() {
    let dispatcher = Dispatcher::new(Config::default(), Arc::new(NoEndpoints), "test-client");
    assert!(dispatcher.invocation_cache.is_empty());
    let _ = dispatcher.route("/a/b");
    assert_eq!(dispatcher.invocation_cache.len(), 1);
  }

  #[test]
  fn mapping_hint_is_treated_as_authoritative_for_not_authorized_replies() {
    let body = ResponseBody {
      request_id: Uuid::nil(),
      operation: "mkdirs".into(),
      name_node_id: 0,
      deployment_number: 1,
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
      result: None,
      exceptions: vec!["not authorized here: owning deployment is 1".to_string()],
      deployment_mapping: Some(crate::wire::DeploymentMapping {
        file_or_dir: "/a".into(),
        parent_id: -1,
        function: 3,
      }),
      statistics_package: None,
      transaction_events: None,
    };
    assert_eq!(not_authorized_owner(&body), Some(3));
  }

  #[test]
  fn no_mapping_hint_is_needed_when_the_reply_is_not_rejected() {
    let body = ResponseBody {
      request_id: Uuid::nil(),
      operation: "getFileInfo".into(),
      name_node_id: 0,
      deployment_number: 1,
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
      result: Some("e30=".into()),
      exceptions: vec![],
      deployment_mapping: Some(crate::wire::DeploymentMapping {
        file_or_dir: "/a".into(),
        parent_id: -1,
        function: 1,
      }),
      statistics_package: None,
      transaction_events: None,
    };
    assert_eq!(not_authorized_owner(&body), None);
  }
}
