//! End-to-end scenarios exercising the client dispatcher and server execution
//! engine together over a real HTTP loopback connection.

use std::sync::Arc;

use async_trait::async_trait;
use nimbusfs::config::Config;
use nimbusfs::dispatcher::{DeploymentEndpoint, Dispatcher, EndpointResolver};
use nimbusfs::engine::{Engine, OperationTable};
use nimbusfs::errors::ExecutionError;
use nimbusfs::listener::serve_http;
use nimbusfs::registry::{DeploymentNumber, InProcessRegistry};
use nimbusfs::wire::OperationArgs;

struct SingleDeployment {
  host: String,
  http_port: u16,
}

#[async_trait]
impl EndpointResolver for SingleDeployment {
  async fn resolve(&self, _deployment: DeploymentNumber) -> Option<DeploymentEndpoint> {
    Some(DeploymentEndpoint {
      host: self.host.clone(),
      http_port: self.http_port,
      http_path: "/".to_string(),
      tcp_port: 0,
    })
  }
}

async fn start_test_server(config: Config) -> (Engine, u16) {
  let mut operations = OperationTable::new();
  operations.register(
    "getFileInfo",
    false,
    Arc::new(|args| Box::pin(async move { Ok(serde_json::json!({ "src": args.src() })) })),
  );
  operations.register(
    "mkdirs",
    true,
    Arc::new(|_args| Box::pin(async move { Ok(serde_json::json!({ "ok": true })) })),
  );

  let engine = Engine::start_standalone(config, operations).await;

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let server_engine = engine.clone();
  tokio::spawn(async move {
    let _ = serve_http(listener, server_engine).await;
  });
  // Give the accept loop a moment to start listening.
  tokio::time::sleep(std::time::Duration::from_millis(20)).await;

  (engine, port)
}

fn dispatcher_for(port: u16, config: Config) -> Dispatcher {
  let resolver = Arc::new(SingleDeployment {
    host: "127.0.0.1".to_string(),
    http_port: port,
  });
  Dispatcher::new(config, resolver, "scenario-client")
}

#[tokio::test]
async fn cold_start_simple_read_round_trips_over_http() {
  let mut config = Config::default();
  config.tcp_enabled = false;
  let (_engine, port) = start_test_server(config.clone()).await;

  let dispatcher = dispatcher_for(port, config);
  let response = dispatcher
    .submit("getFileInfo", OperationArgs::with_src("/a"))
    .await
    .unwrap();

  assert!(response.exceptions.is_empty());
  assert!(response.cold_start);
  assert!(response.result.is_some());
  assert!(!response.duplicate_request);
}

#[tokio::test]
async fn duplicate_submission_is_flagged_as_a_replay() {
  let mut config = Config::default();
  config.tcp_enabled = false;
  let (engine, _port) = start_test_server(config.clone()).await;

  let envelope = nimbusfs::wire::RequestEnvelopeValue {
    op: "getFileInfo".to_string(),
    request_id: uuid::Uuid::new_v4(),
    client_name: "scenario-client".to_string(),
    client_internal_ip: "127.0.0.1".to_string(),
    tcp_enabled: false,
    tcp_port: 0,
    fs_args: OperationArgs::with_src("/a"),
    command_line_args: vec![],
    debug_ndb: None,
    debug_string_ndb: None,
    force_redo: false,
    consistency_protocol_enabled: false,
    log_level: "info".to_string(),
    is_client_invoker: true,
    invoker_identity: "scenario-client".to_string(),
  };

  let first = engine
    .handle(envelope.clone(), nimbusfs::telemetry::Transport::Http)
    .await;
  let second = engine
    .handle(envelope, nimbusfs::telemetry::Transport::Http)
    .await;

  assert!(!first.duplicate_request);
  assert!(second.duplicate_request);
  assert_eq!(first.result, second.result);
}

#[tokio::test]
async fn write_rejected_when_this_instance_does_not_own_the_deployment() {
  let owning_deployment = nimbusfs::routing::deployment_of_path("/", 4);
  let config = Config {
    deployments_count: 4,
    // Deliberately not this instance's deployment, so the write is rejected.
    self_deployment: (owning_deployment + 1) % 4,
    ..Config::default()
  };

  let mut operations = OperationTable::new();
  operations.register(
    "mkdirs",
    true,
    Arc::new(|_args| Box::pin(async move { Ok(serde_json::json!({ "ok": true })) })),
  );

  let registry = Arc::new(InProcessRegistry::new(4));
  let engine = Engine::start(config, registry, operations);
  let response = engine
    .handle(
      nimbusfs::wire::RequestEnvelopeValue {
        op: "mkdirs".to_string(),
        request_id: uuid::Uuid::new_v4(),
        client_name: "scenario-client".to_string(),
        client_internal_ip: "127.0.0.1".to_string(),
        tcp_enabled: false,
        tcp_port: 0,
        fs_args: OperationArgs::with_src("/"),
        command_line_args: vec![],
        debug_ndb: None,
        debug_string_ndb: None,
        force_redo: false,
        consistency_protocol_enabled: false,
        log_level: "info".to_string(),
        is_client_invoker: true,
        invoker_identity: "scenario-client".to_string(),
      },
      nimbusfs::telemetry::Transport::Http,
    )
    .await;

  assert!(!response.exceptions.is_empty());
  assert!(
    response
      .exceptions
      .iter()
      .any(|e| e.contains(&ExecutionError::NotAuthorizedHere { owner: owning_deployment }.as_exception_string()))
  );
}

#[tokio::test]
async fn backoff_exhausts_when_every_attempt_fails() {
  let mut config = Config::default();
  config.tcp_enabled = false;
  config.backoff.max_attempts = 2;
  config.backoff.initial_ms = 1;
  config.backoff.max_ms = 2;

  // Nobody is listening on this port: every attempt fails with a transient
  // network error, which is retryable, so the dispatcher exhausts its schedule.
  let dispatcher = dispatcher_for(59999, config);
  let result = dispatcher.submit("getFileInfo", OperationArgs::with_src("/a")).await;
  assert!(result.is_err());
}
