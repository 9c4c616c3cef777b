//! Minimal standalone server instance: cold-starts one engine serving a single
//! deployment and listens for HTTP requests. Demonstrates wiring `Engine` and
//! `listener::serve_http` together; a real deployment would also bind the TCP
//! listener and register with a real coordination-service-backed registry.

use nimbusfs::config::Config;
use nimbusfs::engine::{Engine, OperationTable};
use nimbusfs::listener::serve_http;

#[tokio::main]
async fn main() -> std::io::Result<()> {
  #[cfg(feature = "init-tracing")]
  nimbusfs::telemetry::init_tracing("info");

  let config = Config::from_env();

  let mut operations = OperationTable::new();
  operations.register(
    "getFileInfo",
    false,
    std::sync::Arc::new(|args| {
      Box::pin(async move { Ok(serde_json::json!({ "src": args.src() })) })
    }),
  );

  let engine = Engine::start_standalone(config, operations).await;

  let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
  println!(
    "nimbusfs instance {:?} listening on 127.0.0.1:8080",
    engine.instance_id().0
  );
  serve_http(listener, engine).await
}
