//! Server-side listeners: the HTTP accept loop (spec §6 "Wire envelope (HTTP)")
//! and the TCP duplex accept loop (spec §6 "Wire envelope (TCP)"), both handing
//! decoded envelopes to a shared `Engine`.
//!
//! The HTTP loop is adapted from `server.rs`'s `run()`: one `TcpListener`, one
//! spawned task per accepted connection, `hyper::server::conn::http1` serving a
//! `service_fn` closure. Cold-start (spec §9 "orchestrated at the listener level")
//! happens once, before `TcpListener::bind` is even called, by passing an already-
//! constructed `Engine` in rather than lazily building one on first request.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, server::conn::http1, service::service_fn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::engine::Engine;
use crate::telemetry::Transport;
use crate::wire::{HttpRequestEnvelope, HttpResponseEnvelope, TcpReplyFrame, TcpRequestFrame};

/// Serves the HTTP endpoint on `listener` until the process exits, dispatching
/// every decoded envelope to `engine`.
pub async fn serve_http(listener: TcpListener, engine: Engine) -> std::io::Result<()> {
  loop {
    let (stream, _addr) = listener.accept().await?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let engine = engine.clone();

    tokio::spawn(async move {
      let svc = service_fn(move |req: Request<Incoming>| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(handle_http_request(req, engine).await) }
      });

      let mut http = http1::Builder::new();
      http.keep_alive(true);
      if let Err(err) = http.serve_connection(io, svc).await {
        tracing::debug!("http connection closed: {err}");
      }
    });
  }
}

async fn handle_http_request(req: Request<Incoming>, engine: Engine) -> Response<Full<Bytes>> {
  let body_bytes = match req.into_body().collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(_) => {
      return Response::builder()
        .status(200)
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    }
  };

  let envelope: HttpRequestEnvelope = match serde_json::from_slice(&body_bytes) {
    Ok(e) => e,
    Err(_) => {
      return Response::builder()
        .status(200)
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    }
  };

  let body = engine.handle(envelope.value, Transport::Http).await;
  let response = HttpResponseEnvelope::ok(body);
  let json = serde_json::to_vec(&response).unwrap_or_default();

  Response::builder()
    .status(200)
    .header("content-type", "application/json")
    .body(Full::new(Bytes::from(json)))
    .unwrap()
}

/// Serves the TCP duplex endpoint, demultiplexing each connection's frames by
/// request id the same way the client side's `Channel` does.
pub async fn serve_tcp(listener: TcpListener, engine: Engine) -> std::io::Result<()> {
  loop {
    let (stream, _addr) = listener.accept().await?;
    let engine = engine.clone();
    tokio::spawn(handle_tcp_connection(stream, engine));
  }
}

async fn handle_tcp_connection(stream: TcpStream, engine: Engine) {
  let framed = Framed::new(stream, LengthDelimitedCodec::new());
  let (writer, mut reader) = framed.split();
  let writer = Arc::new(tokio::sync::Mutex::new(writer));

  while let Some(frame) = reader.next().await {
    let Ok(bytes) = frame else { break };
    let Ok((request_id, request)) = serde_json::from_slice::<(Uuid, TcpRequestFrame)>(&bytes) else {
      continue;
    };

    let engine = engine.clone();
    let writer = writer.clone();
    tokio::spawn(async move {
      let body = engine.handle(request.value, Transport::Tcp).await;
      let reply = TcpReplyFrame::success(body);
      if let Ok(payload) = serde_json::to_vec(&(request_id, reply)) {
        let mut w = writer.lock().await;
        let _ = w.send(Bytes::from(payload)).await;
      }
    });
  }

  // Connection dropped mid-request: the client's `Channel::call` correlation
  // entry is left unanswered, observed as `DispatchError::ChannelClosed`, and the
  // dispatcher falls back to HTTP with `forceRedo=true` (spec §4.4/§8).
}
