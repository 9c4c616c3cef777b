//! Outbound HTTP transport (C4's fallback path): posts the JSON envelope to the
//! server instance's HTTP endpoint and decodes the response envelope.
//!
//! Grounded on `client.rs`'s `TakoClient`: a persistent HTTP/1.1 connection opened
//! once and reused, built the same way (`hyper::client::conn::http1::handshake`
//! over a `TokioIo`-wrapped `TcpStream`, with the connection driver spawned onto
//! its own task). The TLS variant (`TakoTlsClient`) is dropped — nothing in this
//! crate's scope talks to a TLS endpoint (see DESIGN.md).

use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::errors::DispatchError;
use crate::wire::{HttpRequestEnvelope, HttpResponseEnvelope};

/// A persistent HTTP/1.1 connection to one server instance's HTTP endpoint.
pub struct HttpTransport {
  sender: SendRequest<Full<Bytes>>,
  _conn_handle: JoinHandle<Result<(), hyper::Error>>,
  path: String,
}

impl HttpTransport {
  pub async fn connect(host: &str, port: u16, path: impl Into<String>) -> Result<Self, DispatchError> {
    let addr = format!("{host}:{port}");
    let tcp_stream = TcpStream::connect(&addr)
      .await
      .map_err(DispatchError::TransientNetwork)?;
    let io = TokioIo::new(tcp_stream);

    let (sender, conn) = hyper::client::conn::http1::handshake(io)
      .await
      .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))?;
    let conn_handle = tokio::spawn(async move {
      if let Err(err) = conn.await {
        tracing::error!("http transport connection error: {}", err);
      }
      Ok(())
    });

    Ok(Self {
      sender,
      _conn_handle: conn_handle,
      path: path.into(),
    })
  }

  /// Posts `envelope` and decodes the response body as an `HttpResponseEnvelope`
  /// (spec §6: HTTP always returns status 200; failure is carried in the body).
  pub async fn submit(
    &mut self,
    envelope: &HttpRequestEnvelope,
  ) -> Result<HttpResponseEnvelope, DispatchError> {
    let json = serde_json::to_vec(envelope).map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))?;

    let request = Request::builder()
      .method("POST")
      .uri(self.path.as_str())
      .header("content-type", "application/json")
      .body(Full::new(Bytes::from(json)))
      .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))?;

    let response = self
      .sender
      .send_request(request)
      .await
      .map_err(|e| to_dispatch_error(&e))?;

    let body_bytes = response
      .into_body()
      .collect()
      .await
      .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))?
      .to_bytes();

    serde_json::from_slice(&body_bytes).map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))
  }
}

fn to_dispatch_error(err: &hyper::Error) -> DispatchError {
  if err.is_closed() || err.is_incomplete_message() {
    DispatchError::ChannelClosed
  } else {
    DispatchError::TransientNetwork(std::io::Error::other(err.to_string()))
  }
}
