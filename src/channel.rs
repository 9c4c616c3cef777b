//! Persistent TCP duplex channel (C4's primary transport): one long-lived
//! connection per client-instance pair, multiplexing many in-flight requests by
//! request id instead of opening a socket per call.
//!
//! Framing follows the same pattern as the rest of the crate's concurrent-map
//! idioms (`signals.rs`, `plugins/idempotency.rs`): a background reader task demuxes
//! incoming frames into a `DashMap<Uuid, oneshot::Sender<...>>` correlation table,
//! and callers just await their own oneshot. `tokio_util`'s length-delimited codec
//! carries one JSON-encoded `TcpReplyFrame`/`TcpRequestFrame` per frame (spec §6
//! "Wire envelope (TCP)").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::errors::DispatchError;
use crate::wire::{TcpReplyFrame, TcpRequestFrame};

type Correlations = Arc<DashMap<Uuid, oneshot::Sender<TcpReplyFrame>>>;

/// A single request/reply multiplexed over one persistent TCP connection.
pub struct Channel {
  writer: tokio::sync::Mutex<futures_util::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>>,
  correlations: Correlations,
  closed: Arc<AtomicBool>,
}

impl Channel {
  /// Connects to `addr` and starts the background demux task.
  pub async fn connect(addr: &str) -> std::io::Result<Self> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Self::from_stream(stream))
  }

  pub fn from_stream(stream: TcpStream) -> Self {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (writer, mut reader) = framed.split();
    let correlations: Correlations = Arc::new(DashMap::new());
    let closed = Arc::new(AtomicBool::new(false));

    let table = correlations.clone();
    let closed_flag = closed.clone();
    tokio::spawn(async move {
      while let Some(frame) = reader.next().await {
        let Ok(bytes) = frame else { break };
        let Ok(reply) = serde_json::from_slice::<(Uuid, TcpReplyFrame)>(&bytes) else {
          continue;
        };
        if let Some((_, sender)) = table.remove(&reply.0) {
          let _ = sender.send(reply.1);
        }
      }
      closed_flag.store(true, Ordering::SeqCst);
      for entry in table.iter() {
        let _ = entry.key();
      }
      table.clear();
    });

    Self {
      writer: tokio::sync::Mutex::new(writer),
      correlations,
      closed,
    }
  }

  /// Whether the background reader has observed the connection close.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Sends `request` and awaits its matching reply, correlated by the request's
  /// own `requestId` (spec §4.4 "persistent channel races against HTTP").
  pub async fn call(&self, request: TcpRequestFrame) -> Result<TcpReplyFrame, DispatchError> {
    let request_id = request.value.request_id;
    let (tx, rx) = oneshot::channel();
    self.correlations.insert(request_id, tx);

    let payload = serde_json::to_vec(&(request_id, request))
      .map_err(|e| DispatchError::MalformedEnvelope(e.to_string()))?;

    {
      let mut writer = self.writer.lock().await;
      if writer.send(Bytes::from(payload)).await.is_err() {
        self.correlations.remove(&request_id);
        return Err(DispatchError::ChannelClosed);
      }
    }

    match rx.await {
      Ok(reply) => Ok(reply),
      Err(_) => Err(DispatchError::ChannelClosed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn call_times_out_with_channel_closed_when_peer_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      let (mut sock, _) = listener.accept().await.unwrap();
      // Read the framed request length+body then drop the connection.
      let mut len_buf = [0u8; 4];
      let _ = sock.read_exact(&mut len_buf).await;
      let len = u32::from_be_bytes(len_buf) as usize;
      let mut buf = vec![0u8; len];
      let _ = sock.read_exact(&mut buf).await;
      let _ = sock.shutdown().await;
    });

    let channel = Channel::connect(&addr.to_string()).await.unwrap();
    let request = TcpRequestFrame {
      value: crate::wire::RequestEnvelopeValue {
        op: "getFileInfo".into(),
        request_id: Uuid::new_v4(),
        client_name: "c".into(),
        client_internal_ip: "127.0.0.1".into(),
        tcp_enabled: true,
        tcp_port: 0,
        fs_args: crate::wire::OperationArgs::with_src("/a"),
        command_line_args: vec![],
        debug_ndb: None,
        debug_string_ndb: None,
        force_redo: false,
        consistency_protocol_enabled: false,
        log_level: "info".into(),
        is_client_invoker: true,
        invoker_identity: "c".into(),
      },
    };
    let result = channel.call(request).await;
    assert!(matches!(result, Err(DispatchError::ChannelClosed)));
  }
}
