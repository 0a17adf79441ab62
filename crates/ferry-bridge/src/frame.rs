use bytes::{BufMut, Bytes, BytesMut};
use ferry_protocol::WsEvent;
use serde_json::Value;

/// One message queued for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
  /// JSON `{"event": .., "data": ..}`.
  Text(String),
  /// `[u32 BE event type][payload]`.
  Binary(Bytes),
}

impl Frame {
  pub fn event(event: &str, data: Value) -> Self {
    let message = WsEvent {
      event: event.to_string(),
      data,
    };
    // A Value always serializes
    Frame::Text(serde_json::to_string(&message).unwrap_or_default())
  }
}

pub fn binary_frame(kind: u32, payload: &[u8]) -> Bytes {
  let mut buf = BytesMut::with_capacity(4 + payload.len());
  buf.put_u32(kind);
  buf.put_slice(payload);
  buf.freeze()
}
