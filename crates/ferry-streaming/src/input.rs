use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::StreamingError;

/// Length of the NUL-padded input id in a binary frame.
pub const INPUT_ID_LENGTH: usize = 24;

const HEADER_LENGTH: usize = 4 + INPUT_ID_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
  Png,
  Jpeg,
  Webp,
}

impl ImageFormat {
  /// Detect the format from the file's magic bytes.
  pub fn detect(bytes: &[u8]) -> Option<Self> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
      Some(ImageFormat::Png)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
      Some(ImageFormat::Jpeg)
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
      Some(ImageFormat::Webp)
    } else {
      None
    }
  }

  pub fn mime(&self) -> &'static str {
    match self {
      ImageFormat::Png => "image/png",
      ImageFormat::Jpeg => "image/jpeg",
      ImageFormat::Webp => "image/webp",
    }
  }
}

/// A value accumulated for one input slot.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
  Text(String),
  Json(Value),
  Image { format: ImageFormat, bytes: Bytes },
}

impl InputValue {
  /// Strings holding a JSON object or array become `Json`; other strings stay
  /// `Text`; non-strings are `Json`.
  pub fn from_json(value: Value) -> Self {
    match value {
      Value::String(text) => match serde_json::from_str::<Value>(&text) {
        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => InputValue::Json(parsed),
        _ => InputValue::Text(text),
      },
      other => InputValue::Json(other),
    }
  }

  /// The value written into the graph. Images become data URLs.
  pub fn to_graph_value(&self) -> Value {
    match self {
      InputValue::Text(text) => Value::String(text.clone()),
      InputValue::Json(value) => value.clone(),
      InputValue::Image { format, bytes } => Value::String(format!(
        "data:{};base64,{}",
        format.mime(),
        STANDARD.encode(bytes)
      )),
    }
  }
}

/// A text message from a streaming client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
  Input {
    #[serde(default)]
    inputs: Map<String, Value>,
  },
  Template {
    graph: Value,
  },
}

impl ClientMessage {
  pub fn parse(text: &str) -> Result<Self, StreamingError> {
    serde_json::from_str(text).map_err(|e| StreamingError::InvalidMessage(e.to_string()))
  }
}

/// A decoded binary image frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
  pub kind: u32,
  pub input_id: String,
  pub value: InputValue,
}

impl ImageFrame {
  /// `[u32 BE event type][24-byte NUL-padded ASCII input id][image bytes]`.
  pub fn parse(frame: &[u8]) -> Result<Self, StreamingError> {
    if frame.len() <= HEADER_LENGTH {
      return Err(StreamingError::InvalidFrame("frame shorter than header"));
    }
    let kind = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);

    let raw_id = &frame[4..HEADER_LENGTH];
    let end = raw_id.iter().position(|b| *b == 0).unwrap_or(INPUT_ID_LENGTH);
    let raw_id = &raw_id[..end];
    if raw_id.is_empty() || !raw_id.is_ascii() {
      return Err(StreamingError::InvalidFrame("input id must be non-empty ASCII"));
    }
    let input_id = String::from_utf8_lossy(raw_id).into_owned();

    let image = &frame[HEADER_LENGTH..];
    let format =
      ImageFormat::detect(image).ok_or(StreamingError::InvalidFrame("unrecognized image format"))?;

    Ok(Self {
      kind,
      input_id,
      value: InputValue::Image {
        format,
        bytes: Bytes::copy_from_slice(image),
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00";

  fn frame(kind: u32, id: &str, image: &[u8]) -> Vec<u8> {
    let mut frame = kind.to_be_bytes().to_vec();
    let mut padded = [0u8; INPUT_ID_LENGTH];
    padded[..id.len()].copy_from_slice(id.as_bytes());
    frame.extend_from_slice(&padded);
    frame.extend_from_slice(image);
    frame
  }

  #[test]
  fn test_string_inputs_classified() {
    assert_eq!(InputValue::from_json(json!("a cat")), InputValue::Text("a cat".to_string()));
    assert_eq!(InputValue::from_json(json!("42")), InputValue::Text("42".to_string()));
    assert_eq!(
      InputValue::from_json(json!("{\"w\": 512}")),
      InputValue::Json(json!({"w": 512}))
    );
    assert_eq!(InputValue::from_json(json!(0.5)), InputValue::Json(json!(0.5)));
  }

  #[test]
  fn test_parse_image_frame() {
    let parsed = ImageFrame::parse(&frame(1, "input_image", PNG)).unwrap();
    assert_eq!(parsed.kind, 1);
    assert_eq!(parsed.input_id, "input_image");
    let InputValue::Image { format, .. } = parsed.value else {
      panic!("expected image");
    };
    assert_eq!(format, ImageFormat::Png);
  }

  #[test]
  fn test_full_width_input_id() {
    let id = "a".repeat(INPUT_ID_LENGTH);
    let parsed = ImageFrame::parse(&frame(1, &id, &[0xFF, 0xD8, 0xFF, 0xE0])).unwrap();
    assert_eq!(parsed.input_id, id);
  }

  #[test]
  fn test_rejects_bad_frames() {
    assert!(ImageFrame::parse(&[0, 0, 0, 1]).is_err());
    assert!(ImageFrame::parse(&frame(1, "", PNG)).is_err());
    assert!(ImageFrame::parse(&frame(1, "x", b"GIF89a....")).is_err());
  }

  #[test]
  fn test_webp_detection() {
    assert_eq!(ImageFormat::detect(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some(ImageFormat::Webp));
  }

  #[test]
  fn test_image_becomes_data_url() {
    let value = InputValue::Image {
      format: ImageFormat::Png,
      bytes: Bytes::from_static(b"abc"),
    };
    assert_eq!(value.to_graph_value(), json!("data:image/png;base64,YWJj"));
  }

  #[test]
  fn test_client_messages() {
    let input = ClientMessage::parse(r#"{"event": "input", "inputs": {"prompt": "hi"}}"#).unwrap();
    assert!(matches!(input, ClientMessage::Input { inputs } if inputs["prompt"] == "hi"));
    assert!(ClientMessage::parse(r#"{"event": "dance"}"#).is_err());
  }
}
