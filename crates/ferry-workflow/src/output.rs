use serde_json::Value;

use crate::artifact::{ArtifactKind, ArtifactRef, guess_content_type};

/// A node's completion payload, with its file references pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
  /// The payload exactly as the engine reported it.
  pub data: Value,
  pub artifacts: Vec<ArtifactRef>,
}

impl NodeOutput {
  /// Parse an `executed` payload.
  ///
  /// Each known category (`images`, `files`, `gifs`, ...) may hold a list of
  /// file entries or a single entry. Entries without a `filename` are kept in
  /// `data` but produce no artifact.
  pub fn parse(data: Value) -> Self {
    let mut artifacts = Vec::new();

    if let Some(object) = data.as_object() {
      for (category, value) in object {
        let Some(kind) = ArtifactKind::from_category(category) else {
          continue;
        };
        match value {
          Value::Array(entries) => {
            artifacts.extend(entries.iter().filter_map(|entry| parse_entry(kind, entry)));
          }
          Value::Object(_) => artifacts.extend(parse_entry(kind, value)),
          _ => {}
        }
      }
    }

    Self { data, artifacts }
  }

  pub fn has_files(&self) -> bool {
    !self.artifacts.is_empty()
  }
}

fn parse_entry(kind: ArtifactKind, entry: &Value) -> Option<ArtifactRef> {
  let filename = entry.get("filename")?.as_str()?.to_string();
  let subfolder = entry
    .get("subfolder")
    .and_then(Value::as_str)
    .map(str::to_string);
  let folder_type = entry
    .get("type")
    .and_then(Value::as_str)
    .unwrap_or("output")
    .to_string();
  let content_type = entry
    .get("content_type")
    .and_then(Value::as_str)
    .map(str::to_string)
    .unwrap_or_else(|| guess_content_type(kind, &filename));

  Some(ArtifactRef {
    kind,
    filename,
    subfolder,
    folder_type,
    content_type,
  })
}
