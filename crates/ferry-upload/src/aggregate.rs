use std::time::Duration;

use ferry_workflow::ArtifactRef;
use serde_json::{Value, json};

/// A node's output while its uploads are in flight.
#[derive(Debug)]
pub(crate) struct NodeUploads {
  pub node_class: String,
  pub output: Value,
  pub remaining: usize,
}

impl NodeUploads {
  pub fn new(node_class: String, output: Value, remaining: usize) -> Self {
    Self {
      node_class,
      output,
      remaining,
    }
  }

  /// Count one task as finished. Returns `true` once none are left.
  pub fn finish_one(&mut self) -> bool {
    self.remaining = self.remaining.saturating_sub(1);
    self.remaining == 0
  }
}

/// Attach `download_url` and `upload_duration` to the artifact's entry.
pub(crate) fn attach_download(
  output: &mut Value,
  artifact: &ArtifactRef,
  download_url: &str,
  duration: Duration,
) {
  let Some(category) = output.get_mut(artifact.kind.category()) else {
    return;
  };
  let entry = if category.is_array() {
    category
      .as_array_mut()
      .and_then(|entries| entries.iter_mut().find(|entry| matches(entry, artifact)))
  } else if matches(category, artifact) {
    Some(category)
  } else {
    None
  };
  if let Some(Value::Object(entry)) = entry {
    entry.insert("download_url".to_string(), json!(download_url));
    entry.insert("upload_duration".to_string(), json!(duration.as_secs_f64()));
  }
}

/// An output body for an artifact uploaded outside of any node.
pub(crate) fn single_artifact_output(artifact: &ArtifactRef, download_url: &str, duration: Duration) -> Value {
  json!({
    artifact.kind.category(): [{
      "filename": artifact.filename,
      "subfolder": artifact.subfolder.clone().unwrap_or_default(),
      "type": artifact.folder_type,
      "content_type": artifact.content_type,
      "download_url": download_url,
      "upload_duration": duration.as_secs_f64(),
    }]
  })
}

fn matches(entry: &Value, artifact: &ArtifactRef) -> bool {
  let subfolder = entry
    .get("subfolder")
    .and_then(Value::as_str)
    .filter(|s| !s.is_empty());
  entry.get("filename").and_then(Value::as_str) == Some(artifact.filename.as_str())
    && subfolder == artifact.subfolder.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use ferry_workflow::ArtifactKind;

  #[test]
  fn test_attaches_to_matching_entry_only() {
    let mut output = json!({
      "images": [
        {"filename": "a.png", "subfolder": "", "type": "output"},
        {"filename": "a.png", "subfolder": "x", "type": "output"}
      ]
    });
    let artifact = ArtifactRef::new(ArtifactKind::Image, "a.png").with_subfolder("x");

    attach_download(&mut output, &artifact, "https://cdn/a.png", Duration::from_millis(1500));

    assert!(output["images"][0].get("download_url").is_none());
    assert_eq!(output["images"][1]["download_url"], "https://cdn/a.png");
    assert_eq!(output["images"][1]["upload_duration"], 1.5);
  }

  #[test]
  fn test_attaches_to_single_object_category() {
    let mut output = json!({"model_file": {"filename": "lora.safetensors"}});
    let artifact = ArtifactRef::new(ArtifactKind::ModelFile, "lora.safetensors");
    attach_download(&mut output, &artifact, "https://cdn/l", Duration::ZERO);
    assert_eq!(output["model_file"]["download_url"], "https://cdn/l");
  }

  #[test]
  fn test_finish_one_counts_down() {
    let mut node = NodeUploads::new("SaveImage".to_string(), Value::Null, 2);
    assert!(!node.finish_one());
    assert!(node.finish_one());
  }
}
