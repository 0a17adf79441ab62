use serde::{Deserialize, Serialize};

/// The output category a file was reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
  Image,
  File,
  Gif,
  Audio,
  Video,
  ModelFile,
}

impl ArtifactKind {
  pub const ALL: [ArtifactKind; 6] = [
    ArtifactKind::Image,
    ArtifactKind::File,
    ArtifactKind::Gif,
    ArtifactKind::Audio,
    ArtifactKind::Video,
    ArtifactKind::ModelFile,
  ];

  /// Key of this category in a node's output payload.
  pub fn category(&self) -> &'static str {
    match self {
      ArtifactKind::Image => "images",
      ArtifactKind::File => "files",
      ArtifactKind::Gif => "gifs",
      ArtifactKind::Audio => "audio",
      ArtifactKind::Video => "video",
      ArtifactKind::ModelFile => "model_file",
    }
  }

  pub fn from_category(category: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|kind| kind.category() == category)
  }

  /// Content type used when neither the payload nor the extension says.
  pub fn default_content_type(&self) -> &'static str {
    match self {
      ArtifactKind::Image => "image/png",
      ArtifactKind::Gif => "image/gif",
      _ => "application/octet-stream",
    }
  }
}

/// A file produced by a node, to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
  pub kind: ArtifactKind,
  pub filename: String,
  pub subfolder: Option<String>,
  /// Engine directory the file lives in: `output` or `temp`.
  pub folder_type: String,
  pub content_type: String,
}

impl ArtifactRef {
  pub fn new(kind: ArtifactKind, filename: impl Into<String>) -> Self {
    let filename = filename.into();
    let content_type = guess_content_type(kind, &filename);
    Self {
      kind,
      filename,
      subfolder: None,
      folder_type: "output".to_string(),
      content_type,
    }
  }

  pub fn with_subfolder(mut self, subfolder: impl Into<String>) -> Self {
    self.subfolder = Some(subfolder.into());
    self
  }

  /// Path relative to the engine directory, as reported.
  pub fn relative_path(&self) -> String {
    match self.subfolder.as_deref().filter(|s| !s.is_empty()) {
      Some(subfolder) => format!("{}/{}", subfolder, self.filename),
      None => self.filename.clone(),
    }
  }
}

pub(crate) fn guess_content_type(kind: ArtifactKind, filename: &str) -> String {
  mime_guess::from_path(filename)
    .first()
    .map(|mime| mime.essence_str().to_string())
    .unwrap_or_else(|| kind.default_content_type().to_string())
}
