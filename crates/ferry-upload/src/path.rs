//! Locating artifacts on disk.
//!
//! Two checks guard every upload. [`OutputDirs::locate`] is lexical and runs at
//! enqueue time; [`OutputDirs::resolve`] canonicalizes in the worker so
//! symlinks cannot escape the engine's directories.

use std::path::{Component, Path, PathBuf};

use ferry_config::UploadConfig;
use ferry_workflow::ArtifactRef;

use crate::error::UploadError;

/// The engine directories artifacts may be read from.
#[derive(Debug, Clone)]
pub struct OutputDirs {
  output: PathBuf,
  temp: PathBuf,
}

impl OutputDirs {
  pub fn new(output: impl Into<PathBuf>, temp: Option<PathBuf>) -> Self {
    let output = output.into();
    let temp = temp.unwrap_or_else(|| match output.parent() {
      Some(parent) => parent.join("temp"),
      None => PathBuf::from("temp"),
    });
    Self { output, temp }
  }

  pub fn from_config(config: &UploadConfig) -> Self {
    Self::new(config.output_root.clone(), config.temp_root.clone())
  }

  pub fn root(&self, folder_type: &str) -> Option<&Path> {
    match folder_type {
      "output" => Some(&self.output),
      "temp" => Some(&self.temp),
      _ => None,
    }
  }

  /// Lexically validate an artifact and build its path.
  pub fn locate(&self, artifact: &ArtifactRef) -> Result<PathBuf, UploadError> {
    let forbidden = |reason| UploadError::Forbidden {
      path: artifact.relative_path(),
      reason,
    };

    let root = self
      .root(&artifact.folder_type)
      .ok_or_else(|| forbidden("unknown folder type"))?;

    let filename = Path::new(&artifact.filename);
    if artifact.filename.is_empty() || !only_normal(filename) {
      return Err(forbidden("filename must be relative without '..'"));
    }

    let mut path = root.to_path_buf();
    if let Some(subfolder) = artifact.subfolder.as_deref().filter(|s| !s.is_empty()) {
      let subfolder = Path::new(subfolder);
      if !only_normal(subfolder) {
        return Err(forbidden("subfolder must be relative without '..'"));
      }
      path.push(subfolder);
    }
    path.push(filename);
    Ok(path)
  }

  /// Canonicalize the artifact's path and check it is still under its root.
  pub async fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, UploadError> {
    let candidate = self.locate(artifact)?;
    let root = self
      .root(&artifact.folder_type)
      .ok_or_else(|| UploadError::Forbidden {
        path: artifact.relative_path(),
        reason: "unknown folder type",
      })?;

    let root = canonicalize(root).await?;
    let resolved = canonicalize(&candidate).await?;
    if !resolved.starts_with(&root) {
      return Err(UploadError::Forbidden {
        path: artifact.relative_path(),
        reason: "resolves outside the output directory",
      });
    }
    Ok(resolved)
  }
}

fn only_normal(path: &Path) -> bool {
  path
    .components()
    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn canonicalize(path: &Path) -> Result<PathBuf, UploadError> {
  tokio::fs::canonicalize(path)
    .await
    .map_err(|source| UploadError::Io {
      path: path.to_path_buf(),
      source,
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use ferry_workflow::ArtifactKind;

  fn dirs() -> OutputDirs {
    OutputDirs::new("/srv/engine/output", None)
  }

  fn image(filename: &str) -> ArtifactRef {
    ArtifactRef::new(ArtifactKind::Image, filename)
  }

  #[test]
  fn test_locate_joins_subfolder() {
    let artifact = image("a.png").with_subfolder("batch");
    assert_eq!(
      dirs().locate(&artifact).unwrap(),
      PathBuf::from("/srv/engine/output/batch/a.png")
    );
  }

  #[test]
  fn test_temp_defaults_next_to_output() {
    let mut artifact = image("preview.png");
    artifact.folder_type = "temp".to_string();
    assert_eq!(
      dirs().locate(&artifact).unwrap(),
      PathBuf::from("/srv/engine/temp/preview.png")
    );
  }

  #[test]
  fn test_rejects_traversal_and_absolute() {
    let dirs = dirs();
    for artifact in [
      image("../../etc/passwd"),
      image("/etc/passwd"),
      image("a.png").with_subfolder("../.."),
      image("a.png").with_subfolder("/tmp"),
      image(""),
    ] {
      let err = dirs.locate(&artifact).unwrap_err();
      assert!(err.is_forbidden(), "{artifact:?} was accepted");
    }
  }

  #[test]
  fn test_rejects_unknown_folder_type() {
    let mut artifact = image("a.png");
    artifact.folder_type = "input".to_string();
    assert!(dirs().locate(&artifact).unwrap_err().is_forbidden());
  }
}
