use serde::{Deserialize, Serialize};

/// Query parameters sent when requesting a signed upload URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUploadQuery {
  pub file_name: String,
  pub run_id: String,
  pub content_type: String,
  pub file_size: u64,
}

/// Control-plane response to a signed upload URL request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUpload {
  #[serde(alias = "url")]
  pub upload_url: String,
  pub download_url: String,
  #[serde(default)]
  pub include_acl: Option<bool>,
  #[serde(default)]
  pub is_public: Option<bool>,
}

impl SignedUpload {
  /// Whether the PUT must carry the public-read ACL header.
  pub fn public_read(&self) -> bool {
    self.include_acl.unwrap_or(false) || self.is_public.unwrap_or(false)
  }
}
