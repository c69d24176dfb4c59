//! Remote-stored artifact references

use serde::{Deserialize, Serialize};

/// Identity of an object held by the storage collaborator
///
/// Model weights and generated images are addressed this way. The pair
/// `(bucket, path)` is the identity; `size_bytes` is advisory and only used
/// to make room in the model cache before a download starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub bucket: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl ArtifactRef {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            size_bytes: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Stable identity string (`bucket/path`)
    pub fn identity(&self) -> String {
        format!("{}/{}", self.bucket, self.path)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}
