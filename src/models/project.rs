//! Project identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Identity of a project working directory.
///
/// The hash is an opaque stable identifier derived from the canonical
/// absolute path; every project-scoped row is filtered by it on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Opaque stable identifier (16 hex chars).
    pub hash: String,
    /// Canonical absolute path of the working directory.
    pub root: PathBuf,
    /// Human-readable name (final path component).
    pub name: String,
}

impl ProjectRef {
    /// Derives the project identity for a working directory.
    ///
    /// The path is canonicalized when possible so that differing spellings
    /// of the same directory hash identically.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let hash = hash_path(&root);
        let name = root
            .file_name()
            .map_or_else(|| "unknown".to_string(), |n| n.to_string_lossy().to_string());
        Self { hash, root, name }
    }
}

/// Hashes a canonical path to a 16-hex-char project identifier.
#[must_use]
pub fn hash_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
