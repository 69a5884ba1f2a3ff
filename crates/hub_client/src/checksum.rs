//! Integrity digests over artifact content.
//!
//! Digests are MD5 hex strings, the format the hub stores and reports.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::store::ArrayStore;

/// When a transfer recomputes an artifact's digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumStrategy {
    #[serde(rename = "verify", alias = "always")]
    Always,
    #[serde(rename = "ignore", alias = "never")]
    Never,
    /// Verify unless the artifact carries chunked array content, whose full
    /// digest would mean reading every chunk.
    #[default]
    #[serde(rename = "verify_unless_zarr", alias = "unless-array")]
    SkipForChunkedArray,
}

impl ChecksumStrategy {
    pub fn should_verify(self, has_array_content: bool) -> bool {
        match self {
            ChecksumStrategy::Always => true,
            ChecksumStrategy::Never => false,
            ChecksumStrategy::SkipForChunkedArray => !has_array_content,
        }
    }
}

impl FromStr for ChecksumStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "verify" => Ok(ChecksumStrategy::Always),
            "never" | "ignore" => Ok(ChecksumStrategy::Never),
            "unless-array" | "verify_unless_zarr" => Ok(ChecksumStrategy::SkipForChunkedArray),
            other => Err(format!(
                "unknown checksum strategy '{}' (always, never, unless-array)",
                other
            )),
        }
    }
}

impl fmt::Display for ChecksumStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChecksumStrategy::Always => "always",
            ChecksumStrategy::Never => "never",
            ChecksumStrategy::SkipForChunkedArray => "unless-array",
        })
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Digest of one array store object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub md5_checksum: String,
}

/// Per-object digests of a chunked array store, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChecksumManifest {
    entries: Vec<ManifestEntry>,
}

impl ChecksumManifest {
    pub fn from_entries(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Self { entries }
    }

    /// Read every object once and digest it.
    pub fn from_store(store: &dyn ArrayStore) -> Result<Self, HubError> {
        let mut entries = Vec::new();
        for key in store.list()? {
            let Some(bytes) = store.get(&key)? else {
                continue;
            };
            entries.push(ManifestEntry {
                md5_checksum: md5_hex(&bytes),
                path: key,
            });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| self.entries[i].md5_checksum.as_str())
    }

    /// Check one object's bytes against its recorded digest.
    pub fn verify_object(&self, path: &str, bytes: &[u8]) -> Result<(), HubError> {
        let expected = self.get(path).ok_or_else(|| {
            HubError::InvalidArtifact(format!("'{}' is not listed in the checksum manifest", path))
        })?;
        let actual = md5_hex(bytes);
        if actual != expected {
            return Err(HubError::Integrity {
                expected: format!("{} ({})", expected, path),
                actual,
            });
        }
        Ok(())
    }
}

/// Dataset digest: tabular bytes, then every manifest entry in path order.
pub fn dataset_checksum(table: &[u8], manifest: &ChecksumManifest) -> String {
    let mut hasher = Md5::new();
    hasher.update(table);
    for entry in manifest.entries() {
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.md5_checksum.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Artifact whose content can be digested.
pub trait Checksummed {
    fn compute_checksum(&self) -> Result<String, HubError>;

    /// Digest currently recorded on the artifact.
    fn md5sum(&self) -> Option<&str>;

    fn set_md5sum(&mut self, md5sum: String);

    fn has_array_content(&self) -> bool;
}

/// Applies a [`ChecksumStrategy`] to artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier {
    strategy: ChecksumStrategy,
}

impl ChecksumVerifier {
    pub fn new(strategy: ChecksumStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ChecksumStrategy {
        self.strategy
    }

    pub fn compute(&self, artifact: &dyn Checksummed) -> Result<String, HubError> {
        artifact.compute_checksum()
    }

    pub fn verify(&self, artifact: &dyn Checksummed, expected: &str) -> Result<(), HubError> {
        let actual = self.compute(artifact)?;
        if actual != expected {
            return Err(HubError::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Settle the artifact's digest after a download (or before an upload).
    ///
    /// When the strategy verifies, the digest is recomputed and must match
    /// `reported` (or the artifact's own digest when nothing was reported).
    /// Otherwise `reported` is stored as-is. Returns whether a recomputation
    /// happened.
    pub fn apply(
        &self,
        artifact: &mut dyn Checksummed,
        reported: Option<&str>,
    ) -> Result<bool, HubError> {
        if !self.strategy.should_verify(artifact.has_array_content()) {
            if let Some(reported) = reported {
                artifact.set_md5sum(reported.to_string());
            }
            return Ok(false);
        }

        let actual = self.compute(artifact)?;
        let expected = reported.map(String::from).or_else(|| artifact.md5sum().map(String::from));
        if let Some(expected) = expected {
            if expected != actual {
                return Err(HubError::Integrity { expected, actual });
            }
        }
        artifact.set_md5sum(actual);
        Ok(true)
    }

    /// Like [`ChecksumVerifier::apply`] for a digest the caller already computed.
    ///
    /// The recorded digest is checked only when the strategy verifies; the
    /// computed one is always stored.
    pub fn reconcile(&self, artifact: &mut dyn Checksummed, computed: String) -> Result<(), HubError> {
        if self.strategy.should_verify(artifact.has_array_content()) {
            if let Some(recorded) = artifact.md5sum() {
                if recorded != computed {
                    return Err(HubError::Integrity {
                        expected: recorded.to_string(),
                        actual: computed,
                    });
                }
            }
        }
        artifact.set_md5sum(computed);
        Ok(())
    }
}
