//! Chunked array stores: the key/value surface consumed by bulk copy.
//!
//! Keys are `/`-separated paths relative to the store root
//! (`.zgroup`, `features/.zarray`, `features/0.0`, ...).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::HubError;

/// Key of the consolidated metadata object.
pub const CONSOLIDATED_METADATA_KEY: &str = ".zmetadata";

const METADATA_SUFFIXES: [&str; 3] = [".zarray", ".zgroup", ".zattrs"];

/// Minimal get/put/list/delete surface of a chunked array store.
pub trait ArrayStore {
    /// `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError>;

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), HubError>;

    fn contains(&self, key: &str) -> Result<bool, HubError> {
        Ok(self.get(key)?.is_some())
    }

    /// Every key in the store, sorted.
    fn list(&self) -> Result<Vec<String>, HubError>;

    fn delete(&mut self, key: &str) -> Result<(), HubError>;
}

pub fn is_metadata_key(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    METADATA_SUFFIXES.contains(&name)
}

fn validate_key(key: &str) -> Result<(), HubError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(HubError::Store(format!("invalid store key '{}'", key)));
    }
    Ok(())
}

// ── Directory store ─────────────────────────────────────────────────

/// Array store backed by a directory tree on disk.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, HubError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, part| p.join(part)))
    }
}

impl ArrayStore for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), HubError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, value)?;
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, HubError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self) -> Result<Vec<String>, HubError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| HubError::Store(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                keys.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&mut self, key: &str) -> Result<(), HubError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Memory store ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for MemoryStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl ArrayStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), HubError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, HubError> {
        Ok(self.entries.contains_key(key))
    }

    fn list(&self) -> Result<Vec<String>, HubError> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn delete(&mut self, key: &str) -> Result<(), HubError> {
        self.entries.remove(key);
        Ok(())
    }
}

// ── Consolidated metadata ───────────────────────────────────────────

/// Write `.zmetadata` aggregating every `.zarray`/`.zgroup`/`.zattrs` object.
/// Returns the serialized bytes that were stored.
pub fn consolidate_metadata(store: &mut dyn ArrayStore) -> Result<Vec<u8>, HubError> {
    let mut metadata = serde_json::Map::new();
    for key in store.list()? {
        if !is_metadata_key(&key) {
            continue;
        }
        let Some(bytes) = store.get(&key)? else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| HubError::Store(format!("metadata object '{}' is not JSON: {}", key, e)))?;
        metadata.insert(key, value);
    }

    let consolidated = serde_json::json!({
        "zarr_consolidated_format": 1,
        "metadata": metadata,
    });
    let bytes = serde_json::to_vec_pretty(&consolidated)
        .map_err(|e| HubError::Store(format!("failed to serialize consolidated metadata: {}", e)))?;
    store.put(CONSOLIDATED_METADATA_KEY, &bytes)?;
    Ok(bytes)
}

/// Parse a `.zmetadata` object into its key → metadata map.
pub fn parse_consolidated(bytes: &[u8]) -> Result<BTreeMap<String, serde_json::Value>, HubError> {
    #[derive(Deserialize)]
    struct Consolidated {
        zarr_consolidated_format: u32,
        metadata: BTreeMap<String, serde_json::Value>,
    }

    let parsed: Consolidated = serde_json::from_slice(bytes)
        .map_err(|e| HubError::Store(format!("invalid consolidated metadata: {}", e)))?;
    if parsed.zarr_consolidated_format != 1 {
        return Err(HubError::Store(format!(
            "unsupported consolidated metadata format {}",
            parsed.zarr_consolidated_format
        )));
    }
    Ok(parsed.metadata)
}

// ── Bulk copy ───────────────────────────────────────────────────────

/// What bulk copy does with a key that already exists at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort on the first existing key; earlier keys stay written.
    Raise,
    #[default]
    Replace,
    Skip,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raise" => Ok(ConflictPolicy::Raise),
            "replace" => Ok(ConflictPolicy::Replace),
            "skip" => Ok(ConflictPolicy::Skip),
            other => Err(format!("unknown conflict policy '{}' (raise, replace, skip)", other)),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Raise => "raise",
            ConflictPolicy::Replace => "replace",
            ConflictPolicy::Skip => "skip",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Keys written to a destination that did not have them
    pub copied: Vec<String>,
    pub replaced: Vec<String>,
    pub skipped: Vec<String>,
}

impl CopyReport {
    pub fn written(&self) -> usize {
        self.copied.len() + self.replaced.len()
    }
}

/// Copy every source key (except `exclude`) to `dest`, one key at a time.
///
/// Keys are visited in sorted order. Nothing is rolled back: a `Raise`
/// conflict or a failed write leaves everything before it in place.
pub fn copy_store(
    source: &dyn ArrayStore,
    dest: &mut dyn ArrayStore,
    policy: ConflictPolicy,
    exclude: &[&str],
) -> Result<CopyReport, HubError> {
    let mut report = CopyReport::default();

    for key in source.list()? {
        if exclude.contains(&key.as_str()) {
            continue;
        }

        let exists = dest.contains(&key)?;
        if exists {
            match policy {
                ConflictPolicy::Raise => return Err(HubError::Conflict { key }),
                ConflictPolicy::Skip => {
                    log::debug!("skip {}", key);
                    report.skipped.push(key);
                    continue;
                }
                ConflictPolicy::Replace => {}
            }
        }

        let Some(bytes) = source.get(&key)? else {
            continue;
        };
        dest.put(&key, &bytes)?;

        if exists {
            log::debug!("replace {} ({} bytes)", key, bytes.len());
            report.replaced.push(key);
        } else {
            log::debug!("copy {} ({} bytes)", key, bytes.len());
            report.copied.push(key);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> MemoryStore {
        [
            (".zgroup", br#"{"zarr_format":2}"#.to_vec()),
            ("features/.zarray", br#"{"chunks":[2],"dtype":"<f8","shape":[4],"zarr_format":2}"#.to_vec()),
            ("features/.zattrs", br#"{"unit":"nM"}"#.to_vec()),
            ("features/0", vec![1u8; 16]),
            ("features/1", vec![2u8; 16]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path().join("data.zarr"));
        assert!(store.list().unwrap().is_empty());

        store.put("features/0", b"abc").unwrap();
        store.put(".zgroup", b"{}").unwrap();

        assert_eq!(store.get("features/0").unwrap().as_deref(), Some(&b"abc"[..]));
        assert!(store.get("features/9").unwrap().is_none());
        assert!(store.contains(".zgroup").unwrap());
        assert_eq!(store.list().unwrap(), vec![".zgroup", "features/0"]);

        store.delete("features/0").unwrap();
        store.delete("features/0").unwrap();
        assert_eq!(store.list().unwrap(), vec![".zgroup"]);
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path());
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.put("/abs", b"x").is_err());
        assert!(store.put("a//b", b"x").is_err());
    }

    #[test]
    fn test_consolidate_metadata_collects_metadata_keys_only() {
        let mut store = sample_store();
        let bytes = consolidate_metadata(&mut store).unwrap();

        assert_eq!(store.get(CONSOLIDATED_METADATA_KEY).unwrap().unwrap(), bytes);
        let metadata = parse_consolidated(&bytes).unwrap();
        let keys: Vec<&str> = metadata.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![".zgroup", "features/.zarray", "features/.zattrs"]);
        assert_eq!(metadata["features/.zattrs"]["unit"], "nM");
    }

    #[test]
    fn test_consolidation_is_stable() {
        let mut store = sample_store();
        let first = consolidate_metadata(&mut store).unwrap();
        let second = consolidate_metadata(&mut store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_copy_into_empty_destination() {
        let source = sample_store();
        let mut dest = MemoryStore::new();
        let report = copy_store(&source, &mut dest, ConflictPolicy::Raise, &[]).unwrap();
        assert_eq!(report.copied.len(), 5);
        assert_eq!(dest, source);
    }

    #[test]
    fn test_skip_leaves_existing_chunk_untouched() {
        let source = sample_store();
        let mut dest: MemoryStore = [("features/0", vec![9u8; 16])].into_iter().collect();

        let report = copy_store(&source, &mut dest, ConflictPolicy::Skip, &[]).unwrap();
        assert_eq!(report.skipped, vec!["features/0"]);
        assert_eq!(dest.get("features/0").unwrap().unwrap(), vec![9u8; 16]);
        assert_eq!(dest.get("features/1").unwrap().unwrap(), vec![2u8; 16]);
    }

    #[test]
    fn test_replace_overwrites_existing_chunk() {
        let source = sample_store();
        let mut dest: MemoryStore = [("features/0", vec![9u8; 16])].into_iter().collect();

        let report = copy_store(&source, &mut dest, ConflictPolicy::Replace, &[]).unwrap();
        assert_eq!(report.replaced, vec!["features/0"]);
        assert_eq!(dest, source);
    }

    #[test]
    fn test_raise_stops_at_conflicting_chunk() {
        let source = sample_store();
        let mut dest: MemoryStore = [("features/0", vec![9u8; 16])].into_iter().collect();

        let err = copy_store(&source, &mut dest, ConflictPolicy::Raise, &[]).unwrap_err();
        match err {
            HubError::Conflict { key } => assert_eq!(key, "features/0"),
            other => panic!("expected conflict, got {:?}", other),
        }
        // Keys sorted before the conflict were written; nothing after it was
        assert!(dest.contains("features/.zattrs").unwrap());
        assert_eq!(dest.get("features/0").unwrap().unwrap(), vec![9u8; 16]);
        assert!(!dest.contains("features/1").unwrap());
    }

    #[test]
    fn test_copy_respects_exclusions() {
        let mut source = sample_store();
        consolidate_metadata(&mut source).unwrap();
        let mut dest = MemoryStore::new();
        copy_store(&source, &mut dest, ConflictPolicy::Raise, &[CONSOLIDATED_METADATA_KEY]).unwrap();
        assert!(!dest.contains(CONSOLIDATED_METADATA_KEY).unwrap());
        assert_eq!(dest.len(), 5);
    }

    #[test]
    fn test_conflict_policy_parse() {
        assert_eq!("SKIP".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Skip);
        assert!("merge".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default().to_string(), "replace");
    }
}
