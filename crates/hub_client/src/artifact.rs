//! Artifact data models, at the level the transfer protocol needs them.
//!
//! Column annotations, splits and result tables are carried as opaque JSON.
//! The tabular part of a dataset is kept as the Parquet bytes it was read
//! from; [`parse_table`] checks that they really are Parquet.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use polars::prelude::{ParquetReader, SerReader};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checksum::{dataset_checksum, md5_hex, ChecksumManifest, Checksummed};
use crate::error::HubError;
use crate::store::{copy_store, ArrayStore, ConflictPolicy, DirectoryStore, MemoryStore};

/// Root of a dataset's chunked array content, locally and on the hub.
pub const ARRAY_ROOT: &str = "data.zarr";
pub const DATASET_FILE: &str = "dataset.json";
pub const TABLE_FILE: &str = "table.parquet";
pub const TABLE_CONTENT_TYPE: &str = "application/vnd.apache.parquet";
/// Leading and trailing magic of a Parquet file.
pub const PARQUET_MAGIC: &[u8] = b"PAR1";

/// License identifiers the hub accepts for datasets.
pub const SUPPORTED_LICENSES: &[&str] = &[
    "CC-BY-4.0",
    "CC-BY-SA-4.0",
    "CC-BY-NC-4.0",
    "CC-BY-NC-SA-4.0",
    "CC0-1.0",
    "MIT",
    "Apache-2.0",
    "BSD-3-Clause",
];

/// Lowercase, with every run of other characters collapsed into `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

// ── Table ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableShape {
    pub rows: usize,
    pub columns: usize,
}

/// Decode a dataset table, rejecting anything that is not a readable Parquet file.
///
/// The framing (magic at both ends, footer length inside the file) is checked
/// before polars sees the bytes, so an HTML error page fails fast.
pub fn parse_table(bytes: &[u8]) -> Result<TableShape, HubError> {
    let invalid = |reason: String| HubError::Parse(format!("table is not valid Parquet: {}", reason));

    let len = bytes.len();
    let magic = PARQUET_MAGIC.len();
    if len < 2 * magic + 4 {
        return Err(invalid(format!("{} bytes is too short", len)));
    }
    if &bytes[..magic] != PARQUET_MAGIC || &bytes[len - magic..] != PARQUET_MAGIC {
        return Err(invalid("missing PAR1 magic".into()));
    }
    let mut footer = [0u8; 4];
    footer.copy_from_slice(&bytes[len - magic - 4..len - magic]);
    let footer_len = u32::from_le_bytes(footer) as usize;
    if footer_len + 2 * magic + 4 > len {
        return Err(invalid(format!("footer length {} exceeds file size {}", footer_len, len)));
    }

    let df = ParquetReader::new(Cursor::new(bytes.to_vec()))
        .finish()
        .map_err(|e| invalid(e.to_string()))?;
    let (rows, columns) = df.shape();
    Ok(TableShape { rows, columns })
}

// ── Owner ───────────────────────────────────────────────────────────

/// User or organization owning an artifact, identified by its slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubOwner {
    slug: String,
}

impl HubOwner {
    pub fn new(slug: &str) -> Result<Self, HubError> {
        let slug = slug.trim();
        let valid = !slug.is_empty()
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(HubError::InvalidArtifact(format!(
                "'{}' is not a valid owner slug (lowercase letters, digits, '-' and '_')",
                slug
            )));
        }
        Ok(Self { slug: slug.to_string() })
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// An explicit owner takes precedence over the one on the artifact.
    pub fn normalize(explicit: Option<&str>, current: Option<&HubOwner>) -> Result<Self, HubError> {
        match (explicit, current) {
            (Some(slug), _) => Self::new(slug),
            (None, Some(owner)) => Ok(owner.clone()),
            (None, None) => Err(HubError::InvalidArtifact(
                "an owner is required to upload to the hub".into(),
            )),
        }
    }
}

impl fmt::Display for HubOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

impl FromStr for HubOwner {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for HubOwner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.slug)
    }
}

impl<'de> Deserialize<'de> for HubOwner {
    /// Accepts a bare slug or the hub's `{"slug": ..}` owner object.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Slug(String),
            Object { slug: String },
        }

        let slug = match Repr::deserialize(deserializer)? {
            Repr::Slug(slug) | Repr::Object { slug } => slug,
        };
        HubOwner::new(&slug).map_err(serde::de::Error::custom)
    }
}

// ── Access ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Public,
    #[default]
    Private,
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(AccessType::Public),
            "private" => Ok(AccessType::Private),
            other => Err(format!("unknown access type '{}' (public, private)", other)),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessType::Public => "public",
            AccessType::Private => "private",
        })
    }
}

// ── Shared metadata ─────────────────────────────────────────────────

/// Metadata every hub artifact carries. All optional until upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub user_attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<HubOwner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ArtifactMetadata {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ..Self::default()
        }
    }

    /// `owner/slug(name)`, once both are known.
    pub fn artifact_id(&self) -> Option<String> {
        match (&self.owner, &self.name) {
            (Some(owner), Some(name)) => Some(format!("{}/{}", owner, slugify(name))),
            _ => None,
        }
    }

    pub(crate) fn require_name(&self) -> Result<String, HubError> {
        self.name
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HubError::InvalidArtifact("a name is required to upload to the hub".into()))
    }
}

// ── Dataset ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl License {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), reference: None }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_LICENSES.contains(&self.id.as_str())
    }
}

/// Local chunked array content attached to a dataset.
#[derive(Debug, Clone)]
pub enum ArrayContent {
    Directory(DirectoryStore),
    Memory(MemoryStore),
}

impl ArrayContent {
    pub fn store(&self) -> &dyn ArrayStore {
        match self {
            ArrayContent::Directory(store) => store,
            ArrayContent::Memory(store) => store,
        }
    }

    pub fn store_mut(&mut self) -> &mut dyn ArrayStore {
        match self {
            ArrayContent::Directory(store) => store,
            ArrayContent::Memory(store) => store,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(flatten)]
    pub meta: ArtifactMetadata,

    #[serde(default)]
    pub readme: String,

    /// Per-column annotations, keyed by column name
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curation_reference: Option<String>,

    #[serde(rename = "md5Sum", default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    /// Digests of the array content as recorded by the hub
    #[serde(rename = "zarrContent", default, skip_serializing)]
    pub array_manifest: ChecksumManifest,

    #[serde(skip)]
    pub table: Vec<u8>,

    #[serde(skip)]
    pub array: Option<ArrayContent>,
}

impl Dataset {
    pub fn new(name: &str, table: Vec<u8>) -> Self {
        Self {
            meta: ArtifactMetadata::named(name),
            table,
            ..Self::default()
        }
    }

    pub fn with_array(mut self, array: ArrayContent) -> Self {
        self.array = Some(array);
        self
    }

    pub fn artifact_id(&self) -> Option<String> {
        self.meta.artifact_id()
    }

    pub fn uses_array_content(&self) -> bool {
        self.array.is_some() || !self.array_manifest.is_empty()
    }

    /// Manifest of the attached array content, or the recorded one if none is attached.
    pub fn current_manifest(&self) -> Result<ChecksumManifest, HubError> {
        match &self.array {
            Some(array) => ChecksumManifest::from_store(array.store()),
            None => Ok(self.array_manifest.clone()),
        }
    }

    /// Rejects datasets the hub will not accept, before any request is made.
    pub fn check_uploadable(&self) -> Result<(), HubError> {
        match &self.license {
            None => {
                return Err(HubError::InvalidArtifact(format!(
                    "specify a supported license for this dataset before uploading. Supported: {}",
                    SUPPORTED_LICENSES.join(", ")
                )))
            }
            Some(license) if !license.is_supported() => {
                return Err(HubError::InvalidArtifact(format!(
                    "license '{}' is not supported. Supported: {}",
                    license.id,
                    SUPPORTED_LICENSES.join(", ")
                )))
            }
            Some(_) => {}
        }
        self.meta.require_name()?;
        if self.table.is_empty() {
            return Err(HubError::InvalidArtifact("the dataset table is empty".into()));
        }
        Ok(())
    }

    /// Load `dataset.json`, `table.parquet` and (if present) `data.zarr/` from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, HubError> {
        let meta_path = dir.join(DATASET_FILE);
        let contents = std::fs::read_to_string(&meta_path).map_err(|e| {
            HubError::InvalidArtifact(format!("cannot read {}: {}", meta_path.display(), e))
        })?;
        let mut dataset: Dataset = serde_json::from_str(&contents)
            .map_err(|e| HubError::Parse(format!("{}: {}", meta_path.display(), e)))?;

        let table_path = dir.join(TABLE_FILE);
        dataset.table = std::fs::read(&table_path).map_err(|e| {
            HubError::InvalidArtifact(format!("cannot read {}: {}", table_path.display(), e))
        })?;
        let shape = parse_table(&dataset.table).map_err(|e| match e {
            HubError::Parse(reason) => HubError::Parse(format!("{}: {}", table_path.display(), reason)),
            other => other,
        })?;
        log::debug!("{}: {} rows x {} columns", table_path.display(), shape.rows, shape.columns);

        let array_root = dir.join(ARRAY_ROOT);
        if array_root.is_dir() {
            dataset.array = Some(ArrayContent::Directory(DirectoryStore::new(array_root)));
        }
        Ok(dataset)
    }

    /// Write the directory layout read by [`Dataset::load_dir`].
    pub fn save_dir(&self, dir: &Path) -> Result<(), HubError> {
        std::fs::create_dir_all(dir)?;
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| HubError::Parse(format!("failed to serialize dataset: {}", e)))?;
        std::fs::write(dir.join(DATASET_FILE), contents)?;
        std::fs::write(dir.join(TABLE_FILE), &self.table)?;

        if let Some(array) = &self.array {
            let target = dir.join(ARRAY_ROOT);
            if let ArrayContent::Directory(store) = array {
                if store.root() == target {
                    return Ok(());
                }
            }
            let mut dest = DirectoryStore::new(target);
            copy_store(array.store(), &mut dest, ConflictPolicy::Replace, &[])?;
        }
        Ok(())
    }
}

impl Checksummed for Dataset {
    fn compute_checksum(&self) -> Result<String, HubError> {
        Ok(dataset_checksum(&self.table, &self.current_manifest()?))
    }

    fn md5sum(&self) -> Option<&str> {
        self.md5sum.as_deref()
    }

    fn set_md5sum(&mut self, md5sum: String) {
        self.md5sum = Some(md5sum);
    }

    fn has_array_content(&self) -> bool {
        self.uses_array_content()
    }
}

// ── Benchmark ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkKind {
    SingleTask,
    MultiTask,
}

impl BenchmarkKind {
    pub fn for_targets(target_cols: &[String]) -> Self {
        if target_cols.len() == 1 {
            BenchmarkKind::SingleTask
        } else {
            BenchmarkKind::MultiTask
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Benchmark {
    #[serde(flatten)]
    pub meta: ArtifactMetadata,

    /// Resolved separately; uploads reference it by artifact id
    #[serde(skip)]
    pub dataset: Dataset,

    pub target_cols: Vec<String>,
    pub input_cols: Vec<String>,

    /// Train/test split as stored by the hub
    #[serde(default)]
    pub split: serde_json::Value,

    #[serde(default)]
    pub metrics: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_metric: Option<String>,

    #[serde(default)]
    pub readme: String,

    #[serde(rename = "md5Sum", default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
}

impl Benchmark {
    pub fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::for_targets(&self.target_cols)
    }

    pub fn artifact_id(&self) -> Option<String> {
        self.meta.artifact_id()
    }
}

impl Checksummed for Benchmark {
    /// Digest of the dataset's digest plus the task definition, order-insensitive in columns and metrics.
    fn compute_checksum(&self) -> Result<String, HubError> {
        let dataset_sum = match self.dataset.md5sum.as_deref() {
            Some(sum) => sum.to_string(),
            None => self.dataset.compute_checksum()?,
        };
        let sorted = |cols: &[String]| {
            let mut cols = cols.to_vec();
            cols.sort();
            cols
        };
        let canonical = serde_json::json!({
            "dataset": dataset_sum,
            "inputCols": sorted(&self.input_cols),
            "metrics": sorted(&self.metrics),
            "split": self.split,
            "targetCols": sorted(&self.target_cols),
        });
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| HubError::Parse(format!("failed to serialize benchmark: {}", e)))?;
        Ok(md5_hex(&bytes))
    }

    fn md5sum(&self) -> Option<&str> {
        self.md5sum.as_deref()
    }

    fn set_md5sum(&mut self, md5sum: String) {
        self.md5sum = Some(md5sum);
    }

    fn has_array_content(&self) -> bool {
        self.dataset.uses_array_content()
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResults {
    #[serde(flatten)]
    pub meta: ArtifactMetadata,

    /// Scores per test set and metric
    pub results: serde_json::Value,

    pub benchmark_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_owner: Option<HubOwner>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<String>,
}

/// What the caller gets back from a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    /// Server-assigned identifier, when the hub returns one
    pub id: Option<String>,
    pub artifact_id: String,
    /// Browsable location of the artifact on the hub
    pub url: String,
    pub response: serde_json::Value,
}

impl UploadReceipt {
    pub(crate) fn from_response(artifact_id: String, url: String, response: serde_json::Value) -> Self {
        let id = match &response["id"] {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        Self { id, artifact_id, url, response }
    }
}
