//! Hub client: listing, download and upload of datasets, benchmarks and results.
//!
//! Uploading a dataset is a three-step transaction:
//! 1. announce metadata, table descriptor and array checksum manifest
//! 2. PUT the table bytes (through a signed URL when the hub redirects)
//! 3. copy the array content object by object under a conflict policy
//!
//! Steps run strictly in that order. Step 3 is not transactional: an
//! interruption leaves the remote array store partially written.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;

use polaris_config::HubSettings;

use crate::artifact::{
    parse_table, AccessType, Benchmark, BenchmarkResults, Dataset, HubOwner, UploadReceipt,
    ARRAY_ROOT, TABLE_CONTENT_TYPE,
};
use crate::bridge::{HubArrayStore, OpenMode};
use crate::checksum::{dataset_checksum, md5_hex, ChecksumManifest, ChecksumStrategy, ChecksumVerifier};
use crate::error::HubError;
use crate::session::{signed_location, HubSession, RequestOptions};
use crate::store::{
    consolidate_metadata, copy_store, ArrayStore, ConflictPolicy, CopyReport, CONSOLIDATED_METADATA_KEY,
};

/// URI under which the hub records a dataset's array root.
const ARRAY_ROOT_URI: &str = "polarisfs://data.zarr";

/// Per-call transfer settings. Nothing here outlives the call.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub access: AccessType,
    /// Takes precedence over the owner recorded on the artifact
    pub owner: Option<String>,
    /// Defaults to the configured upload timeout
    pub timeout: Option<Duration>,
    pub if_exists: ConflictPolicy,
    pub verify: ChecksumStrategy,
}

/// Synchronous Polaris Hub client.
#[derive(Debug)]
pub struct HubClient {
    session: HubSession,
}

impl HubClient {
    /// Client with the on-disk token cache and browser login.
    pub fn new(settings: HubSettings) -> Result<Self, HubError> {
        Ok(Self::from_session(HubSession::new(settings)?))
    }

    pub fn from_session(session: HubSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &HubSession {
        &self.session
    }

    pub fn login(&self, overwrite: bool, auto_open_browser: bool) -> Result<(), HubError> {
        self.session.login(overwrite, auto_open_browser)
    }

    pub fn logout(&self) -> Result<(), HubError> {
        self.session.logout()
    }

    // ── Datasets ────────────────────────────────────────────────────

    /// Artifact ids (`owner/name`) of the datasets visible to the caller.
    pub fn list_datasets(&self, limit: usize, offset: usize) -> Result<Vec<String>, HubError> {
        let response = self.list_page("/dataset", limit, offset)?;
        response
            .iter()
            .map(|d| {
                d["artifactId"]
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| HubError::Parse("dataset listing entry without artifactId".into()))
            })
            .collect()
    }

    /// Download a dataset's metadata and table.
    ///
    /// Array content stays remote; its manifest is recorded on the dataset and
    /// [`HubClient::download_array_content`] fetches it. With `always`, the
    /// dataset digest is recomputed over the table and manifest here, and each
    /// chunk is checked against the manifest as it is copied.
    pub fn get_dataset(
        &self,
        owner: &str,
        name: &str,
        verify: ChecksumStrategy,
    ) -> Result<Dataset, HubError> {
        let response =
            self.session
                .hub_json(Method::GET, &format!("/dataset/{}/{}", owner, name), RequestOptions::new())?;

        let table_url = response["tableContent"]["url"]
            .as_str()
            .ok_or_else(|| HubError::Parse(format!("dataset {}/{} has no table content URL", owner, name)))?;
        let table = self.download_table(table_url)?;
        let shape = parse_table(&table).map_err(|e| match e {
            HubError::Parse(reason) => HubError::Parse(format!("dataset {}/{}: {}", owner, name, reason)),
            other => other,
        })?;

        let mut dataset: Dataset = serde_json::from_value(response.clone())
            .map_err(|e| HubError::Parse(format!("invalid dataset {}/{}: {}", owner, name, e)))?;
        dataset.table = table;

        let verifier = ChecksumVerifier::new(verify);
        let recomputed = verifier.apply(&mut dataset, response["md5Sum"].as_str())?;
        log::debug!(
            "loaded dataset {}/{} ({} rows x {} columns, {} array objects, checksum {})",
            owner,
            name,
            shape.rows,
            shape.columns,
            dataset.array_manifest.len(),
            if recomputed { "verified" } else { "as reported" }
        );
        Ok(dataset)
    }

    /// Open the hub side of a dataset's array content.
    pub fn open_array_store(
        &self,
        owner: &str,
        name: &str,
        root: &str,
        mode: OpenMode,
        as_consolidated: bool,
    ) -> Result<HubArrayStore<'_>, HubError> {
        HubArrayStore::open(&self.session, owner, name, root, mode, as_consolidated)
    }

    /// Copy the objects named by a downloaded dataset's manifest into `dest`.
    ///
    /// Objects are streamed one at a time and each is fetched once. Under
    /// `always` every object is checked against its manifest digest before it
    /// is written; the other strategies copy what the hub serves.
    pub fn download_array_content(
        &self,
        dataset: &Dataset,
        dest: &mut dyn ArrayStore,
        if_exists: ConflictPolicy,
        verify: ChecksumStrategy,
    ) -> Result<CopyReport, HubError> {
        let (owner, name) = identify(dataset)?;
        let remote = self.open_array_store(owner.slug(), &name, ARRAY_ROOT, OpenMode::Read, false)?;
        let source = ManifestSource {
            inner: &remote,
            manifest: &dataset.array_manifest,
            verify: verify.should_verify(true),
        };
        let report = copy_store(&source, dest, if_exists, &[])?;
        log::debug!(
            "copied {} array objects ({})",
            report.written(),
            if source.verify { "verified" } else { "unverified" }
        );
        Ok(report)
    }

    /// Upload a dataset. On success the dataset carries its owner and checksum.
    pub fn upload_dataset(
        &self,
        dataset: &mut Dataset,
        opts: &TransferOptions,
    ) -> Result<UploadReceipt, HubError> {
        dataset.check_uploadable()?;
        let owner = HubOwner::normalize(opts.owner.as_deref(), dataset.meta.owner.as_ref())?;
        let name = dataset.meta.require_name()?;
        dataset.meta.owner = Some(owner.clone());

        // Everything that reads local content happens before the announce
        let (manifest, zmetadata) = match dataset.array.as_mut() {
            Some(array) => {
                let zmetadata = consolidate_metadata(array.store_mut())?;
                (ChecksumManifest::from_store(array.store())?, Some(zmetadata))
            }
            None => (ChecksumManifest::default(), None),
        };
        let computed = dataset_checksum(&dataset.table, &manifest);
        ChecksumVerifier::new(opts.verify).reconcile(dataset, computed)?;
        dataset.array_manifest = manifest;

        let timeout = opts.timeout.unwrap_or_else(|| self.session.settings().upload_timeout());
        let dataset: &Dataset = dataset;

        let response = self.session.with_timeout(timeout, |session| {
            // Step 1: announce
            let mut body = serde_json::to_value(dataset)
                .map_err(|e| HubError::Parse(format!("failed to serialize dataset: {}", e)))?;
            if let Value::Object(map) = &mut body {
                map.insert(
                    "tableContent".into(),
                    serde_json::json!({
                        "size": dataset.table.len(),
                        "fileType": "parquet",
                        "md5Sum": md5_hex(&dataset.table),
                    }),
                );
                let manifest = serde_json::to_value(&dataset.array_manifest)
                    .map_err(|e| HubError::Parse(format!("failed to serialize manifest: {}", e)))?;
                map.insert("zarrContent".into(), manifest);
                map.insert("access".into(), Value::String(opts.access.to_string()));
                if zmetadata.is_some() {
                    map.insert("zarrRootPath".into(), Value::String(ARRAY_ROOT_URI.into()));
                }
            }
            let response = session.hub_json(
                Method::PUT,
                &format!("/dataset/{}/{}", owner, name),
                RequestOptions::new().json(body),
            )?;
            log::info!("announced dataset {}/{}", owner, name);

            // Step 2: table
            let table_url = response["tableContent"]["url"].as_str().ok_or_else(|| {
                HubError::Parse("announce response has no table content URL".into())
            })?;
            session.put_through_redirect(table_url, TABLE_CONTENT_TYPE, dataset.table.clone())?;
            log::info!("uploaded table ({} bytes)", dataset.table.len());

            // Step 3: array content
            if let (Some(array), Some(zmetadata)) = (&dataset.array, &zmetadata) {
                let mut dest =
                    HubArrayStore::open(session, owner.slug(), &name, ARRAY_ROOT, OpenMode::Write, false)?;
                dest.put(CONSOLIDATED_METADATA_KEY, zmetadata)?;

                log::info!("Copying array content to the Hub. This may take a while.");
                let report = copy_store(array.store(), &mut dest, opts.if_exists, &[CONSOLIDATED_METADATA_KEY])?;
                log::info!(
                    "array content: {} copied, {} replaced, {} skipped",
                    report.copied.len(),
                    report.replaced.len(),
                    report.skipped.len()
                );
            }
            Ok(response)
        })?;

        let artifact_id = format!("{}/{}", owner, name);
        let url = self.session.hub_link(&format!("datasets/{}", artifact_id))?;
        log::info!("Your dataset has been successfully uploaded to the Hub. View it here: {}", url);
        Ok(UploadReceipt::from_response(artifact_id, url, response))
    }

    // ── Benchmarks ──────────────────────────────────────────────────

    pub fn list_benchmarks(&self, limit: usize, offset: usize) -> Result<Vec<String>, HubError> {
        let response = self.list_page("/benchmark", limit, offset)?;
        response
            .iter()
            .map(|b| {
                let owner: HubOwner = serde_json::from_value(b["owner"].clone())
                    .map_err(|e| HubError::Parse(format!("benchmark listing entry: {}", e)))?;
                let name = b["name"]
                    .as_str()
                    .ok_or_else(|| HubError::Parse("benchmark listing entry without name".into()))?;
                Ok(format!("{}/{}", owner, name))
            })
            .collect()
    }

    /// Download a benchmark and the dataset it is defined on.
    pub fn get_benchmark(
        &self,
        owner: &str,
        name: &str,
        verify: ChecksumStrategy,
    ) -> Result<Benchmark, HubError> {
        let response = self.session.hub_json(
            Method::GET,
            &format!("/benchmark/{}/{}", owner, name),
            RequestOptions::new(),
        )?;

        let dataset_owner: HubOwner = serde_json::from_value(response["dataset"]["owner"].clone())
            .map_err(|e| HubError::Parse(format!("benchmark {}/{} dataset owner: {}", owner, name, e)))?;
        let dataset_name = response["dataset"]["name"]
            .as_str()
            .ok_or_else(|| HubError::Parse(format!("benchmark {}/{} has no dataset name", owner, name)))?;
        let dataset = self.get_dataset(dataset_owner.slug(), dataset_name, verify)?;

        let mut benchmark: Benchmark = serde_json::from_value(response.clone())
            .map_err(|e| HubError::Parse(format!("invalid benchmark {}/{}: {}", owner, name, e)))?;
        benchmark.dataset = dataset;
        log::debug!("benchmark {}/{} is {:?}", owner, name, benchmark.kind());

        ChecksumVerifier::new(verify).apply(&mut benchmark, response["md5Sum"].as_str())?;
        Ok(benchmark)
    }

    /// Upload a benchmark. Its dataset must already exist on the hub.
    pub fn upload_benchmark(
        &self,
        benchmark: &mut Benchmark,
        access: AccessType,
        owner: Option<&str>,
    ) -> Result<UploadReceipt, HubError> {
        let owner = HubOwner::normalize(owner, benchmark.meta.owner.as_ref())?;
        let name = benchmark.meta.require_name()?;
        let dataset_id = benchmark.dataset.artifact_id().ok_or_else(|| {
            HubError::InvalidArtifact("the benchmark's dataset needs an owner and a name".into())
        })?;
        benchmark.meta.owner = Some(owner.clone());
        ChecksumVerifier::new(ChecksumStrategy::Always).apply(benchmark, None)?;

        let mut body = serde_json::to_value(&*benchmark)
            .map_err(|e| HubError::Parse(format!("failed to serialize benchmark: {}", e)))?;
        if let Value::Object(map) = &mut body {
            map.insert("datasetArtifactId".into(), Value::String(dataset_id));
            map.insert("access".into(), Value::String(access.to_string()));
        }

        let response = self.session.hub_json(
            Method::PUT,
            &format!("/benchmark/{}/{}", owner, name),
            RequestOptions::new().json(body),
        )?;

        let artifact_id = format!("{}/{}", owner, name);
        let url = self.session.hub_link(&format!("benchmarks/{}", artifact_id))?;
        log::info!("Your benchmark has been successfully uploaded to the Hub. View it here: {}", url);
        Ok(UploadReceipt::from_response(artifact_id, url, response))
    }

    // ── Results ─────────────────────────────────────────────────────

    /// Upload results for an existing benchmark. Without an owner the hub
    /// attributes them to the caller.
    pub fn upload_results(
        &self,
        results: &mut BenchmarkResults,
        access: AccessType,
        owner: Option<&str>,
    ) -> Result<UploadReceipt, HubError> {
        if let Some(owner) = owner {
            results.meta.owner = Some(HubOwner::new(owner)?);
        }
        let benchmark_owner = results.benchmark_owner.clone().ok_or_else(|| {
            HubError::InvalidArtifact("results need the owner of their benchmark".into())
        })?;
        if results.benchmark_name.trim().is_empty() {
            return Err(HubError::InvalidArtifact("results need the name of their benchmark".into()));
        }

        let mut body = serde_json::to_value(&*results)
            .map_err(|e| HubError::Parse(format!("failed to serialize results: {}", e)))?;
        if let Value::Object(map) = &mut body {
            map.insert("access".into(), Value::String(access.to_string()));
        }

        let response = self
            .session
            .hub_json(Method::POST, "/result", RequestOptions::new().json(body))?;
        let receipt_id = match &response["id"] {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(HubError::Parse("result upload response has no id".into())),
        };

        let url = self.session.hub_link(&format!(
            "benchmarks/{}/{}/{}",
            benchmark_owner, results.benchmark_name, receipt_id
        ))?;
        log::info!("Your result has been successfully uploaded to the Hub. View it here: {}", url);
        Ok(UploadReceipt::from_response(
            format!("{}/{}", benchmark_owner, results.benchmark_name),
            url,
            response,
        ))
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn list_page(&self, path: &str, limit: usize, offset: usize) -> Result<Vec<Value>, HubError> {
        let response = self.session.hub_json(
            Method::GET,
            path,
            RequestOptions::new().query("limit", limit).query("offset", offset),
        )?;
        match response.get("data") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(HubError::Parse(format!("listing {} has no data array", path))),
        }
    }

    /// The table URL must answer with a 307 naming a signed location.
    fn download_table(&self, table_url: &str) -> Result<Vec<u8>, HubError> {
        let resp = self
            .session
            .request(Method::GET, table_url, RequestOptions::new())?;

        let status = resp.status();
        if status != StatusCode::TEMPORARY_REDIRECT {
            let body = resp.text().unwrap_or_default();
            let payload = serde_json::from_str(&body).unwrap_or(Value::String(body));
            if status.is_success() {
                return Err(HubError::Parse(format!(
                    "expected a signed URL redirect for the table, got {}",
                    status
                )));
            }
            return Err(HubError::HubRequest {
                status: status.as_u16(),
                payload,
            });
        }

        let location = signed_location(resp)?;
        self.session.download_signed(&location)
    }
}

fn identify(dataset: &Dataset) -> Result<(HubOwner, String), HubError> {
    let owner = dataset
        .meta
        .owner
        .clone()
        .ok_or_else(|| HubError::InvalidArtifact("dataset has no owner".into()))?;
    Ok((owner, dataset.meta.require_name()?))
}

/// Read-only view of a store that yields exactly the manifest's objects.
/// With `verify`, any object whose digest does not match is an error.
struct ManifestSource<'s> {
    inner: &'s dyn ArrayStore,
    manifest: &'s ChecksumManifest,
    verify: bool,
}

impl ArrayStore for ManifestSource<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        let bytes = self
            .inner
            .get(key)?
            .ok_or_else(|| HubError::Store(format!("'{}' is listed in the manifest but missing", key)))?;
        if self.verify {
            self.manifest.verify_object(key, &bytes)?;
        }
        Ok(Some(bytes))
    }

    fn put(&mut self, key: &str, _value: &[u8]) -> Result<(), HubError> {
        Err(HubError::Store(format!("cannot write '{}' to a verified source", key)))
    }

    fn contains(&self, key: &str) -> Result<bool, HubError> {
        Ok(self.manifest.get(key).is_some())
    }

    fn list(&self) -> Result<Vec<String>, HubError> {
        Ok(self.manifest.entries().iter().map(|e| e.path.clone()).collect())
    }

    fn delete(&mut self, key: &str) -> Result<(), HubError> {
        Err(HubError::Store(format!("cannot delete '{}' from a verified source", key)))
    }
}
