//! Polaris Hub CLI commands: login, logout, listing, pull and push.
//!
//! `polaris login`       interactive login, caches identity + hub tokens
//! `polaris datasets`    list dataset artifact ids
//! `polaris pull`        dataset → dataset.json, table.parquet, data.zarr/
//! `polaris push`        local dataset directory → hub

use std::path::PathBuf;
use std::time::Duration;

use polaris_config::HubSettings;
use polaris_hub_client::{
    AccessType, ChecksumStrategy, ConflictPolicy, Dataset, DirectoryStore, HubClient,
    TransferOptions, ARRAY_ROOT,
};

use crate::CliError;

#[derive(Debug, Clone, Copy)]
pub enum Listing {
    Datasets,
    Benchmarks,
}

fn client(settings: HubSettings) -> Result<HubClient, CliError> {
    Ok(HubClient::new(settings)?)
}

/// Split `owner/name`.
fn parse_reference(reference: &str) -> Result<(&str, &str), CliError> {
    match reference.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(CliError::args(format!(
            "Invalid dataset reference: '{}' (expected owner/name)",
            reference
        ))
        .with_hint("example: polaris pull acme/solubility --out ./solubility")),
    }
}

// ── Login ───────────────────────────────────────────────────────────

pub fn cmd_login(settings: HubSettings, overwrite: bool, no_browser: bool) -> Result<(), CliError> {
    let hub_url = settings.hub_url.clone();
    let client = client(settings)?;
    client.login(overwrite, !no_browser)?;
    eprintln!("Logged in to {}", hub_url);
    Ok(())
}

pub fn cmd_logout(settings: HubSettings) -> Result<(), CliError> {
    client(settings)?.logout()?;
    eprintln!("Logged out");
    Ok(())
}

// ── Listing ─────────────────────────────────────────────────────────

pub fn cmd_list(
    settings: HubSettings,
    listing: Listing,
    limit: usize,
    offset: usize,
    json: bool,
) -> Result<(), CliError> {
    let client = client(settings)?;
    let ids = match listing {
        Listing::Datasets => client.list_datasets(limit, offset)?,
        Listing::Benchmarks => client.list_benchmarks(limit, offset)?,
    };

    if json {
        let out = serde_json::to_string(&ids)
            .map_err(|e| CliError { code: crate::exit_codes::EXIT_ERROR, message: e.to_string(), hint: None })?;
        println!("{}", out);
    } else {
        for id in &ids {
            println!("{}", id);
        }
    }
    Ok(())
}

// ── Pull ────────────────────────────────────────────────────────────

pub fn cmd_pull(
    settings: HubSettings,
    reference: String,
    out: PathBuf,
    verify: ChecksumStrategy,
    if_exists: ConflictPolicy,
) -> Result<(), CliError> {
    let (owner, name) = parse_reference(&reference)?;
    let client = client(settings)?;

    eprint!("Fetching {}/{}... ", owner, name);
    let dataset = client.get_dataset(owner, name, verify)?;
    eprintln!("{} table bytes", dataset.table.len());

    dataset.save_dir(&out)?;

    if dataset.uses_array_content() {
        eprint!("Copying {} array objects... ", dataset.array_manifest.len());
        let mut dest = DirectoryStore::new(out.join(ARRAY_ROOT));
        let report = client.download_array_content(&dataset, &mut dest, if_exists, verify)?;
        eprintln!(
            "{} written, {} skipped",
            report.written(),
            report.skipped.len()
        );
    }

    eprintln!("Saved to {}", out.display());
    Ok(())
}

// ── Push ────────────────────────────────────────────────────────────

pub fn cmd_push(
    settings: HubSettings,
    dir: PathBuf,
    owner: Option<String>,
    access: AccessType,
    if_exists: ConflictPolicy,
    timeout: Option<u64>,
) -> Result<(), CliError> {
    if !dir.is_dir() {
        return Err(CliError::args(format!("Not a directory: {}", dir.display())));
    }
    if timeout == Some(0) {
        return Err(CliError::args("--timeout must be greater than zero"));
    }

    let mut dataset = Dataset::load_dir(&dir)?;
    dataset.check_uploadable()?;

    let options = TransferOptions {
        access,
        owner,
        timeout: timeout.map(Duration::from_secs),
        if_exists,
        ..TransferOptions::default()
    };

    let client = client(settings)?;
    let receipt = client.upload_dataset(&mut dataset, &options)?;

    eprintln!(
        "Uploaded {} ({})",
        receipt.artifact_id,
        dataset.md5sum.as_deref().unwrap_or("no checksum")
    );
    println!("{}", receipt.url);
    Ok(())
}
