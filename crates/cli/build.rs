//! Build metadata for `polaris --version`.
//!
//! POLARIS_BUILD_REVISION  source revision; taken from the environment when
//!                         packaging from a tarball, else from `git describe`
//! POLARIS_BUILD_TARGET    target triple the binary was built for
//! POLARIS_BUILD_PROFILE   cargo profile (debug / release)

use std::env;
use std::path::PathBuf;
use std::process::Command;

const REVISION_VAR: &str = "POLARIS_BUILD_REVISION";

fn main() {
    println!("cargo:rerun-if-env-changed={}", REVISION_VAR);

    let revision = match env::var(REVISION_VAR) {
        Ok(rev) if !rev.trim().is_empty() => rev.trim().to_string(),
        _ => git_revision().unwrap_or_else(|| "unreleased".to_string()),
    };

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env={}={}", REVISION_VAR, revision);
    println!("cargo:rustc-env=POLARIS_BUILD_TARGET={}", target);
    println!("cargo:rustc-env=POLARIS_BUILD_PROFILE={}", profile);
}

/// `git describe` of the workspace checkout, marking uncommitted changes.
fn git_revision() -> Option<String> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    let workspace = manifest_dir.parent()?.parent()?;

    let git_dir = workspace.join(".git");
    if git_dir.is_dir() {
        println!("cargo:rerun-if-changed={}", git_dir.join("HEAD").display());
        println!("cargo:rerun-if-changed={}", git_dir.join("index").display());
    }

    let output = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let rev = String::from_utf8(output.stdout).ok()?;
    let rev = rev.trim();
    (!rev.is_empty()).then(|| rev.to_string())
}
