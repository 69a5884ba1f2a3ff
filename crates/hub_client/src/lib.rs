//! Polaris Hub client: federated login, artifact transfer, chunked array sync.
//!
//! Everything here is synchronous and single-threaded. Configuration comes in
//! as an explicit [`polaris_config::HubSettings`]; nothing is read from
//! ambient global state.

mod artifact;
mod bridge;
mod checksum;
mod client;
mod error;
mod identity;
mod session;
mod store;
mod token;

#[cfg(test)]
mod testing;

pub use artifact::{
    slugify, AccessType, ArrayContent, ArtifactMetadata, Benchmark, BenchmarkKind, BenchmarkResults,
    Dataset, HubOwner, License, UploadReceipt, ARRAY_ROOT, DATASET_FILE, SUPPORTED_LICENSES,
    TABLE_CONTENT_TYPE, TABLE_FILE,
};
pub use bridge::{HubArrayStore, OpenMode};
pub use checksum::{
    dataset_checksum, md5_hex, ChecksumManifest, ChecksumStrategy, ChecksumVerifier, Checksummed,
    ManifestEntry,
};
pub use client::{HubClient, TransferOptions};
pub use error::HubError;
pub use identity::{BrowserLogin, IdentitySession, LoginFlow, TokenProvider};
pub use session::{
    HubSession, HubTokenSource, RequestOptions, SignedLocation, TimeoutOverride, ACCESS_TOKEN_TYPE,
    JWT_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT,
};
pub use store::{
    consolidate_metadata, copy_store, parse_consolidated, ArrayStore, ConflictPolicy, CopyReport,
    DirectoryStore, MemoryStore, CONSOLIDATED_METADATA_KEY,
};
pub use token::{FileTokenCache, HubToken, IdentityToken, MemoryTokenCache, Token, TokenCache};
