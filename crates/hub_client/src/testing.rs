//! Shared fixtures for unit tests that talk to an `httpmock` server.

use std::rc::Rc;

use chrono::Utc;
use httpmock::MockServer;
use polars::prelude::*;
use polaris_config::{HubSettings, IdentitySettings};

use crate::error::HubError;
use crate::identity::{IdentitySession, LoginFlow};
use crate::session::{HubSession, HubTokenSource};
use crate::token::{MemoryTokenCache, Token, TokenCache};

pub struct NoLogin;

impl LoginFlow for NoLogin {
    fn authorize(
        &self,
        _http: &reqwest::blocking::Client,
        _identity: &IdentitySettings,
        _auto_open_browser: bool,
    ) -> Result<Token, HubError> {
        Err(HubError::Authentication("interactive login disabled in tests".into()))
    }
}

pub fn settings_for(server: &MockServer) -> HubSettings {
    let mut settings = HubSettings::default();
    settings.api_url = server.url("/api/");
    settings.hub_url = server.url("/");
    settings.hub_token_url = server.url("/auth/token");
    settings.identity.token_url = server.url("/oauth/token");
    settings
}

pub fn token_in(secs: i64, value: &str, refresh: Option<&str>) -> Token {
    let mut token = Token::new(value, Some(Utc::now() + chrono::Duration::seconds(secs)));
    token.refresh_token = refresh.map(String::from);
    token
}

pub fn session_with(settings: HubSettings, identity: Option<Token>, hub: Option<Token>) -> HubSession {
    let cache = MemoryTokenCache::new();
    if let Some(t) = identity {
        cache
            .store(&IdentitySession::cache_key_for(&settings.identity), &t)
            .unwrap();
    }
    if let Some(t) = hub {
        cache.store(&HubTokenSource::cache_key_for(&settings), &t).unwrap();
    }
    HubSession::with_parts(settings, Rc::new(cache), Box::new(NoLogin)).unwrap()
}

/// Session holding a valid hub token `hub-token`.
pub fn authed_session(server: &MockServer) -> HubSession {
    session_with(settings_for(server), None, Some(token_in(3600, "hub-token", None)))
}

/// A small three-row Parquet table.
pub fn parquet_table() -> Vec<u8> {
    let mut df = df!(
        "smiles" => ["C", "CC", "CCO"],
        "logS" => [0.5, -0.2, 1.1]
    )
    .unwrap();
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf).finish(&mut df).unwrap();
    buf
}
