//! OAuth tokens and the token cache port.
//!
//! Both the identity token and the hub token are plain OAuth2 bearer tokens;
//! they differ only in who issued them and how they get renewed.
//! Cached tokens live in `<cache_dir>/polaris/token-<blake3(key)>.json` (0600 on Unix).
//! The file is not locked: two processes refreshing at once can race.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Credential issued by the identity provider.
pub type IdentityToken = Token;
/// Hub-scoped credential derived from an identity token by token exchange.
pub type HubToken = Token;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// None = the issuer did not say; treated as non-expiring
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Token {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_at,
            refresh_token: None,
            scope: None,
        }
    }

    /// Usable for at least `leeway` more.
    pub fn is_active(&self, leeway: Duration) -> bool {
        self.is_active_at(Utc::now(), leeway)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expires_at {
            None => true,
            Some(expires_at) => {
                let leeway = chrono::Duration::from_std(leeway).unwrap_or(chrono::Duration::zero());
                expires_at
                    .checked_sub_signed(leeway)
                    .is_some_and(|deadline| deadline > now)
            }
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Successful response body of an OAuth2 token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Absolute expiry from `expires_at` (unix seconds) or `expires_in` relative to `now`.
/// A value chrono cannot represent is an error, never "no expiry".
fn expiry_from(
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    match (expires_at, expires_in) {
        (Some(ts), _) => DateTime::<Utc>::from_timestamp(ts, 0)
            .map(Some)
            .ok_or_else(|| format!("expires_at {} is out of range", ts)),
        (None, Some(secs)) => chrono::Duration::try_seconds(secs)
            .and_then(|d| now.checked_add_signed(d))
            .map(Some)
            .ok_or_else(|| format!("expires_in {} is out of range", secs)),
        (None, None) => Ok(None),
    }
}

/// Turn a token endpoint response into a [`Token`].
///
/// Non-200 answers become `Authentication` errors using the RFC 6749
/// `error_description` / `error` fields when present. `previous_refresh`
/// is kept when a refresh response does not rotate the refresh token.
pub(crate) fn parse_token_response(
    resp: reqwest::blocking::Response,
    what: &str,
    previous_refresh: Option<&str>,
) -> Result<Token, HubError> {
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let body: serde_json::Value = resp.json().unwrap_or(serde_json::Value::Null);
        let msg = body["error_description"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .unwrap_or("unknown error");
        return Err(HubError::Authentication(format!(
            "{} failed ({}): {}",
            what, status, msg
        )));
    }

    let body: TokenResponse = resp
        .json()
        .map_err(|e| HubError::Authentication(format!("{} response invalid: {}", what, e)))?;

    if body.access_token.is_empty() {
        return Err(HubError::Authentication(format!(
            "{} response missing access_token",
            what
        )));
    }

    let expires_at = expiry_from(body.expires_at, body.expires_in, Utc::now())
        .map_err(|reason| HubError::Authentication(format!("{} returned an invalid expiry: {}", what, reason)))?;

    Ok(Token {
        access_token: body.access_token,
        token_type: body.token_type.unwrap_or_else(default_token_type),
        expires_at,
        refresh_token: body
            .refresh_token
            .or_else(|| previous_refresh.map(String::from)),
        scope: body.scope,
    })
}

/// Storage port for tokens. Injected into the identity and hub sessions.
pub trait TokenCache {
    fn load(&self, key: &str) -> Option<Token>;
    fn store(&self, key: &str, token: &Token) -> Result<(), HubError>;
    fn clear(&self, key: &str) -> Result<(), HubError>;
}

/// One JSON file per cache key.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    dir: PathBuf,
}

impl FileTokenCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes()).to_hex();
        self.dir.join(format!("token-{}.json", &digest[..16]))
    }
}

impl TokenCache for FileTokenCache {
    /// Returns None if nothing is cached or the file is invalid.
    fn load(&self, key: &str) -> Option<Token> {
        let contents = std::fs::read_to_string(self.path_for(key)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn store(&self, key: &str, token: &Token) -> Result<(), HubError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);

        let contents = serde_json::to_string_pretty(token)
            .map_err(|e| HubError::Parse(format!("failed to serialize token: {}", e)))?;
        std::fs::write(&path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), HubError> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Process-local cache; nothing touches disk.
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    tokens: RefCell<HashMap<String, Token>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(key: &str, token: Token) -> Self {
        let cache = Self::default();
        cache.tokens.borrow_mut().insert(key.to_string(), token);
        cache
    }
}

impl TokenCache for MemoryTokenCache {
    fn load(&self, key: &str) -> Option<Token> {
        self.tokens.borrow().get(key).cloned()
    }

    fn store(&self, key: &str, token: &Token) -> Result<(), HubError> {
        self.tokens.borrow_mut().insert(key.to_string(), token.clone());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), HubError> {
        self.tokens.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expiring_in(secs: i64) -> Token {
        Token::new("tok", Some(Utc::now() + chrono::Duration::seconds(secs)))
    }

    #[test]
    fn test_token_activity_respects_leeway() {
        let leeway = Duration::from_secs(60);
        assert!(expiring_in(3600).is_active(leeway));
        assert!(!expiring_in(10).is_active(leeway));
        assert!(!expiring_in(-5).is_active(Duration::ZERO));
        assert!(Token::new("tok", None).is_active(leeway));
        assert!(!Token::new("", None).is_active(leeway));
    }

    #[test]
    fn test_expiry_from_relative_and_absolute() {
        let now = Utc::now();
        let rel = expiry_from(None, Some(3600), now).unwrap().unwrap();
        assert_eq!((rel - now).num_seconds(), 3600);

        let abs = expiry_from(Some(1_700_000_000), Some(10), now).unwrap().unwrap();
        assert_eq!(abs.timestamp(), 1_700_000_000);

        assert_eq!(expiry_from(None, None, now).unwrap(), None);
    }

    #[test]
    fn test_unrepresentable_expiry_is_rejected() {
        let now = Utc::now();
        let err = expiry_from(None, Some(10_000_000_000_000), now).unwrap_err();
        assert!(err.contains("expires_in"), "{}", err);
        assert!(expiry_from(None, Some(i64::MAX), now).is_err());
        assert!(expiry_from(None, Some(i64::MIN), now).is_err());

        let err = expiry_from(Some(i64::MAX), None, now).unwrap_err();
        assert!(err.contains("expires_at"), "{}", err);
    }

    #[test]
    fn test_can_refresh() {
        let mut token = expiring_in(10);
        assert!(!token.can_refresh());
        token.refresh_token = Some(String::new());
        assert!(!token.can_refresh());
        token.refresh_token = Some("rt".into());
        assert!(token.can_refresh());
    }

    #[test]
    fn test_token_missing_optional_fields() {
        let json = r#"{"access_token":"tok"}"#;
        let parsed: Token = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "tok");
        assert_eq!(parsed.token_type, "Bearer");
        assert!(parsed.expires_at.is_none());
        assert!(parsed.refresh_token.is_none());
    }

    #[test]
    fn test_file_cache_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileTokenCache::new(dir.path().join("polaris"));
        let key = "hub:https://polarishub.io/api/auth/token|polarishub.io";

        assert!(cache.load(key).is_none());

        let mut token = expiring_in(3600);
        token.refresh_token = Some("rt".into());
        cache.store(key, &token).unwrap();

        let loaded = cache.load(key).unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert_eq!(loaded.refresh_token.as_deref(), Some("rt"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cache.path_for(key)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        cache.clear(key).unwrap();
        assert!(cache.load(key).is_none());
        cache.clear(key).unwrap();
    }

    #[test]
    fn test_file_cache_keys_do_not_collide() {
        let cache = FileTokenCache::new("/tmp/polaris-cache");
        assert_ne!(cache.path_for("identity:a"), cache.path_for("hub:a"));
    }

    #[test]
    fn test_file_cache_ignores_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileTokenCache::new(dir.path());
        std::fs::write(cache.path_for("k"), "not json").unwrap();
        assert!(cache.load("k").is_none());
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryTokenCache::with_token("k", expiring_in(100));
        assert!(cache.load("k").is_some());
        cache.clear("k").unwrap();
        assert!(cache.load("k").is_none());
    }
}
