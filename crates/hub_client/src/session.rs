//! Hub session: token exchange, token lifecycle, and the single choke point
//! for outbound requests.
//!
//! Blocking reqwest client (no Tokio runtime required). Redirects are never
//! followed automatically: a 307 from the hub carries a JSON body
//! `{url, method, headers}` naming a signed destination that must be hit
//! without session credentials.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use polaris_config::{CaBundle, HubSettings};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::error::HubError;
use crate::identity::{BrowserLogin, IdentitySession, LoginFlow, TokenProvider};
use crate::token::{parse_token_response, FileTokenCache, HubToken, MemoryTokenCache, Token, TokenCache};

pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
pub const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

const USER_AGENT: &str = concat!("polaris-hub-client/", env!("CARGO_PKG_VERSION"));

// ── Hub token source ────────────────────────────────────────────────

/// Exchanges identity tokens for hub tokens and keeps the hub token fresh.
pub struct HubTokenSource {
    http: Client,
    token_url: String,
    cache_key: String,
    leeway: Duration,
    identity: IdentitySession,
    cache: Rc<dyn TokenCache>,
    token: Option<HubToken>,
}

impl HubTokenSource {
    pub fn new(
        http: Client,
        settings: &HubSettings,
        identity: IdentitySession,
        cache: Rc<dyn TokenCache>,
    ) -> Self {
        let cache_key = Self::cache_key_for(settings);
        let token = cache.load(&cache_key);
        Self {
            http,
            token_url: settings.hub_token_url.clone(),
            cache_key,
            leeway: settings.token_refresh_leeway(),
            identity,
            cache,
            token,
        }
    }

    pub fn cache_key_for(settings: &HubSettings) -> String {
        format!("hub:{}|{}", settings.hub_token_url, settings.identity.audience)
    }

    pub fn identity(&self) -> &IdentitySession {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut IdentitySession {
        &mut self.identity
    }

    /// Token exchange (RFC 8693): identity token in, signed hub token out.
    pub fn fetch(&mut self) -> Result<HubToken, HubError> {
        if !self.identity.ensure_active() {
            return Err(HubError::Authentication(
                "no active identity token; log in to the hub first".into(),
            ));
        }
        let subject = self
            .identity
            .token()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| HubError::Authentication("no identity token".into()))?;

        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT),
                ("subject_token", subject.as_str()),
                ("subject_token_type", ACCESS_TOKEN_TYPE),
                ("requested_token_type", JWT_TOKEN_TYPE),
            ])
            .send()
            .map_err(HubError::from_transport)?;

        let token = parse_token_response(resp, "hub token exchange", None)?;
        self.cache.store(&self.cache_key, &token)?;
        log::debug!("exchanged identity token for a hub token");
        self.token = Some(token.clone());
        Ok(token)
    }

    pub fn logout(&mut self) -> Result<(), HubError> {
        self.token = None;
        self.cache.clear(&self.cache_key)?;
        self.identity.logout()
    }
}

impl TokenProvider for HubTokenSource {
    fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    fn obtain(&mut self) -> Result<Token, HubError> {
        if let Some(token) = self.token.as_ref().filter(|t| t.is_active(self.leeway)) {
            return Ok(token.clone());
        }
        self.fetch()
    }

    fn ensure_active(&mut self) -> bool {
        if self.token.as_ref().is_some_and(|t| t.is_active(self.leeway)) {
            return true;
        }
        // A hub token cannot outlive the identity it was derived from
        if !self.identity.ensure_active() {
            return false;
        }
        match self.fetch() {
            Ok(_) => true,
            Err(e) => {
                log::warn!("hub token re-fetch failed: {}", e);
                false
            }
        }
    }

    fn refresh(&mut self) -> Result<Token, HubError> {
        self.fetch()
    }
}

// ── Request options ─────────────────────────────────────────────────

/// Per-request knobs for [`HubSession::request`].
#[derive(Debug, Default, Clone)]
pub struct RequestOptions {
    json: Option<serde_json::Value>,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    withhold_token: bool,
    timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Do not attach the hub token (signed URLs are self-authorizing).
    pub fn without_token(mut self) -> Self {
        self.withhold_token = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn apply(self, mut req: RequestBuilder) -> RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !self.query.is_empty() {
            req = req.query(&self.query);
        }
        if let Some(json) = &self.json {
            req = req.json(json);
        } else if let Some(body) = self.body {
            req = req.body(body);
        }
        req
    }
}

/// Body of a hub 307: where to re-issue the request.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedLocation {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SignedLocation {
    fn method_or(&self, default: Method) -> Result<Method, HubError> {
        match &self.method {
            None => Ok(default),
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| HubError::Parse(format!("invalid redirect method '{}'", m))),
        }
    }
}

// ── Hub session ─────────────────────────────────────────────────────

pub struct HubSession {
    settings: HubSettings,
    http: Client,
    auth: RefCell<HubTokenSource>,
    timeout: Cell<Duration>,
}

impl HubSession {
    /// Session with the on-disk token cache and browser login.
    pub fn new(settings: HubSettings) -> Result<Self, HubError> {
        let cache: Rc<dyn TokenCache> = if settings.cache_auth_token {
            Rc::new(FileTokenCache::new(settings.token_cache_dir()))
        } else {
            Rc::new(MemoryTokenCache::new())
        };
        let login = Box::new(BrowserLogin {
            allow_headless: settings.allow_headless_login,
        });
        Self::with_parts(settings, cache, login)
    }

    /// Session with an injected token cache and login flow.
    pub fn with_parts(
        settings: HubSettings,
        cache: Rc<dyn TokenCache>,
        login: Box<dyn LoginFlow>,
    ) -> Result<Self, HubError> {
        let http = build_http_client(&settings)?;
        let identity = IdentitySession::new(
            http.clone(),
            settings.identity.clone(),
            settings.token_refresh_leeway(),
            login,
            cache.clone(),
        );
        let auth = HubTokenSource::new(http.clone(), &settings, identity, cache);
        let timeout = settings.default_timeout();
        Ok(Self {
            settings,
            http,
            auth: RefCell::new(auth),
            timeout: Cell::new(timeout),
        })
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Timeout applied to requests that do not set their own.
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    // ── Auth ────────────────────────────────────────────────────────

    pub fn fetch_hub_token(&self) -> Result<HubToken, HubError> {
        self.auth.borrow_mut().fetch()
    }

    /// True if the hub token is usable, silently re-fetching it while the
    /// identity token is still active. False means the caller must log in.
    pub fn ensure_active_token(&self) -> bool {
        self.auth.borrow_mut().ensure_active()
    }

    /// Interactive (re-)authentication, skipped when a valid token exists and `overwrite` is false.
    pub fn login(&self, overwrite: bool, auto_open_browser: bool) -> Result<(), HubError> {
        let mut auth = self.auth.borrow_mut();
        if overwrite || !auth.ensure_active() {
            auth.identity_mut()
                .interactive_login(overwrite, auto_open_browser)?;
            auth.fetch()?;
        }
        log::info!("You are successfully logged in to the Polaris Hub.");
        Ok(())
    }

    pub fn logout(&self) -> Result<(), HubError> {
        self.auth.borrow_mut().logout()
    }

    fn access_token(&self) -> Result<String, HubError> {
        let token = self.auth.borrow_mut().obtain()?;
        Ok(token.access_token)
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Resolve a path against the API root; absolute URLs pass through.
    pub fn resolve_url(&self, url: &str) -> Result<url::Url, HubError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url::Url::parse(url)
                .map_err(|e| HubError::Parse(format!("invalid URL '{}': {}", url, e)));
        }
        join_url(&self.settings.api_url, url)
    }

    /// Browsable hub location for `path` (e.g. `datasets/owner/name`).
    pub fn hub_link(&self, path: &str) -> Result<String, HubError> {
        join_url(&self.settings.hub_url, path).map(String::from)
    }

    /// Every outbound call goes through here.
    ///
    /// Transport certificate failures become `Certificate`, token problems
    /// and HTTP 401 become `Authentication`. Other statuses are returned to
    /// the caller untouched.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<Response, HubError> {
        let url = self.resolve_url(url)?;
        let timeout = opts.timeout.unwrap_or_else(|| self.timeout.get());

        let mut req = self.http.request(method.clone(), url.clone()).timeout(timeout);
        if !opts.withhold_token {
            req = req.bearer_auth(self.access_token()?);
        }
        let req = opts.apply(req);

        let resp = req.send().map_err(HubError::from_transport)?;
        log::debug!("{} {} -> {}", method, url, resp.status());

        if resp.status() == StatusCode::UNAUTHORIZED {
            let body = resp.text().unwrap_or_default();
            return Err(HubError::Authentication(format!(
                "the hub rejected the credentials for {} {}: {}",
                method,
                url.path(),
                body.trim()
            )));
        }
        Ok(resp)
    }

    /// Request that must succeed; the body is parsed as JSON when possible.
    pub fn hub_json(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<serde_json::Value, HubError> {
        let resp = check_hub_response(self.request(method, url, opts)?)?;
        let text = resp
            .text()
            .map_err(|e| HubError::Network(format!("failed to read response body: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Fetch from a signed location. Hub credentials are withheld.
    pub fn download_signed(&self, location: &SignedLocation) -> Result<Vec<u8>, HubError> {
        let mut opts = RequestOptions::new().without_token();
        for (k, v) in &location.headers {
            opts = opts.header(k.clone(), v.clone());
        }
        let resp = self.request(location.method_or(Method::GET)?, &location.url, opts)?;
        let resp = error_for_status(resp)?;
        let bytes = resp
            .bytes()
            .map_err(|e| HubError::Network(format!("failed to read signed content: {}", e)))?;
        Ok(bytes.to_vec())
    }

    /// Empty PUT to the hub; when it answers 307, PUT `content` to the signed
    /// destination it names. Without a redirect the first PUT must have succeeded.
    pub fn put_through_redirect(
        &self,
        url: &str,
        content_type: &str,
        content: Vec<u8>,
    ) -> Result<(), HubError> {
        let resp = self.request(
            Method::PUT,
            url,
            RequestOptions::new().header("Content-Type", content_type),
        )?;

        if resp.status() != StatusCode::TEMPORARY_REDIRECT {
            check_hub_response(resp)?;
            return Ok(());
        }

        let location = signed_location(resp)?;
        let mut opts = RequestOptions::new()
            .without_token()
            .header("Content-Type", content_type);
        for (k, v) in &location.headers {
            opts = opts.header(k.clone(), v.clone());
        }
        let resp = self.request(location.method_or(Method::PUT)?, &location.url, opts.body(content))?;
        error_for_status(resp)?;
        Ok(())
    }

    /// Custom metadata header stored alongside an object.
    pub fn get_metadata_from_response(&self, response: &Response, key: &str) -> Option<String> {
        let name = format!("{}{}", self.settings.custom_metadata_prefix, key);
        response
            .headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    // ── Scoped overrides ────────────────────────────────────────────

    /// Widen (or narrow) the default timeout until the guard is dropped.
    #[must_use]
    pub fn override_timeout(&self, timeout: Duration) -> TimeoutOverride<'_> {
        let previous = self.timeout.replace(timeout);
        TimeoutOverride {
            session: self,
            previous,
        }
    }

    /// Run `f` with a different default timeout; restored on every exit path.
    pub fn with_timeout<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&Self) -> Result<T, HubError>,
    ) -> Result<T, HubError> {
        let _guard = self.override_timeout(timeout);
        f(self)
    }
}

/// RAII guard restoring the session timeout, including on error or panic.
#[derive(Debug)]
pub struct TimeoutOverride<'a> {
    session: &'a HubSession,
    previous: Duration,
}

impl Drop for TimeoutOverride<'_> {
    fn drop(&mut self) {
        self.session.timeout.set(self.previous);
    }
}

impl std::fmt::Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession")
            .field("api_url", &self.settings.api_url)
            .field("timeout", &self.timeout.get())
            .finish_non_exhaustive()
    }
}

// ── Free functions ──────────────────────────────────────────────────

fn build_http_client(settings: &HubSettings) -> Result<Client, HubError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(settings.default_timeout())
        .redirect(reqwest::redirect::Policy::none());

    match &settings.ca_bundle {
        CaBundle::System => {}
        CaBundle::File(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                HubError::Configuration(format!("cannot read CA bundle {}: {}", path.display(), e))
            })?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
                HubError::Configuration(format!("invalid CA bundle {}: {}", path.display(), e))
            })?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        CaBundle::Disabled => {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder
        .build()
        .map_err(|e| HubError::Configuration(format!("failed to build HTTP client: {}", e)))
}

fn join_url(base: &str, path: &str) -> Result<url::Url, HubError> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    url::Url::parse(&base)
        .and_then(|b| b.join(path.trim_start_matches('/')))
        .map_err(|e| HubError::Configuration(format!("cannot build URL from '{}' + '{}': {}", base, path, e)))
}

/// Map a non-success hub response into the error model.
///
/// A 500 is never assumed to carry the hub's structured error body and is
/// passed through raw. Other statuses with a JSON body become `HubRequest`.
pub(crate) fn check_hub_response(resp: Response) -> Result<Response, HubError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let body = resp.text().unwrap_or_default();
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        return Err(HubError::Status { status: code, body });
    }
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(payload) if payload.is_object() || payload.is_array() => {
            Err(HubError::HubRequest { status: code, payload })
        }
        _ => Err(HubError::Status { status: code, body }),
    }
}

/// Plain status check for storage backends (signed URLs).
fn error_for_status(resp: Response) -> Result<Response, HubError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().unwrap_or_default();
    Err(HubError::Status { status, body })
}

/// Parse the `{url, method, headers}` body of a hub 307.
pub(crate) fn signed_location(resp: Response) -> Result<SignedLocation, HubError> {
    resp.json::<SignedLocation>()
        .map_err(|e| HubError::Parse(format!("invalid signed URL response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_with, settings_for, token_in, NoLogin};
    use httpmock::prelude::*;

    #[test]
    fn test_token_exchange_request() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_includes("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange")
                .body_includes("subject_token=id-token")
                .body_includes("requested_token_type=urn%3Aietf%3Aparams%3Aoauth%3Atoken-type%3Ajwt");
            then.status(200).json_body(serde_json::json!({
                "access_token": "hub-token",
                "token_type": "Bearer",
                "expires_in": 3600
            }));
        });

        let session = session_with(settings_for(&server), Some(token_in(3600, "id-token", None)), None);
        let token = session.fetch_hub_token().unwrap();
        exchange.assert();
        assert_eq!(token.access_token, "hub-token");
    }

    #[test]
    fn test_exchange_with_out_of_range_expiry_is_authentication_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "h",
                "expires_in": 10_000_000_000_000_i64
            }));
        });

        let session = session_with(settings_for(&server), Some(token_in(3600, "id-token", None)), None);
        let err = session.fetch_hub_token().unwrap_err();
        assert!(err.is_authentication(), "got {:?}", err);
        assert!(err.to_string().contains("invalid expiry"));
    }

    #[test]
    fn test_exchange_requires_active_identity() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(200);
        });

        let session = session_with(settings_for(&server), None, None);
        let err = session.fetch_hub_token().unwrap_err();
        assert!(err.is_authentication());
        exchange.assert_calls(0);
    }

    #[test]
    fn test_exchange_rejection_is_authentication_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(400).json_body(serde_json::json!({
                "error": "invalid_request",
                "error_description": "subject token expired"
            }));
        });

        let session = session_with(settings_for(&server), Some(token_in(3600, "id-token", None)), None);
        let err = session.fetch_hub_token().unwrap_err();
        assert!(err.is_authentication());
        assert!(err.to_string().contains("subject token expired"));
    }

    #[test]
    fn test_ensure_active_token_refetches_while_identity_active() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "hub-token-2",
                "expires_in": 3600
            }));
        });

        let session = session_with(
            settings_for(&server),
            Some(token_in(3600, "id-token", None)),
            Some(token_in(-10, "hub-token-1", None)),
        );
        assert!(session.ensure_active_token());
        exchange.assert();
    }

    #[test]
    fn test_ensure_active_token_false_when_identity_expiring_without_refresh() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(200);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200);
        });

        let session = session_with(
            settings_for(&server),
            Some(token_in(10, "id-token", None)),
            Some(token_in(-10, "hub-token", None)),
        );
        assert!(!session.ensure_active_token());
        exchange.assert_calls(0);
        refresh.assert_calls(0);
    }

    #[test]
    fn test_request_attaches_bearer_and_translates_401() {
        let server = MockServer::start();
        let ok = server.mock(|when, then| {
            when.method(GET)
                .path("/api/dataset")
                .header("Authorization", "Bearer hub-token");
            then.status(200).json_body(serde_json::json!({"data": []}));
        });
        let denied = server.mock(|when, then| {
            when.method(GET).path("/api/benchmark");
            then.status(401).json_body(serde_json::json!({"message": "token revoked"}));
        });

        let session = session_with(
            settings_for(&server),
            Some(token_in(3600, "id-token", None)),
            Some(token_in(3600, "hub-token", None)),
        );

        let body = session.hub_json(Method::GET, "/dataset", RequestOptions::new()).unwrap();
        assert_eq!(body, serde_json::json!({"data": []}));
        ok.assert();

        let err = session
            .hub_json(Method::GET, "/benchmark", RequestOptions::new())
            .unwrap_err();
        assert!(err.is_authentication(), "401 must be an auth error, got {:?}", err);
        denied.assert();
    }

    #[test]
    fn test_structured_error_wrapped_but_500_passed_through() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/dataset/acme/missing");
            then.status(404).json_body(serde_json::json!({"detail": "not found"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/dataset/acme/broken");
            then.status(500).json_body(serde_json::json!({"detail": "looks like json"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/dataset/acme/gateway");
            then.status(502).body("<html>bad gateway</html>");
        });

        let session = session_with(
            settings_for(&server),
            None,
            Some(token_in(3600, "hub-token", None)),
        );

        match session.hub_json(Method::GET, "/dataset/acme/missing", RequestOptions::new()) {
            Err(HubError::HubRequest { status, payload }) => {
                assert_eq!(status, 404);
                assert_eq!(payload["detail"], "not found");
            }
            other => panic!("expected HubRequest, got {:?}", other),
        }

        match session.hub_json(Method::GET, "/dataset/acme/broken", RequestOptions::new()) {
            Err(HubError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("looks like json"));
            }
            other => panic!("expected raw Status, got {:?}", other),
        }

        match session.hub_json(Method::GET, "/dataset/acme/gateway", RequestOptions::new()) {
            Err(HubError::Status { status, .. }) => assert_eq!(status, 502),
            other => panic!("expected raw Status, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_tokens_fail_before_request() {
        let server = MockServer::start();
        let endpoint = server.mock(|when, then| {
            when.method(GET).path("/api/dataset");
            then.status(200);
        });

        let session = session_with(settings_for(&server), None, None);
        let err = session.request(Method::GET, "/dataset", RequestOptions::new()).unwrap_err();
        assert!(err.is_authentication());
        endpoint.assert_calls(0);
    }

    #[test]
    fn test_put_through_redirect_withholds_credentials() {
        let server = MockServer::start();
        let announce = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/storage/table")
                .header("Authorization", "Bearer hub-token");
            then.status(307).json_body(serde_json::json!({
                "url": server.url("/bucket/table.parquet?sig=abc"),
                "method": "PUT",
                "headers": {"x-amz-meta-md5sum": "d41d8cd98f00b204e9800998ecf8427e"}
            }));
        });
        let bucket = server.mock(|when, then| {
            when.method(PUT)
                .path("/bucket/table.parquet")
                .query_param("sig", "abc")
                .header("x-amz-meta-md5sum", "d41d8cd98f00b204e9800998ecf8427e")
                .header_missing("Authorization")
                .body("PAR1data");
            then.status(200);
        });

        let session = session_with(
            settings_for(&server),
            None,
            Some(token_in(3600, "hub-token", None)),
        );
        session
            .put_through_redirect("/storage/table", "application/vnd.apache.parquet", b"PAR1data".to_vec())
            .unwrap();
        announce.assert();
        bucket.assert();
    }

    #[test]
    fn test_put_without_redirect_must_succeed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/api/storage/table");
            then.status(403).json_body(serde_json::json!({"detail": "forbidden"}));
        });

        let session = session_with(
            settings_for(&server),
            None,
            Some(token_in(3600, "hub-token", None)),
        );
        let err = session
            .put_through_redirect("/storage/table", "application/octet-stream", vec![1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, HubError::HubRequest { status: 403, .. }), "{:?}", err);
    }

    #[test]
    fn test_metadata_header_uses_prefix() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/bucket/object");
            then.status(200)
                .header("x-amz-meta-md5sum", "abc123")
                .body("x");
        });

        let session = session_with(settings_for(&server), None, None);
        let resp = session
            .request(Method::GET, &server.url("/bucket/object"), RequestOptions::new().without_token())
            .unwrap();
        assert_eq!(session.get_metadata_from_response(&resp, "md5sum").as_deref(), Some("abc123"));
        assert!(session.get_metadata_from_response(&resp, "owner").is_none());
    }

    #[test]
    fn test_timeout_override_restored_on_error() {
        let session = session_with(HubSettings::default(), None, None);
        let default = session.timeout();

        let result: Result<(), HubError> = session.with_timeout(Duration::from_secs(900), |s| {
            assert_eq!(s.timeout(), Duration::from_secs(900));
            Err(HubError::Network("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(session.timeout(), default);

        {
            let _guard = session.override_timeout(Duration::from_secs(5));
            assert_eq!(session.timeout(), Duration::from_secs(5));
        }
        assert_eq!(session.timeout(), default);
    }

    #[test]
    fn test_resolve_url() {
        let session = session_with(HubSettings::default(), None, None);
        assert_eq!(
            session.resolve_url("/dataset/acme/solubility").unwrap().as_str(),
            "https://api.polarishub.io/dataset/acme/solubility"
        );
        assert_eq!(
            session.resolve_url("https://bucket.example.com/x?sig=1").unwrap().as_str(),
            "https://bucket.example.com/x?sig=1"
        );
        assert_eq!(
            session.hub_link("datasets/acme/solubility").unwrap(),
            "https://polarishub.io/datasets/acme/solubility"
        );
    }

    #[test]
    fn test_missing_ca_bundle_is_configuration_error() {
        let mut settings = HubSettings::default();
        settings.ca_bundle = CaBundle::File("/nonexistent/ca.pem".into());
        let err = HubSession::with_parts(settings, Rc::new(MemoryTokenCache::new()), Box::new(NoLogin))
            .unwrap_err();
        assert!(matches!(err, HubError::Configuration(_)));
    }
}
