//! Identity session: the externally issued token that gets exchanged for a hub token.
//!
//! Login is an OAuth2 authorization-code flow with PKCE. The user finishes it
//! in a browser and pastes the code back into the terminal.

use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

use base64::Engine;
use polaris_config::IdentitySettings;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::HubError;
use crate::token::{parse_token_response, IdentityToken, Token, TokenCache};

/// Capability shared by the identity and hub sessions.
///
/// Implementations are independent; the hub side composes an identity
/// provider instead of inheriting from it.
pub trait TokenProvider {
    /// The current token, active or not.
    fn token(&self) -> Option<&Token>;

    /// Returns an active token, acquiring a new one if needed.
    fn obtain(&mut self) -> Result<Token, HubError>;

    /// Whether the current token is usable. Refreshes in place when possible;
    /// false only when there is no token or no way to renew it.
    fn ensure_active(&mut self) -> bool;

    /// Renew the current token.
    fn refresh(&mut self) -> Result<Token, HubError>;
}

/// Interactive acquisition of a fresh identity token.
pub trait LoginFlow {
    fn authorize(
        &self,
        http: &reqwest::blocking::Client,
        identity: &IdentitySettings,
        auto_open_browser: bool,
    ) -> Result<IdentityToken, HubError>;
}

/// Authorization-code + PKCE login through the system browser.
#[derive(Debug, Clone)]
pub struct BrowserLogin {
    /// Print the URL instead of failing when the browser cannot be opened
    pub allow_headless: bool,
}

impl LoginFlow for BrowserLogin {
    fn authorize(
        &self,
        http: &reqwest::blocking::Client,
        identity: &IdentitySettings,
        auto_open_browser: bool,
    ) -> Result<IdentityToken, HubError> {
        let verifier = random_string(64);
        let state = random_string(24);
        let url = authorization_url(identity, &pkce_challenge(&verifier), &state)?;

        let opened = auto_open_browser && open::that(url.as_str()).is_ok();
        if !opened {
            if auto_open_browser && !self.allow_headless {
                return Err(HubError::Authentication(
                    "could not open a browser to log in, and headless login is disabled".into(),
                ));
            }
            eprintln!("Open the following URL in a browser to log in:\n\n    {}\n", url);
        }

        if !atty::is(atty::Stream::Stdin) {
            return Err(HubError::Authentication(
                "cannot read the authorization code: stdin is not a terminal".into(),
            ));
        }

        eprint!("Authorization code: ");
        io::stderr().flush().ok();
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        let code = buf.trim();
        if code.is_empty() {
            return Err(HubError::Authentication("no authorization code provided".into()));
        }

        exchange_authorization_code(http, identity, code, &verifier)
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// RFC 7636 S256 challenge.
fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

fn authorization_url(
    identity: &IdentitySettings,
    challenge: &str,
    state: &str,
) -> Result<url::Url, HubError> {
    let mut url = url::Url::parse(&identity.authorize_url).map_err(|e| {
        HubError::Configuration(format!(
            "invalid authorize URL '{}': {}",
            identity.authorize_url, e
        ))
    })?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &identity.client_id)
        .append_pair("redirect_uri", &identity.redirect_uri)
        .append_pair("scope", &identity.scopes.join(" "))
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url)
}

fn exchange_authorization_code(
    http: &reqwest::blocking::Client,
    identity: &IdentitySettings,
    code: &str,
    verifier: &str,
) -> Result<IdentityToken, HubError> {
    let resp = http
        .post(&identity.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", identity.redirect_uri.as_str()),
            ("client_id", identity.client_id.as_str()),
            ("code_verifier", verifier),
        ])
        .send()
        .map_err(HubError::from_transport)?;
    parse_token_response(resp, "login", None)
}

/// Holds the identity token and keeps it fresh.
pub struct IdentitySession {
    http: reqwest::blocking::Client,
    identity: IdentitySettings,
    leeway: Duration,
    login: Box<dyn LoginFlow>,
    cache: Rc<dyn TokenCache>,
    token: Option<IdentityToken>,
    auto_open_browser: bool,
}

impl IdentitySession {
    /// Create a session, picking up a previously cached token if there is one.
    pub fn new(
        http: reqwest::blocking::Client,
        identity: IdentitySettings,
        leeway: Duration,
        login: Box<dyn LoginFlow>,
        cache: Rc<dyn TokenCache>,
    ) -> Self {
        let token = cache.load(&Self::cache_key_for(&identity));
        Self {
            http,
            identity,
            leeway,
            login,
            cache,
            token,
            auto_open_browser: true,
        }
    }

    pub fn cache_key_for(identity: &IdentitySettings) -> String {
        format!("identity:{}|{}", identity.token_url, identity.client_id)
    }

    pub fn cache_key(&self) -> String {
        Self::cache_key_for(&self.identity)
    }

    /// Whether `obtain` may open a browser when it has to log in.
    pub fn set_auto_open_browser(&mut self, auto_open_browser: bool) {
        self.auto_open_browser = auto_open_browser;
    }

    /// Run the interactive flow unless an active token exists and `overwrite` is false.
    pub fn interactive_login(
        &mut self,
        overwrite: bool,
        auto_open_browser: bool,
    ) -> Result<IdentityToken, HubError> {
        if !overwrite {
            if let Some(token) = self.token.as_ref().filter(|t| t.is_active(self.leeway)) {
                return Ok(token.clone());
            }
        }

        let token = self
            .login
            .authorize(&self.http, &self.identity, auto_open_browser)?;
        self.cache.store(&self.cache_key(), &token)?;
        self.token = Some(token.clone());
        Ok(token)
    }

    /// Forget the token here and in the cache.
    pub fn logout(&mut self) -> Result<(), HubError> {
        self.token = None;
        self.cache.clear(&self.cache_key())
    }
}

impl TokenProvider for IdentitySession {
    fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    fn obtain(&mut self) -> Result<Token, HubError> {
        if self.ensure_active() {
            if let Some(token) = &self.token {
                return Ok(token.clone());
            }
        }
        let auto_open = self.auto_open_browser;
        self.interactive_login(true, auto_open)
    }

    fn ensure_active(&mut self) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        if token.is_active(self.leeway) {
            return true;
        }
        if !token.can_refresh() {
            return false;
        }
        match self.refresh() {
            Ok(_) => true,
            Err(e) => {
                log::warn!("identity token refresh failed: {}", e);
                false
            }
        }
    }

    fn refresh(&mut self) -> Result<Token, HubError> {
        let current = self
            .token
            .as_ref()
            .ok_or_else(|| HubError::Authentication("no identity token to refresh".into()))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                HubError::Authentication("identity token cannot be refreshed; log in again".into())
            })?;

        let resp = self
            .http
            .post(&self.identity.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.identity.client_id.as_str()),
            ])
            .send()
            .map_err(HubError::from_transport)?;

        let token = parse_token_response(resp, "identity token refresh", Some(&refresh_token))?;
        self.cache.store(&self.cache_key(), &token)?;
        log::debug!("refreshed identity token");
        self.token = Some(token.clone());
        Ok(token)
    }
}
