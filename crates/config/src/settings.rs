// Hub client settings
// Loaded from ~/.config/polaris/settings.toml, then overridden by POLARIS_* env vars

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding a CA bundle path, or `false` to disable verification.
pub const ENV_CA_BUNDLE: &str = "POLARIS_CA_BUNDLE";
pub const ENV_HUB_URL: &str = "POLARIS_HUB_URL";
pub const ENV_API_URL: &str = "POLARIS_API_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write settings: {0}")]
    Write(String),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Trust anchors used for TLS verification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaBundle {
    /// Platform / bundled webpki roots
    #[default]
    System,
    /// PEM bundle on disk
    File(PathBuf),
    /// No verification at all. Debugging only.
    Disabled,
}

impl CaBundle {
    /// Parse the `POLARIS_CA_BUNDLE` convention: `false` disables, anything else is a path.
    pub fn from_env_value(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            CaBundle::System
        } else if trimmed.eq_ignore_ascii_case("false") {
            CaBundle::Disabled
        } else {
            CaBundle::File(PathBuf::from(trimmed))
        }
    }
}

/// External identity provider (the token that gets exchanged for a hub token).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Audience requested for the hub token; also part of the hub token cache key
    pub audience: String,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            authorize_url: "https://clerk.polarishub.io/oauth/authorize".into(),
            token_url: "https://clerk.polarishub.io/oauth/token".into(),
            client_id: "agQP2xVM6JqMHvGc".into(),
            redirect_uri: "https://polarishub.io/oauth2/callback".into(),
            scopes: vec!["profile".into(), "email".into()],
            audience: "polarishub.io".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Browsable hub frontend, used to build links to uploaded artifacts
    pub hub_url: String,

    /// REST API root
    pub api_url: String,

    /// Token-exchange endpoint
    pub hub_token_url: String,

    pub identity: IdentitySettings,

    pub ca_bundle: CaBundle,

    /// Per-request timeout for ordinary metadata calls
    pub default_timeout_secs: u64,

    /// Timeout used for bulk transfers when the caller does not pick one
    pub upload_timeout_secs: u64,

    /// Prefix of custom metadata headers on stored objects
    pub custom_metadata_prefix: String,

    /// Persist tokens across processes. When false they live only as long as the session
    pub cache_auth_token: bool,

    /// Where tokens are cached; None = `<cache_dir>/polaris`
    pub token_cache_dir: Option<PathBuf>,

    /// Tokens expiring within this window are treated as inactive
    pub token_refresh_leeway_secs: u64,

    /// Print the login URL instead of failing when no browser can be opened
    pub allow_headless_login: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            hub_url: "https://polarishub.io/".into(),
            api_url: "https://api.polarishub.io/".into(),
            hub_token_url: "https://polarishub.io/api/auth/token".into(),
            identity: IdentitySettings::default(),
            ca_bundle: CaBundle::System,
            default_timeout_secs: 30,
            upload_timeout_secs: 200,
            custom_metadata_prefix: "x-amz-meta-".into(),
            cache_auth_token: true,
            token_cache_dir: None,
            token_refresh_leeway_secs: 60,
            allow_headless_login: true,
        }
    }
}

impl HubSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polaris")
            .join("settings.toml")
    }

    /// Load settings from the default path and apply environment overrides.
    /// A missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::load_from(&Self::config_path())?;
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit TOML file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `POLARIS_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_HUB_URL) {
            self.hub_url = url;
        }
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(value) = lookup(ENV_CA_BUNDLE) {
            self.ca_bundle = CaBundle::from_env_value(&value);
        }
        if self.ca_bundle == CaBundle::Disabled {
            log::warn!(
                "TLS certificate verification is disabled ({}=false). Only use this for debugging.",
                ENV_CA_BUNDLE
            );
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("hub_url", &self.hub_url),
            ("api_url", &self.api_url),
            ("hub_token_url", &self.hub_token_url),
            ("identity.token_url", &self.identity.token_url),
        ] {
            if !(value.starts_with("https://") || value.starts_with("http://")) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("expected an absolute http(s) URL, got '{}'", value),
                });
            }
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "default_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.upload_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "upload_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if let CaBundle::File(path) = &self.ca_bundle {
            if !path.exists() {
                return Err(ConfigError::Invalid {
                    field: "ca_bundle",
                    reason: format!("CA bundle {} does not exist", path.display()),
                });
            }
        }
        Ok(())
    }

    /// Save current settings to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        fs::write(path, contents).map_err(|e| ConfigError::Write(e.to_string()))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn token_refresh_leeway(&self) -> Duration {
        Duration::from_secs(self.token_refresh_leeway_secs)
    }

    /// Directory for cached tokens
    pub fn token_cache_dir(&self) -> PathBuf {
        self.token_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("polaris")
        })
    }
}
