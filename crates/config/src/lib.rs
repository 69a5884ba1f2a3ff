// Configuration loading

pub mod settings;

pub use settings::{CaBundle, ConfigError, HubSettings, IdentitySettings};
