// Polaris CLI - log in to the hub, list, pull and push datasets

mod exit_codes;
mod hub;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use polaris_config::{ConfigError, HubSettings};
use polaris_hub_client::{AccessType, ChecksumStrategy, ConflictPolicy, HubError};

use exit_codes::{hub_exit_code, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "polaris")]
#[command(about = "Polaris Hub client: log in, list, pull and push artifacts")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Settings file (default: <config dir>/polaris/settings.toml)
    #[arg(long, global = true, env = "POLARIS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in through the identity provider and cache hub credentials
    #[command(after_help = "\
Examples:
  polaris login
  polaris login --overwrite --no-browser")]
    Login {
        /// Log in again even if a valid token is cached
        #[arg(long)]
        overwrite: bool,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Forget cached identity and hub tokens
    Logout,

    /// List datasets visible to you
    Datasets {
        #[command(flatten)]
        page: Page,
    },

    /// List benchmarks visible to you
    Benchmarks {
        #[command(flatten)]
        page: Page,
    },

    /// Download a dataset into a local directory
    #[command(after_help = "\
Examples:
  polaris pull acme/solubility --out ./solubility
  polaris pull acme/solubility --out ./solubility --verify always")]
    Pull {
        /// Dataset to download, as owner/name
        reference: String,

        /// Target directory (dataset.json, table.parquet, data.zarr/)
        #[arg(long, short = 'o')]
        out: PathBuf,

        /// Checksum strategy: always, never, unless-array
        #[arg(long, default_value_t = ChecksumStrategy::SkipForChunkedArray)]
        verify: ChecksumStrategy,

        /// What to do with array objects already present in the target
        #[arg(long, default_value_t = ConflictPolicy::Replace)]
        if_exists: ConflictPolicy,
    },

    /// Upload a local dataset directory
    #[command(after_help = "\
Examples:
  polaris push ./solubility
  polaris push ./solubility --owner acme --access public --if-exists skip")]
    Push {
        /// Directory holding dataset.json, table.parquet and optionally data.zarr/
        dir: PathBuf,

        /// Owner slug (defaults to the owner recorded in dataset.json)
        #[arg(long)]
        owner: Option<String>,

        /// Visibility on the hub
        #[arg(long, default_value_t = AccessType::Private)]
        access: AccessType,

        /// What to do with array objects already present on the hub
        #[arg(long, default_value_t = ConflictPolicy::Replace)]
        if_exists: ConflictPolicy,

        /// Timeout for the whole upload, in seconds (default: upload_timeout_secs)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

#[derive(clap::Args)]
struct Page {
    /// Maximum number of entries
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Entries to skip
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Print a JSON array instead of one entry per line
    #[arg(long)]
    json: bool,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("POLARIS_BUILD_REVISION"), ")",
        "\ntarget:  ", env!("POLARIS_BUILD_TARGET"),
        "\nprofile: ", env!("POLARIS_BUILD_PROFILE"),
        "\ntls:     rustls",
    )
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).format_target(false).init();
}

fn load_settings(path: Option<&Path>) -> Result<HubSettings, CliError> {
    let settings = match path {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::args(format!("Settings file not found: {}", path.display())));
            }
            let mut settings = HubSettings::load_from(path).map_err(CliError::config)?;
            settings.apply_env(|key| std::env::var(key).ok());
            settings.validate().map_err(CliError::config)?;
            settings
        }
        None => HubSettings::load().map_err(CliError::config)?,
    };
    log::debug!("hub: {} (api: {})", settings.hub_url, settings.api_url);
    Ok(settings)
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Login { overwrite, no_browser } => hub::cmd_login(settings, overwrite, no_browser),
        Commands::Logout => hub::cmd_logout(settings),
        Commands::Datasets { page } => {
            hub::cmd_list(settings, hub::Listing::Datasets, page.limit, page.offset, page.json)
        }
        Commands::Benchmarks { page } => {
            hub::cmd_list(settings, hub::Listing::Benchmarks, page.limit, page.offset, page.json)
        }
        Commands::Pull { reference, out, verify, if_exists } => {
            hub::cmd_pull(settings, reference, out, verify, if_exists)
        }
        Commands::Push { dir, owner, access, if_exists, timeout } => {
            hub::cmd_push(settings, dir, owner, access, if_exists, timeout)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn config(err: ConfigError) -> Self {
        Self {
            code: EXIT_USAGE,
            message: err.to_string(),
            hint: Some(format!("check {}", HubSettings::config_path().display())),
        }
    }

    /// Map a hub client error, attaching a hint where the fix is known.
    pub fn hub(err: HubError) -> Self {
        let code = hub_exit_code(&err);
        let hint = match &err {
            HubError::Authentication(_) => Some("run `polaris login` first".to_string()),
            HubError::Certificate(_) => {
                Some("point POLARIS_CA_BUNDLE at your organization's CA bundle".to_string())
            }
            HubError::Conflict { .. } => {
                Some("pass --if-exists replace or --if-exists skip".to_string())
            }
            HubError::Integrity { .. } => {
                Some("the content changed in transit or on the hub; retry the transfer".to_string())
            }
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<HubError> for CliError {
    fn from(err: HubError) -> Self {
        CliError::hub(err)
    }
}
