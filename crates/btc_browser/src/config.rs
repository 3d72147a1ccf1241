use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::net::explorer::DEFAULT_API_BASE;
use crate::theme::Theme;

#[derive(Parser, Debug, Clone)]
#[command(name = "btc-browser")]
#[command(about = "Latest Bitcoin block and its predecessor, straight from a block explorer", long_about = None)]
pub struct Args {
    /// Esplora-compatible API base URL
    #[arg(long, env = "BLOCK_EXPLORER_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Deadline for one fetch (all of its requests), in milliseconds
    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value_t = 5_000)]
    pub timeout_ms: u64,

    /// How often to poll the explorer, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 30_000)]
    pub poll_interval_ms: u64,

    /// Where the last seen blocks and the theme are cached
    #[arg(long, env = "BTC_BROWSER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Refresh once, print the result and exit
    #[arg(long)]
    pub once: bool,

    /// Select and remember a theme
    #[arg(long, value_parser = parse_theme, conflicts_with = "toggle_theme")]
    pub theme: Option<Theme>,

    /// Flip the remembered theme
    #[arg(long)]
    pub toggle_theme: bool,

    /// Skip the startup banner
    #[arg(long)]
    pub no_banner: bool,
}

fn parse_theme(s: &str) -> Result<Theme, String> {
    s.parse().map_err(|e: crate::theme::UnknownTheme| e.to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("api base must be an http(s) URL, got `{0}`")]
    ApiBase(String),
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_base: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.timeout_ms == 0 {
            return Err(ConfigError::Zero("timeout"));
        }
        if args.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll interval"));
        }
        let api_base = args.api_base.trim().to_string();
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            return Err(ConfigError::ApiBase(api_base));
        }
        Ok(Config {
            api_base,
            timeout: Duration::from_millis(args.timeout_ms),
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            data_dir: args.data_dir.clone(),
        })
    }
}
