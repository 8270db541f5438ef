#![forbid(unsafe_code)]
//! Configuration shared by the reef wallet sync crates.
//!
//! Holds the network selection ([`ChainType`]), the tunables of the sync engine and the
//! log4rs configuration used by wallet frontends.
use std::{
    io::{self, Error, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

pub const DEFAULT_WALLET_SERVER: &str = "https://api.reef.network";
pub const DEFAULT_LOGFILE_NAME: &str = "reef-wallet.debug.log";
pub const DEFAULT_HISTORY_FILE_NAME: &str = "recent-blocks.dat";
/// Number of blocks behind the head kept in the recent history cache. Forks deeper than this
/// cannot be resolved without a rescan.
pub const RECENT_BLOCK_RETENTION: u64 = 100;
/// Number of blocks requested per call to the live block range endpoint.
pub const BLOCK_PAGE_SIZE: u64 = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const MANIFEST_TTL: Duration = Duration::from_secs(60);
pub const CHAIN_INFO_TTL: Duration = Duration::from_secs(10);
pub const ASSET_TTL: Duration = Duration::from_secs(5 * 60);

/// Builds the wallet server uri, defaulting the scheme to `https` when one is not given.
pub fn construct_server_uri(server: Option<String>) -> Result<http::Uri, http::uri::InvalidUri> {
    match server {
        Some(s) if s.starts_with("http") => s.parse(),
        Some(s) => format!("https://{s}").parse(),
        None => DEFAULT_WALLET_SERVER.parse(),
    }
}

/// Configuration data that is necessary and sufficient for running the sync engine.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub server_uri: http::Uri,
    pub chain: ChainType,
    /// The directory where the history snapshot and logfiles will be created. By default, this
    /// will be in ~/.reef on Linux and the platform data directory elsewhere.
    pub data_dir: Option<PathBuf>,
    /// The filename of the logfile. This will be created in the `data_dir`.
    pub logfile_name: PathBuf,
    pub history_file_name: PathBuf,
    pub recent_block_retention: u64,
    pub block_page_size: u64,
    pub flush_interval: Duration,
    pub manifest_ttl: Duration,
    pub chain_info_ttl: Duration,
    pub asset_ttl: Duration,
    /// Unwind an account group to genesis when its fork point falls outside of the recent
    /// history cache, instead of returning the error to the caller.
    pub rescan_on_unresolvable_fork: bool,
}

impl SyncConfig {
    pub fn new(server_uri: http::Uri, chain: ChainType, data_dir: Option<PathBuf>) -> Self {
        SyncConfig {
            server_uri,
            chain,
            data_dir,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            history_file_name: DEFAULT_HISTORY_FILE_NAME.into(),
            recent_block_retention: RECENT_BLOCK_RETENTION,
            block_page_size: BLOCK_PAGE_SIZE,
            flush_interval: FLUSH_INTERVAL,
            manifest_ttl: MANIFEST_TTL,
            chain_info_ttl: CHAIN_INFO_TTL,
            asset_ttl: ASSET_TTL,
            rescan_on_unresolvable_fork: true,
        }
    }

    // Create an unconnected (to any server) config to test local state
    pub fn create_unconnected(chain: ChainType, dir: Option<PathBuf>) -> SyncConfig {
        Self::new(http::Uri::default(), chain, dir)
    }

    pub fn set_data_dir(&mut self, dir_str: String) {
        self.data_dir = Some(PathBuf::from(dir_str));
    }

    /// Build the Logging config
    pub fn get_log_config(&self) -> io::Result<Config> {
        let window_size = 3; // log0, log1, log2
        let fixed_window_roller = FixedWindowRoller::builder()
            .build(
                &format!("{}{{}}", self.get_log_path().to_string_lossy()),
                window_size,
            )
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))?;
        let size_limit = 5 * 1024 * 1024; // 5MB as max log file size to roll
        let size_trigger = SizeTrigger::new(size_limit);
        let compound_policy =
            CompoundPolicy::new(Box::new(size_trigger), Box::new(fixed_window_roller));

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                    .build(
                        "logfile",
                        Box::new(
                            RollingFileAppender::builder()
                                .encoder(Box::new(PatternEncoder::new("{d} {l}::{m}{n}")))
                                .build(self.get_log_path(), Box::new(compound_policy))?,
                        ),
                    ),
            )
            .build(
                Root::builder()
                    .appender("logfile")
                    .build(LevelFilter::Debug),
            )
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))
    }

    /// Resolves the data directory for the configured chain, creating it if needed.
    pub fn get_data_dir(&self) -> io::Result<Box<Path>> {
        let mut location = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                #[cfg(any(target_os = "macos", target_os = "windows"))]
                let mut dir = dirs::data_dir().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, "Couldn't determine app data directory")
                })?;
                #[cfg(any(target_os = "macos", target_os = "windows"))]
                dir.push("Reef");

                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                let mut dir = dirs::home_dir().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, "Couldn't determine home directory")
                })?;
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                dir.push(".reef");

                dir
            }
        };
        location.push(self.chain.to_string());

        std::fs::create_dir_all(&location)?;

        Ok(location.into_boxed_path())
    }

    pub fn get_log_path(&self) -> Box<Path> {
        let mut log_path = self
            .get_data_dir()
            .map(|dir| dir.into_path_buf())
            .unwrap_or_else(|_| std::env::temp_dir());
        log_path.push(&self.logfile_name);

        log_path.into_boxed_path()
    }

    pub fn get_history_path(&self) -> io::Result<Box<Path>> {
        let mut history_path = self.get_data_dir()?.into_path_buf();
        history_path.push(&self.history_file_name);

        Ok(history_path.into_boxed_path())
    }
}

/// The network a wallet follows. Every piece of per-network state in the sync engine is keyed
/// by this type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Mainnet,
    Testnet,
    Devnet,
}

impl ChainType {
    pub fn network_id(&self) -> u8 {
        match self {
            ChainType::Mainnet => 1,
            ChainType::Testnet => 0,
            ChainType::Devnet => 2,
        }
    }

    pub fn from_network_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(ChainType::Mainnet),
            0 => Some(ChainType::Testnet),
            2 => Some(ChainType::Devnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ChainType::*;
        let name = match self {
            Mainnet => "mainnet",
            Testnet => "testnet",
            Devnet => "devnet",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ChainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(ChainType::Mainnet),
            "testnet" | "test" => Ok(ChainType::Testnet),
            "devnet" | "dev" => Ok(ChainType::Devnet),
            other => Err(format!("unknown chain type: {other}")),
        }
    }
}
