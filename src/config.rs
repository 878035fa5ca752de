//! Configuration management for CypherpunkPay
//!
//! Configuration is loaded from a TOML file.
//!
//! # Example Configuration File
//!
//! ```toml
//! data_dir = "/var/lib/cypherpunkpay"
//!
//! [btc]
//! network = "mainnet"
//! account_xpub = "zpub6oMKbeQTqZyz7mbfjdSBXbHwyXYYwEN5sDSV48rLqRk6rnLELQCnnG1GqKju3DwjKX7C8MkfTWjLUPCM6RoCMnTskbvQqaDSaatwVtBQVPL"
//! node_enabled = false
//! lightning_enabled = false
//!
//! [xmr]
//! network = "mainnet"
//! main_address = "4..."
//! secret_view_key = "..."
//! node_enabled = true
//! wallet_rpc_url = "http://127.0.0.1:18082"
//!
//! [charges]
//! payment_timeout_minutes = 15
//! completion_timeout_hours = 48
//! supported_fiats = ["usd", "eur"]
//!
//! [net]
//! use_tor = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::Coin;
use crate::{PayError, PayResult};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory relative database paths are resolved against
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bitcoin wallet, full node and Lightning configuration
    #[serde(default)]
    pub btc: BtcConfig,

    /// Monero wallet configuration
    #[serde(default)]
    pub xmr: XmrConfig,

    /// Charge deadlines and accepted currencies
    #[serde(default)]
    pub charges: ChargesConfig,

    /// Outbound networking configuration
    #[serde(default)]
    pub net: NetConfig,

    /// Background job configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            btc: BtcConfig::default(),
            xmr: XmrConfig::default(),
            charges: ChargesConfig::default(),
            net: NetConfig::default(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("cypherpunkpay"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Bitcoin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcConfig {
    /// Network (mainnet, testnet)
    #[serde(default = "default_btc_network")]
    pub network: String,

    /// Account extended public key (xpub/zpub on mainnet, tpub/vpub on testnet)
    pub account_xpub: Option<String>,

    /// Use a self-hosted Bitcoin Core node instead of block explorers
    #[serde(default)]
    pub node_enabled: bool,

    /// Bitcoin Core JSON-RPC URL
    #[serde(default = "default_node_rpc_url")]
    pub node_rpc_url: String,

    /// Bitcoin Core RPC user
    #[serde(default)]
    pub node_rpc_user: String,

    /// Bitcoin Core RPC password
    #[serde(default)]
    pub node_rpc_password: String,

    /// Accept Lightning payments through LND
    #[serde(default)]
    pub lightning_enabled: bool,

    /// LND REST URL
    #[serde(default = "default_lnd_url")]
    pub lnd_url: String,

    /// Hex encoded invoice macaroon
    #[serde(default)]
    pub lnd_invoice_macaroon: String,
}

impl Default for BtcConfig {
    fn default() -> Self {
        Self {
            network: default_btc_network(),
            account_xpub: None,
            node_enabled: false,
            node_rpc_url: default_node_rpc_url(),
            node_rpc_user: String::new(),
            node_rpc_password: String::new(),
            lightning_enabled: false,
            lnd_url: default_lnd_url(),
            lnd_invoice_macaroon: String::new(),
        }
    }
}

fn default_btc_network() -> String {
    "mainnet".to_string()
}

fn default_node_rpc_url() -> String {
    "http://127.0.0.1:8332".to_string()
}

fn default_lnd_url() -> String {
    "https://127.0.0.1:8080/".to_string()
}

/// Monero configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmrConfig {
    /// Network (mainnet, stagenet)
    #[serde(default = "default_xmr_network")]
    pub network: String,

    /// Primary (index 0) address of the receiving wallet
    pub main_address: Option<String>,

    /// Hex encoded secret view key
    pub secret_view_key: Option<String>,

    /// Detect payments through a local monero-wallet-rpc
    ///
    /// Without it XMR cannot be picked. The wallet-rpc must run with
    /// `--disable-rpc-login` and listen on localhost only.
    #[serde(default)]
    pub node_enabled: bool,

    /// monero-wallet-rpc URL
    #[serde(default = "default_wallet_rpc_url")]
    pub wallet_rpc_url: String,

    /// Height the view-only wallet starts scanning from when first created
    #[serde(default)]
    pub wallet_restore_height: u64,
}

impl Default for XmrConfig {
    fn default() -> Self {
        Self {
            network: default_xmr_network(),
            main_address: None,
            secret_view_key: None,
            node_enabled: false,
            wallet_rpc_url: default_wallet_rpc_url(),
            wallet_restore_height: 0,
        }
    }
}

fn default_xmr_network() -> String {
    "mainnet".to_string()
}

fn default_wallet_rpc_url() -> String {
    "http://127.0.0.1:18082".to_string()
}

/// Charge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargesConfig {
    /// Time the customer has to broadcast a payment
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_minutes: u64,

    /// Time after which a non-final charge is given up on
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_hours: u64,

    /// Fiat currencies charges can be denominated in (lowercase)
    #[serde(default = "default_supported_fiats")]
    pub supported_fiats: Vec<String>,
}

impl Default for ChargesConfig {
    fn default() -> Self {
        Self {
            payment_timeout_minutes: default_payment_timeout(),
            completion_timeout_hours: default_completion_timeout(),
            supported_fiats: default_supported_fiats(),
        }
    }
}

fn default_payment_timeout() -> u64 {
    15
}

fn default_completion_timeout() -> u64 {
    48
}

fn default_supported_fiats() -> Vec<String> {
    ["usd", "eur", "gbp", "chf", "cny", "jpy"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Outbound networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Route explorer and price requests through Tor
    #[serde(default)]
    pub use_tor: bool,

    /// Tor SOCKS5 host
    #[serde(default = "default_tor_host")]
    pub tor_socks5_host: String,

    /// Tor SOCKS5 port
    #[serde(default = "default_tor_port")]
    pub tor_socks5_port: u16,

    /// Per-request timeout in seconds
    #[serde(default = "default_net_timeout")]
    pub timeout_seconds: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            use_tor: false,
            tor_socks5_host: default_tor_host(),
            tor_socks5_port: default_tor_port(),
            timeout_seconds: default_net_timeout(),
        }
    }
}

fn default_tor_host() -> String {
    "127.0.0.1".to_string()
}

fn default_tor_port() -> u16 {
    9050
}

fn default_net_timeout() -> u64 {
    30
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the charge job reconciliation tick
    #[serde(default = "default_tick")]
    pub tick_seconds: u64,

    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Price ticker refresh interval
    #[serde(default = "default_price_refresh")]
    pub price_refresh_seconds: u64,

    /// Blockchain height refresh interval
    #[serde(default = "default_height_refresh")]
    pub height_refresh_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick(),
            workers: default_workers(),
            shutdown_grace_seconds: default_shutdown_grace(),
            price_refresh_seconds: default_price_refresh(),
            height_refresh_seconds: default_height_refresh(),
        }
    }
}

fn default_tick() -> u64 {
    2
}

fn default_workers() -> usize {
    8
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_price_refresh() -> u64 {
    60
}

fn default_height_refresh() -> u64 {
    10
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:cypherpunkpay.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Bitcoin network of the configured wallet
    pub fn btc_network(&self) -> PayResult<bitcoin::Network> {
        match self.btc.network.as_str() {
            "mainnet" => Ok(bitcoin::Network::Bitcoin),
            "testnet" => Ok(bitcoin::Network::Testnet),
            other => Err(PayError::Configuration(format!(
                "Unsupported BTC network: {}",
                other
            ))),
        }
    }

    /// Network name `coin` runs on, as stored with its blockchain height
    pub fn cc_network(&self, coin: Coin) -> &str {
        match coin {
            Coin::Btc => &self.btc.network,
            Coin::Xmr => &self.xmr.network,
        }
    }

    /// Payment deadline for new charges
    pub fn time_to_pay_ms(&self) -> i64 {
        (self.charges.payment_timeout_minutes * 60 * 1000) as i64
    }

    /// Completion deadline for new charges
    pub fn time_to_complete_ms(&self) -> i64 {
        (self.charges.completion_timeout_hours * 60 * 60 * 1000) as i64
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let btc_networks = ["mainnet", "testnet"];
        if !btc_networks.contains(&self.btc.network.as_str()) {
            return Err(format!(
                "Invalid BTC network: {}. Must be one of: {:?}",
                self.btc.network, btc_networks
            ));
        }

        let xmr_networks = ["mainnet", "stagenet"];
        if !xmr_networks.contains(&self.xmr.network.as_str()) {
            return Err(format!(
                "Invalid XMR network: {}. Must be one of: {:?}",
                self.xmr.network, xmr_networks
            ));
        }

        if self.xmr.main_address.is_some() != self.xmr.secret_view_key.is_some() {
            return Err("XMR requires both main_address and secret_view_key".to_string());
        }

        if self.xmr.node_enabled && self.xmr.main_address.is_none() {
            return Err("XMR node_enabled requires main_address and secret_view_key".to_string());
        }

        if self.btc.lightning_enabled && self.btc.lnd_invoice_macaroon.is_empty() {
            return Err("Lightning requires lnd_invoice_macaroon".to_string());
        }

        if self.charges.payment_timeout_minutes == 0 {
            return Err("Payment timeout cannot be 0".to_string());
        }

        if self.charges.completion_timeout_hours * 60 <= self.charges.payment_timeout_minutes {
            return Err("Completion timeout must be longer than payment timeout".to_string());
        }

        if self.net.timeout_seconds == 0 {
            return Err("Network timeout cannot be 0".to_string());
        }

        if self.scheduler.workers == 0 {
            return Err("Scheduler needs at least one worker".to_string());
        }

        if self.scheduler.tick_seconds == 0 {
            return Err("Scheduler tick cannot be 0".to_string());
        }

        Ok(())
    }
}
