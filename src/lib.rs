//! CypherpunkPay: self-hosted BTC/XMR payment processing without a custodian
//!
//! This crate implements the charge settlement engine:
//!
//! - **Watch-only address derivation**: every charge gets a fresh receiving
//!   address derived from the merchant's account public key
//! - **Quorum verification**: a payment is only trusted once two independently
//!   queried block explorers report exactly the same credits (or a self-hosted
//!   full node reports them; XMR is only watched through monero-wallet-rpc)
//! - **Charge lifecycle**: a state machine folding observed credits into
//!   `pay_status` / `status`
//! - **Adaptive polling**: one background refresh job per active charge, with a
//!   cadence matched to how urgently the charge needs attention
//!
//! # Architecture
//!
//! 1. [`App`] is the explicitly constructed application context (store, HTTP
//!    client, price oracle, scheduler) handed to every component
//! 2. [`charges::ChargeService`] is what the web layer calls to create, pick and
//!    cancel charges
//! 3. [`charges::RefreshOrchestrator`] runs one reconciliation pass per charge
//! 4. [`scheduler::JobScheduler`] runs periodic jobs on a bounded worker pool
//!
#![warn(missing_docs)]

pub mod charges;
pub mod config;
pub mod db;
pub mod explorers;
pub mod lightning;
pub mod models;
pub mod net;
pub mod node;
pub mod prices;
pub mod scheduler;
pub mod wallet;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use config::Config;
use charges::{ChargeService, RefreshOrchestrator};
use db::Database;
use explorers::{ExplorerRegistry, HeightTracker, QuorumCreditVerifier};
use lightning::{LightningClient, LndClient};
use models::Coin;
use net::HttpClient;
use node::{BitcoinCoreClient, FullNodes, MoneroWalletRpcClient};
use prices::{PriceOracle, PriceTickers};
use scheduler::{HeightRefreshJob, JobScheduler, PriceRefreshJob, UpdateChargeJobs};
use wallet::AddressDerivationService;

/// The application context shared by every component
#[derive(Clone)]
pub struct App {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Outbound HTTP client (explorers, price sources)
    pub http: HttpClient,
    /// Fiat/coin exchange rates
    pub prices: Arc<PriceTickers>,
    /// Charge creation, coin picking and cancellation
    pub charges: Arc<ChargeService>,
    /// Per-charge reconciliation
    pub refresher: Arc<RefreshOrchestrator>,
    /// Blockchain height tracking
    pub heights: Arc<HeightTracker>,
    /// Background job scheduler
    pub scheduler: JobScheduler,
}

impl App {
    /// Build the application context from configuration
    ///
    /// Fails on a malformed account key or unsupported network, which is fatal
    /// at startup.
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing CypherpunkPay...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        let db = Arc::new(Database::connect(&db_url).await?);

        let http = HttpClient::new(&config.net)?;

        let wallets = Arc::new(AddressDerivationService::from_config(&config, db.clone())?);
        info!("Configured coins: {:?}", wallets.configured_coins());

        let prices = Arc::new(PriceTickers::new(
            http.clone(),
            config.charges.supported_fiats.clone(),
        ));

        let mut full_nodes = FullNodes::default();
        if config.btc.node_enabled {
            let client = BitcoinCoreClient::new(&config.btc, &config.net)?;
            if let Some(account) = wallets.bitcoin_account() {
                if let Err(e) = client.ensure_watch_only_wallet(account).await {
                    // The node may still be starting; refreshes will retry on their own
                    warn!("Could not prepare watch-only wallet on Bitcoin Core: {}", e);
                }
            }
            full_nodes.btc = Some(Arc::new(client));
        }
        if config.xmr.node_enabled {
            let client = MoneroWalletRpcClient::new(&config.xmr, &config.net)?;
            if let Some(account) = wallets.monero_account() {
                if let Err(e) = client.ensure_view_only_wallet(account).await {
                    warn!("Could not prepare view-only wallet on monero-wallet-rpc: {}", e);
                }
            }
            full_nodes.xmr = Some(Arc::new(client));
        } else if wallets.monero_account().is_some() {
            warn!("XMR wallet configured without monero-wallet-rpc; XMR will not be offered");
        }

        let lightning: Option<Arc<dyn LightningClient>> = if config.btc.lightning_enabled {
            Some(Arc::new(LndClient::new(&config.btc, &config.net)?))
        } else {
            None
        };

        let registry = Arc::new(ExplorerRegistry::for_network(
            http.clone(),
            config.btc_network()?,
            config.net.use_tor,
        ));
        let quorum = Arc::new(QuorumCreditVerifier::new(registry.clone()));

        let heights = Arc::new(HeightTracker::new(
            config.clone(),
            db.clone(),
            registry,
            full_nodes.clone(),
        ));

        let refresher = Arc::new(RefreshOrchestrator::new(
            config.clone(),
            db.clone(),
            quorum,
            full_nodes,
            lightning.clone(),
        ));

        let oracle: Arc<dyn PriceOracle> = prices.clone();
        let charges = Arc::new(ChargeService::new(
            config.clone(),
            db.clone(),
            wallets,
            oracle,
            lightning,
        ));

        let scheduler = JobScheduler::new(config.scheduler.workers);

        info!("CypherpunkPay initialized");

        Ok(Self {
            config,
            db,
            http,
            prices,
            charges,
            refresher,
            heights,
            scheduler,
        })
    }

    /// Register the full-time background jobs and start dispatching
    pub fn start(&self) {
        let sched = &self.config.scheduler;

        self.scheduler.add_job(
            "update_price_tickers",
            Duration::from_secs(sched.price_refresh_seconds),
            Duration::ZERO,
            Arc::new(PriceRefreshJob::new(self.prices.clone())),
        );

        self.scheduler.add_job(
            "update_blockchain_height",
            Duration::from_secs(sched.height_refresh_seconds),
            Duration::ZERO,
            Arc::new(HeightRefreshJob::new(self.heights.clone())),
        );

        let tick = Duration::from_secs(sched.tick_seconds);
        self.scheduler.add_job(
            "update_charge_jobs",
            tick,
            tick,
            Arc::new(UpdateChargeJobs::new(
                self.scheduler.clone(),
                self.db.clone(),
                self.refresher.clone(),
            )),
        );

        self.scheduler.start();
        info!("Background jobs started");
    }

    /// Reconcile one charge against the network now
    ///
    /// Idempotent and safe to call on any schedule or on demand.
    pub async fn refresh_charge(&self, uid: &str) {
        self.refresher.refresh_charge(uid).await;
    }

    /// Stop dispatching jobs and wait (bounded) for in-flight work
    pub async fn shutdown(&self) {
        info!("Shutting down CypherpunkPay...");
        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_seconds);
        if !self.scheduler.shutdown(grace).await {
            error!("Some jobs were still running after {:?}", grace);
        }
        self.db.close().await;
        info!("CypherpunkPay shutdown complete");
    }

    /// Coins with a configured wallet
    pub fn configured_coins(&self) -> Vec<Coin> {
        self.charges.configured_coins()
    }
}

/// Error types for the settlement engine
#[derive(thiserror::Error, Debug)]
pub enum PayError {
    /// Bad user input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unusable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Account public key that is malformed or for the wrong network
    #[error("Invalid account key: {0}")]
    InvalidAccountKey(String),

    /// Coin without support
    #[error("Unsupported coin: {0}")]
    UnsupportedCoin(String),

    /// Explorer, node or Lightning call that failed and may succeed later
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// Price unavailable or stale
    #[error("Price missing: {0}")]
    PriceMissing(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for PayError {
    fn from(e: rusqlite::Error) -> Self {
        PayError::Database(e.to_string())
    }
}

/// Result type alias for settlement engine operations
pub type PayResult<T> = std::result::Result<T, PayError>;
