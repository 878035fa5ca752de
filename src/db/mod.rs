//! Database module for CypherpunkPay
//!
//! This module handles persistent storage for:
//! - Charges
//! - Per-coin blockchain heights
//!
//! All access goes through one connection behind a mutex, so writes are
//! serialized process-wide.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database connection
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let conn = Connection::open(path)?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        // Amounts are integers with 8 implied decimal digits
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS charges (
                uid TEXT PRIMARY KEY,
                merchant_order_id TEXT,
                time_to_pay_ms INTEGER NOT NULL,
                time_to_complete_ms INTEGER NOT NULL,
                total INTEGER NOT NULL,
                currency TEXT NOT NULL,
                cc_total INTEGER,
                cc_currency TEXT,
                cc_address TEXT,
                cc_lightning_payment_request TEXT,
                cc_price INTEGER,
                usd_total INTEGER,
                cc_received_total INTEGER NOT NULL DEFAULT 0,
                confirmations INTEGER NOT NULL DEFAULT 0,
                pay_status TEXT NOT NULL,
                status TEXT NOT NULL,
                activated_at DATETIME,
                paid_at DATETIME,
                completed_at DATETIME,
                expired_at DATETIME,
                cancelled_at DATETIME,
                wallet_fingerprint TEXT,
                address_derivation_index INTEGER,
                block_explorer_1 TEXT,
                block_explorer_2 TEXT,
                subsequent_discrepancies INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_charges_status ON charges(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_charges_activated_at ON charges(activated_at)",
            [],
        )?;

        // An address is never handed out twice
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_charges_wallet_index ON charges(wallet_fingerprint, address_derivation_index)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS coins (
                cc_currency TEXT NOT NULL,
                cc_network TEXT NOT NULL,
                blockchain_height INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME,
                PRIMARY KEY (cc_currency, cc_network)
            )
            "#,
            [],
        )?;

        for (coin, network) in [
            ("btc", "mainnet"),
            ("btc", "testnet"),
            ("xmr", "mainnet"),
            ("xmr", "stagenet"),
        ] {
            conn.execute(
                "INSERT OR IGNORE INTO coins (cc_currency, cc_network, blockchain_height) VALUES (?1, ?2, 0)",
                [coin, network],
            )?;
        }

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection is closed when the last Arc is dropped
        info!("Database connection closed");
    }
}
