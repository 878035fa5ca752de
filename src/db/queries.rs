//! Database queries

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, info};

use super::{charge_from_row, decimal_to_db_int8, Database, CHARGE_COLUMNS};
use crate::models::{Charge, Coin};
use crate::PayResult;

/// Charge queries
pub struct ChargeQueries<'a> {
    db: &'a Database,
}

impl<'a> ChargeQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new charge
    pub async fn insert(&self, charge: &Charge) -> PayResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO charges ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
                CHARGE_COLUMNS
            ),
            rusqlite::params![
                &charge.uid,
                charge.merchant_order_id.as_deref(),
                charge.time_to_pay_ms,
                charge.time_to_complete_ms,
                decimal_to_db_int8(charge.total),
                &charge.currency,
                charge.cc_total.map(decimal_to_db_int8),
                charge.cc_currency.map(|c| c.as_str()),
                charge.cc_address.as_deref(),
                charge.cc_lightning_payment_request.as_deref(),
                charge.cc_price.map(decimal_to_db_int8),
                charge.usd_total.map(decimal_to_db_int8),
                decimal_to_db_int8(charge.cc_received_total),
                charge.confirmations,
                charge.pay_status.as_str(),
                charge.status.as_str(),
                charge.activated_at,
                charge.paid_at,
                charge.completed_at,
                charge.expired_at,
                charge.cancelled_at,
                charge.wallet_fingerprint.as_deref(),
                charge.address_derivation_index,
                charge.block_explorer_1.as_deref(),
                charge.block_explorer_2.as_deref(),
                charge.subsequent_discrepancies,
                charge.created_at,
                charge.updated_at,
            ],
        )?;
        info!(
            "DB: Inserted charge: uid={}, total={}, currency={}, status={}",
            charge.short_uid(),
            charge.total,
            charge.currency,
            charge.status
        );
        Ok(())
    }

    /// Persist every mutable column of a charge and stamp `updated_at`
    pub async fn save(&self, charge: &mut Charge) -> PayResult<()> {
        charge.updated_at = Utc::now();
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            UPDATE charges SET
                merchant_order_id = ?2, total = ?3, currency = ?4, cc_total = ?5, cc_currency = ?6,
                cc_address = ?7, cc_lightning_payment_request = ?8, cc_price = ?9, usd_total = ?10,
                cc_received_total = ?11, confirmations = ?12, pay_status = ?13, status = ?14,
                activated_at = ?15, paid_at = ?16, completed_at = ?17, expired_at = ?18, cancelled_at = ?19,
                wallet_fingerprint = ?20, address_derivation_index = ?21,
                block_explorer_1 = ?22, block_explorer_2 = ?23, subsequent_discrepancies = ?24,
                updated_at = ?25
            WHERE uid = ?1
            "#,
            rusqlite::params![
                &charge.uid,
                charge.merchant_order_id.as_deref(),
                decimal_to_db_int8(charge.total),
                &charge.currency,
                charge.cc_total.map(decimal_to_db_int8),
                charge.cc_currency.map(|c| c.as_str()),
                charge.cc_address.as_deref(),
                charge.cc_lightning_payment_request.as_deref(),
                charge.cc_price.map(decimal_to_db_int8),
                charge.usd_total.map(decimal_to_db_int8),
                decimal_to_db_int8(charge.cc_received_total),
                charge.confirmations,
                charge.pay_status.as_str(),
                charge.status.as_str(),
                charge.activated_at,
                charge.paid_at,
                charge.completed_at,
                charge.expired_at,
                charge.cancelled_at,
                charge.wallet_fingerprint.as_deref(),
                charge.address_derivation_index,
                charge.block_explorer_1.as_deref(),
                charge.block_explorer_2.as_deref(),
                charge.subsequent_discrepancies,
                charge.updated_at,
            ],
        )?;
        debug!(
            "DB: Saved charge: uid={}, pay_status={}, status={}, received={}, confirmations={}",
            charge.short_uid(),
            charge.pay_status,
            charge.status,
            charge.cc_received_total,
            charge.confirmations
        );
        Ok(())
    }

    /// Get a charge by uid
    pub async fn get_by_uid(&self, uid: &str) -> PayResult<Option<Charge>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM charges WHERE uid = ?1",
            CHARGE_COLUMNS
        ))?;
        let charge = stmt
            .query_row(rusqlite::params![uid], charge_from_row)
            .optional()?;
        Ok(charge)
    }

    /// Number of charges already bound to a wallet
    pub async fn count_by_wallet_fingerprint(&self, wallet_fingerprint: &str) -> PayResult<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM charges WHERE wallet_fingerprint = ?1",
            rusqlite::params![wallet_fingerprint],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Non-draft charges activated after `since`
    pub async fn list_recently_activated(&self, since: DateTime<Utc>) -> PayResult<Vec<Charge>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM charges WHERE status != 'draft' AND activated_at > ?1 ORDER BY activated_at",
            CHARGE_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![since], charge_from_row)?;
        let charges = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(charges)
    }
}

/// Blockchain height queries
pub struct CoinQueries<'a> {
    db: &'a Database,
}

impl<'a> CoinQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Last known height, 0 when never fetched
    pub async fn get_blockchain_height(&self, coin: Coin, network: &str) -> PayResult<u64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let height: Option<i64> = conn
            .query_row(
                "SELECT blockchain_height FROM coins WHERE cc_currency = ?1 AND cc_network = ?2",
                rusqlite::params![coin.as_str(), network],
                |row| row.get(0),
            )
            .optional()?;
        Ok(height.unwrap_or(0).max(0) as u64)
    }

    /// Store a freshly determined height
    pub async fn update_blockchain_height(&self, coin: Coin, network: &str, height: u64) -> PayResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO coins (cc_currency, cc_network, blockchain_height, updated_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (cc_currency, cc_network) DO UPDATE SET blockchain_height = ?3, updated_at = ?4
            "#,
            rusqlite::params![coin.as_str(), network, height as i64, Utc::now()],
        )?;
        debug!("DB: Updated {} {} blockchain height to {}", network, coin, height);
        Ok(())
    }
}
