//! The charge entity and its lifecycle helpers

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::PayError;

/// Extra time on top of the payment deadline before an unpaid charge hard-expires
pub const TIME_TO_PAY_EDGE_TOLERANCE_MS: i64 = 2 * 60 * 1000;

/// Cryptocurrencies a charge can be settled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coin {
    /// Bitcoin
    Btc,
    /// Monero
    Xmr,
}

impl Coin {
    /// All supported coins
    pub const ALL: [Coin; 2] = [Coin::Btc, Coin::Xmr];

    /// Lowercase ticker
    pub fn as_str(&self) -> &'static str {
        match self {
            Coin::Btc => "btc",
            Coin::Xmr => "xmr",
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Coin {
    type Err = PayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(Coin::Btc),
            "xmr" => Ok(Coin::Xmr),
            other => Err(PayError::UnsupportedCoin(other.to_string())),
        }
    }
}

/// Technical status of the incoming payment
///
/// Recomputed from observed credits on every refresh, so it can regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayStatus {
    /// Nothing received, not even unconfirmed
    Unpaid,
    /// Received less than required, confirmed or not
    Underpaid,
    /// Received enough but not yet confirmed
    Paid,
    /// Received enough with at least one confirmation
    Confirmed,
}

impl PayStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PayStatus::Unpaid => "unpaid",
            PayStatus::Underpaid => "underpaid",
            PayStatus::Paid => "paid",
            PayStatus::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for PayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayStatus {
    type Err = PayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(PayStatus::Unpaid),
            "underpaid" => Ok(PayStatus::Underpaid),
            "paid" => Ok(PayStatus::Paid),
            "confirmed" => Ok(PayStatus::Confirmed),
            other => Err(PayError::Database(format!("Unknown pay_status: {}", other))),
        }
    }
}

/// Business status of the charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStatus {
    /// Coin not picked yet; not tracked
    Draft,
    /// Waiting for payment and/or confirmations
    Awaiting,
    /// Paid with enough confirmations
    Completed,
    /// Not paid in time or not confirmed in time
    Expired,
    /// Cancelled manually
    Cancelled,
}

impl ChargeStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Draft => "draft",
            ChargeStatus::Awaiting => "awaiting",
            ChargeStatus::Completed => "completed",
            ChargeStatus::Expired => "expired",
            ChargeStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, expired and cancelled are terminal
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ChargeStatus::Completed | ChargeStatus::Expired | ChargeStatus::Cancelled
        )
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargeStatus {
    type Err = PayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ChargeStatus::Draft),
            "awaiting" => Ok(ChargeStatus::Awaiting),
            "completed" => Ok(ChargeStatus::Completed),
            "expired" => Ok(ChargeStatus::Expired),
            "cancelled" => Ok(ChargeStatus::Cancelled),
            other => Err(PayError::Database(format!("Unknown status: {}", other))),
        }
    }
}

/// One payment request with its own address or invoice and deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    /// Immutable identifier
    pub uid: String,
    /// Merchant's order reference; None for donations
    pub merchant_order_id: Option<String>,
    /// Payment deadline counted from activation
    pub time_to_pay_ms: i64,
    /// Completion deadline counted from activation
    pub time_to_complete_ms: i64,

    /// Requested amount in `currency` (fiat or coin)
    pub total: Decimal,
    /// Lowercase currency of `total`
    pub currency: String,

    /// Amount to pay in `cc_currency`, fixed at coin pick time
    pub cc_total: Option<Decimal>,
    /// Picked coin
    pub cc_currency: Option<Coin>,
    /// Receiving address for on-chain charges
    pub cc_address: Option<String>,
    /// BOLT11 invoice for Lightning charges
    pub cc_lightning_payment_request: Option<String>,
    /// Coin price in `currency` at pick time
    pub cc_price: Option<Decimal>,
    /// USD equivalent at pick time, for statistics
    pub usd_total: Option<Decimal>,

    /// Amount received as last observed
    pub cc_received_total: Decimal,
    /// Confirmations of the shallowest counted credit
    pub confirmations: i64,
    /// Technical payment status
    pub pay_status: PayStatus,
    /// Business status
    pub status: ChargeStatus,

    /// When the coin was picked
    pub activated_at: Option<DateTime<Utc>>,
    /// When the full amount was first seen
    pub paid_at: Option<DateTime<Utc>>,
    /// When the charge completed
    pub completed_at: Option<DateTime<Utc>>,
    /// When the charge expired
    pub expired_at: Option<DateTime<Utc>>,
    /// When the charge was cancelled
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Fingerprint of the account key the address was derived from
    pub wallet_fingerprint: Option<String>,
    /// Derivation index of `cc_address` under `wallet_fingerprint`
    pub address_derivation_index: Option<i64>,

    /// Tag of the first assigned block explorer
    pub block_explorer_1: Option<String>,
    /// Tag of the second assigned block explorer
    pub block_explorer_2: Option<String>,
    /// Consecutive refreshes where the explorers did not agree
    pub subsequent_discrepancies: i64,

    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last save time
    pub updated_at: DateTime<Utc>,
}

impl Charge {
    /// A new draft charge
    pub fn new_draft(
        total: Decimal,
        currency: &str,
        time_to_pay_ms: i64,
        time_to_complete_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().simple().to_string(),
            merchant_order_id: None,
            time_to_pay_ms,
            time_to_complete_ms,
            total,
            currency: currency.to_lowercase(),
            cc_total: None,
            cc_currency: None,
            cc_address: None,
            cc_lightning_payment_request: None,
            cc_price: None,
            usd_total: None,
            cc_received_total: Decimal::ZERO,
            confirmations: 0,
            pay_status: PayStatus::Unpaid,
            status: ChargeStatus::Draft,
            activated_at: None,
            paid_at: None,
            completed_at: None,
            expired_at: None,
            cancelled_at: None,
            wallet_fingerprint: None,
            address_derivation_index: None,
            block_explorer_1: None,
            block_explorer_2: None,
            subsequent_discrepancies: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// First 10 characters of the uid, used in logs and job ids
    pub fn short_uid(&self) -> &str {
        self.uid.get(..10).unwrap_or(&self.uid)
    }

    /// Id of this charge's polling job
    pub fn refresh_job_id(&self) -> String {
        format!("refresh_charge_{}", self.short_uid())
    }

    /// Coin not picked yet
    pub fn is_draft(&self) -> bool {
        self.status == ChargeStatus::Draft
    }

    /// Settled over Lightning rather than on-chain
    pub fn is_lightning(&self) -> bool {
        self.cc_lightning_payment_request.is_some()
    }

    /// Completed, expired or cancelled
    pub fn has_final_status(&self) -> bool {
        self.status.is_final()
    }

    /// Text shown in the customer's wallet
    pub fn description(&self) -> String {
        match &self.merchant_order_id {
            Some(order) => format!("Order {}, charge {}", order, self.short_uid()),
            None => format!("Donation, charge {}", self.short_uid()),
        }
    }

    fn log_transition(&self, to: ChargeStatus) {
        info!("Charge {} status {} -> {}", self.short_uid(), self.status, to);
    }

    /// Start tracking; stamps `activated_at` on the first activation
    pub fn advance_to_awaiting(&mut self, now: DateTime<Utc>) {
        if self.is_draft() {
            self.log_transition(ChargeStatus::Awaiting);
            self.activated_at = Some(now);
        }
        self.status = ChargeStatus::Awaiting;
    }

    /// Mark as completed
    pub fn advance_to_completed(&mut self, now: DateTime<Utc>) {
        self.log_transition(ChargeStatus::Completed);
        self.completed_at = Some(now);
        self.status = ChargeStatus::Completed;
    }

    /// Mark as expired
    pub fn advance_to_expired(&mut self, now: DateTime<Utc>) {
        self.log_transition(ChargeStatus::Expired);
        self.expired_at = Some(now);
        self.status = ChargeStatus::Expired;
    }

    /// Mark as cancelled
    pub fn advance_to_cancelled(&mut self, now: DateTime<Utc>) {
        self.log_transition(ChargeStatus::Cancelled);
        self.cancelled_at = Some(now);
        self.status = ChargeStatus::Cancelled;
    }

    fn time_since_activation(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.activated_at.map(|at| now - at)
    }

    /// Unpaid or underpaid past the payment deadline plus tolerance
    pub fn is_hard_expired_to_pay(&self, now: DateTime<Utc>) -> bool {
        if self.is_draft()
            || !matches!(self.pay_status, PayStatus::Unpaid | PayStatus::Underpaid)
        {
            return false;
        }
        let limit = Duration::milliseconds(self.time_to_pay_ms + TIME_TO_PAY_EDGE_TOLERANCE_MS);
        self.time_since_activation(now)
            .map(|passed| passed >= limit)
            .unwrap_or(false)
    }

    /// Still non-final past the completion deadline
    pub fn is_expired_to_complete(&self, now: DateTime<Utc>) -> bool {
        if self.is_draft() || self.has_final_status() {
            return false;
        }
        let limit = Duration::milliseconds(self.time_to_complete_ms);
        self.time_since_activation(now)
            .map(|passed| passed >= limit)
            .unwrap_or(false)
    }

    /// Required amount left to pay
    pub fn cc_remaining_total(&self) -> Decimal {
        self.cc_total
            .map(|t| (t - self.cc_received_total).max(Decimal::ZERO))
            .unwrap_or(Decimal::ZERO)
    }
}
