//! Lightning Network payments through the merchant's own node
//!
//! The merchant's node is trusted by construction, so a settled invoice is
//! final without any explorer cross-check.

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use lightning_invoice::Bolt11Invoice;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::{PayError, PayResult};

mod lnd;

pub use lnd::LndClient;

/// State of an invoice as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightningInvoice {
    /// Whether the invoice has been paid
    pub is_settled: bool,
    /// Amount actually received
    pub amount_paid_msat: u64,
}

impl LightningInvoice {
    /// Amount received in BTC
    pub fn amount_paid_btc(&self) -> Decimal {
        Decimal::from(self.amount_paid_msat) / Decimal::from(100_000_000_000u64)
    }
}

/// Invoice-only access to a Lightning node
#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Create an invoice and return its BOLT11 payment request
    ///
    /// `amount` is in BTC; `None` creates an any-amount invoice.
    async fn create_invoice(
        &self,
        amount: Option<Decimal>,
        memo: Option<String>,
        expiry_seconds: Option<u64>,
    ) -> PayResult<String>;

    /// Look up an invoice by its hex payment hash
    async fn get_invoice(&self, payment_hash: &str) -> PayResult<LightningInvoice>;
}

/// Hex payment hash of a BOLT11 payment request
pub fn payment_hash(payment_request: &str) -> PayResult<String> {
    let invoice = Bolt11Invoice::from_str(payment_request)
        .map_err(|e| PayError::Validation(format!("Invalid BOLT11 payment request: {}", e)))?;
    Ok(hex::encode(invoice.payment_hash().to_byte_array()))
}
