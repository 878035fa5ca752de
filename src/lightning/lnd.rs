//! LND REST client

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

use super::{LightningClient, LightningInvoice};
use crate::config::{BtcConfig, NetConfig};
use crate::{PayError, PayResult};

/// gRPC status codes LND uses for an unknown invoice
const UNKNOWN_INVOICE_CODES: [i64; 2] = [2, 5];

#[derive(Debug, Deserialize)]
struct ErrorReply {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceReply {
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct LookupInvoiceReply {
    #[serde(default)]
    settled: bool,
    /// int64 rendered as a JSON string
    #[serde(default)]
    amt_paid_msat: Option<String>,
}

/// Talks to LND with an invoice-only macaroon
pub struct LndClient {
    client: reqwest::Client,
    base_url: String,
}

impl LndClient {
    /// Create a client for the configured node
    ///
    /// LND serves a self-signed certificate, so certificate checks are off.
    pub fn new(btc: &BtcConfig, net: &NetConfig) -> PayResult<Self> {
        let mut headers = HeaderMap::new();
        if !btc.lnd_invoice_macaroon.is_empty() {
            let macaroon = HeaderValue::from_str(btc.lnd_invoice_macaroon.trim())
                .map_err(|_| PayError::Configuration("Invalid lnd_invoice_macaroon".to_string()))?;
            headers.insert("Grpc-Metadata-macaroon", macaroon);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(net.timeout_seconds))
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .build()
            .map_err(|e| PayError::Configuration(format!("Failed to build LND client: {}", e)))?;

        let base_url = if btc.lnd_url.ends_with('/') {
            btc.lnd_url.clone()
        } else {
            format!("{}/", btc.lnd_url)
        };

        Ok(Self { client, base_url })
    }

    async fn read_json(response: reqwest::Response) -> PayResult<serde_json::Value> {
        let text = response
            .text()
            .await
            .map_err(|e| PayError::Transient(format!("Failed to read LND response: {}", e)))?;
        serde_json::from_str(&text).map_err(|_| {
            error!("Non-JSON response from LND: {}", text);
            PayError::Transient("Non-JSON response from LND".to_string())
        })
    }

    fn check_error(reply: &serde_json::Value) -> Option<ErrorReply> {
        let error: ErrorReply = serde_json::from_value(reply.clone()).ok()?;
        if error.code <= 0 {
            return None;
        }
        error!("LND returned error code={} with message [{}]", error.code, error.message);
        if error.message.contains("signature mismatch") {
            error!("Error authenticating to LND, check lnd_invoice_macaroon in your configuration");
        }
        Some(error)
    }
}

/// Whole satoshis for an LND `value` field
fn btc_to_sats(amount: Decimal) -> PayResult<String> {
    (amount * Decimal::from(100_000_000u64))
        .round()
        .to_i64()
        .map(|sats| sats.to_string())
        .ok_or_else(|| PayError::Validation(format!("Amount {} out of range", amount)))
}

#[async_trait]
impl LightningClient for LndClient {
    async fn create_invoice(
        &self,
        amount: Option<Decimal>,
        memo: Option<String>,
        expiry_seconds: Option<u64>,
    ) -> PayResult<String> {
        let mut body = json!({ "private": true });
        if let Some(memo) = memo.filter(|m| !m.is_empty()) {
            body["memo"] = json!(memo);
        }
        if let Some(amount) = amount {
            body["value"] = json!(btc_to_sats(amount)?);
        }
        if let Some(expiry) = expiry_seconds {
            body["expiry"] = json!(expiry.to_string());
        }

        let url = format!("{}v1/invoices", self.base_url);
        debug!("Calling LND REST API: POST {} with body={}", url, body);
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            error!("Error connecting to LND: {}", e);
            PayError::Transient(format!("LND unreachable: {}", e))
        })?;

        let reply = Self::read_json(response).await?;
        if let Some(error) = Self::check_error(&reply) {
            return Err(PayError::Transient(format!("LND error {}: {}", error.code, error.message)));
        }

        let reply: AddInvoiceReply = serde_json::from_value(reply)
            .map_err(|e| PayError::Transient(format!("Unexpected addinvoice response: {}", e)))?;
        Ok(reply.payment_request)
    }

    async fn get_invoice(&self, payment_hash: &str) -> PayResult<LightningInvoice> {
        let url = format!("{}v1/invoice/{}", self.base_url, payment_hash);
        debug!("Calling LND REST API: GET {}", url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("Error connecting to LND: {}", e);
            PayError::Transient(format!("LND unreachable: {}", e))
        })?;

        let reply = Self::read_json(response).await?;
        if let Some(error) = Self::check_error(&reply) {
            if UNKNOWN_INVOICE_CODES.contains(&error.code) {
                return Err(PayError::NotFound(format!("Invoice {}", payment_hash)));
            }
            return Err(PayError::Transient(format!("LND error {}: {}", error.code, error.message)));
        }

        let reply: LookupInvoiceReply = serde_json::from_value(reply)
            .map_err(|e| PayError::Transient(format!("Unexpected lookupinvoice response: {}", e)))?;

        let mut invoice = LightningInvoice::default();
        if reply.settled {
            invoice.is_settled = true;
            invoice.amount_paid_msat = reply
                .amt_paid_msat
                .as_deref()
                .unwrap_or("0")
                .parse()
                .map_err(|_| PayError::Transient("Unexpected amt_paid_msat".to_string()))?;
        }
        Ok(invoice)
    }
}
