//! Bitcoin Core JSON-RPC client
//!
//! Watches the merchant's account through a descriptor wallet imported once
//! at startup. Only public keys are handed to the node.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{wallet_name, FullNodeClient};
use crate::config::{BtcConfig, NetConfig};
use crate::models::{AddressCredits, Credit};
use crate::net::decimal_from_json;
use crate::wallet::BitcoinAccount;
use crate::{PayError, PayResult};

/// Deepest `minconf` queried; anything deeper is reported at this depth
const MAX_TRACKED_DEPTH: u64 = 6;

/// Rescan this far back when importing (a bit more than a pruned node keeps)
const RESCAN_DAYS: i64 = 4;

/// Addresses imported ahead of use
const DESCRIPTOR_RANGE: u32 = 256;

/// JSON-RPC client for a Bitcoin Core node
pub struct BitcoinCoreClient {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl BitcoinCoreClient {
    /// Create a client; the node is not contacted until the first call
    pub fn new(btc: &BtcConfig, net: &NetConfig) -> PayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(net.timeout_seconds))
            .build()
            .map_err(|e| PayError::Configuration(format!("Failed to build Bitcoin Core client: {}", e)))?;

        Ok(Self {
            client,
            url: btc.node_rpc_url.trim_end_matches('/').to_string(),
            user: btc.node_rpc_user.clone(),
            password: btc.node_rpc_password.clone(),
            next_id: AtomicU64::new(0),
        })
    }

    async fn call(&self, method: &str, params: Value, wallet: Option<&str>) -> PayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let url = match wallet {
            Some(name) => format!("{}/wallet/{}", self.url, name),
            None => self.url.clone(),
        };
        debug!("-{}-> {} {}", id, method, params);

        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Error connecting to {}. Is the node running with RPC enabled? {}", self.url, e);
                PayError::Transient(format!("Bitcoin Core unreachable: {}", e))
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("Error authenticating to {}. Check node_rpc_user and node_rpc_password", self.url);
            return Err(PayError::Transient("Bitcoin Core rejected RPC credentials".to_string()));
        }

        // Core answers RPC errors with HTTP 500 and a JSON body
        let text = response
            .text()
            .await
            .map_err(|e| PayError::Transient(format!("Failed to read Bitcoin Core response: {}", e)))?;
        let reply: Value = serde_json::from_str(&text).map_err(|_| {
            warn!("[{}] Unexpected non-JSON response: {}", method, text);
            PayError::Transient(format!("{} returned non-JSON response", method))
        })?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            warn!("[{}] JSON-RPC call error: {}", method, error);
            return Err(PayError::Transient(format!("{} failed: {}", method, error)));
        }

        reply
            .get("result")
            .cloned()
            .ok_or_else(|| PayError::Transient(format!("{} response has no result", method)))
    }

    /// Create and populate the watch-only wallet for `account` unless present
    pub async fn ensure_watch_only_wallet(&self, account: &BitcoinAccount) -> PayResult<()> {
        let name = wallet_name(account.fingerprint());

        let wallets = self.call("listwallets", json!([]), None).await?;
        let exists = wallets
            .as_array()
            .map(|list| list.iter().any(|w| w.as_str() == Some(name.as_str())))
            .unwrap_or(false);

        if !exists {
            info!("Creating watch-only wallet {} on Bitcoin Core...", name);
            // disable_private_keys, blank, no passphrase, no avoid_reuse, descriptors, load_on_startup
            self.call("createwallet", json!([name, true, true, "", false, true, true]), None)
                .await?;
        }

        let wallet_info = self.call("getwalletinfo", json!([]), Some(&name)).await?;
        if wallet_info.get("txcount").and_then(Value::as_u64).unwrap_or(0) == 0 {
            info!("Importing account descriptor into Bitcoin Core wallet {}...", name);
            let descriptor = format!("wpkh({}/0/*)", account.standard_xpub());
            let info = self.call("getdescriptorinfo", json!([descriptor]), None).await?;
            let checksum = info
                .get("checksum")
                .and_then(Value::as_str)
                .ok_or_else(|| PayError::Transient("getdescriptorinfo returned no checksum".to_string()))?;

            let rescan_since = (Utc::now() - chrono::Duration::days(RESCAN_DAYS)).timestamp();
            let results = self
                .call(
                    "importdescriptors",
                    json!([[{
                        "desc": format!("{}#{}", descriptor, checksum),
                        "timestamp": rescan_since,
                        "watchonly": true,
                        "internal": false,
                        "active": true,
                        "range": [0, DESCRIPTOR_RANGE],
                    }]]),
                    Some(&name),
                )
                .await?;
            if let Some(failed) = results
                .as_array()
                .and_then(|list| list.iter().find(|r| r.get("success") != Some(&Value::Bool(true))))
            {
                return Err(PayError::Transient(format!("importdescriptors failed: {}", failed)));
            }
        }

        info!("Connected to Bitcoin Core wallet {}", name);
        Ok(())
    }

    async fn received_by_address(&self, wallet: &str, address: &str, minconf: u64) -> PayResult<Decimal> {
        let result = self
            .call("getreceivedbyaddress", json!([address, minconf]), Some(wallet))
            .await?;
        parse_amount(&result)
    }
}

fn parse_amount(value: &Value) -> PayResult<Decimal> {
    decimal_from_json(value).ok_or_else(|| PayError::Transient(format!("Cannot parse amount {}", value)))
}

/// Credits from cumulative received totals indexed by `minconf` (0..=6)
///
/// The difference between consecutive totals was received at that exact depth.
/// The node does not report per-transaction details for descriptor wallets,
/// so every credit is marked replaceable.
fn credits_from_received(received: &[Decimal], current_height: u64) -> AddressCredits {
    let mut credits = Vec::new();
    for depth in 0..received.len() {
        let at_depth = match received.get(depth + 1) {
            Some(deeper) => received[depth] - deeper,
            None => received[depth],
        };
        if at_depth <= Decimal::ZERO {
            continue;
        }
        let height = if depth == 0 {
            None
        } else {
            Some(current_height.saturating_sub(depth as u64 - 1))
        };
        credits.push(Credit::new(at_depth, height, true));
    }
    AddressCredits::new(credits, current_height)
}

#[async_trait]
impl FullNodeClient for BitcoinCoreClient {
    async fn get_height(&self) -> PayResult<u64> {
        let result = self.call("getblockcount", json!([]), None).await?;
        result
            .as_u64()
            .ok_or_else(|| PayError::Transient(format!("Unexpected getblockcount result {}", result)))
    }

    async fn get_address_credits(
        &self,
        wallet_fingerprint: &str,
        address: &str,
        current_height: u64,
    ) -> PayResult<AddressCredits> {
        let wallet = wallet_name(wallet_fingerprint);
        let mut received = Vec::with_capacity(MAX_TRACKED_DEPTH as usize + 1);
        for minconf in 0..=MAX_TRACKED_DEPTH {
            received.push(self.received_by_address(&wallet, address, minconf).await?);
        }
        Ok(credits_from_received(&received, current_height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_credits_from_received() {
        // 0.5 deep, 0.2 at depth 2, 0.1 in mempool
        let received = [
            dec!(0.8),
            dec!(0.7),
            dec!(0.7),
            dec!(0.5),
            dec!(0.5),
            dec!(0.5),
            dec!(0.5),
        ];
        let credits = credits_from_received(&received, 1000);

        assert_eq!(
            credits,
            AddressCredits::new(
                vec![
                    Credit::unconfirmed(dec!(0.1)),
                    Credit::confirmed(dec!(0.2), 999),
                    Credit::confirmed(dec!(0.5), 995),
                ],
                1000
            )
        );
        assert_eq!(AddressCredits::total(&credits.confirmed_n(2)), dec!(0.7));
        assert_eq!(credits.min_confirmations(&credits.confirmed_1()), 2);
    }

    #[test]
    fn test_credits_from_nothing_received() {
        let credits = credits_from_received(&[Decimal::ZERO; 7], 10);
        assert!(credits.any().is_empty());
    }

    #[test]
    fn test_parse_amount_is_exact() {
        let value: Value = serde_json::from_str("0.00010001").unwrap();
        assert_eq!(parse_amount(&value).unwrap(), dec!(0.00010001));
        let value: Value = serde_json::from_str("1e-8").unwrap();
        assert_eq!(parse_amount(&value).unwrap(), dec!(0.00000001));
        assert!(parse_amount(&Value::Null).is_err());
    }

    #[test]
    fn test_wallet_name() {
        assert_eq!(wallet_name("abcd"), "cypherpunkpay-wallet-abcd");
    }
}
