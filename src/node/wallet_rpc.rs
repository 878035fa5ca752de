//! monero-wallet-rpc JSON-RPC client
//!
//! Watches the merchant's account through a view-only wallet created from
//! the primary address and secret view key. The spend key never leaves the
//! merchant.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{wallet_name, FullNodeClient};
use crate::config::{NetConfig, XmrConfig};
use crate::models::{AddressCredits, Credit};
use crate::wallet::MoneroAccount;
use crate::{PayError, PayResult};

/// Decimal places of one XMR in atomic units (piconero)
const PICONERO_SCALE: u32 = 12;

/// JSON-RPC client for a monero-wallet-rpc
pub struct MoneroWalletRpcClient {
    client: reqwest::Client,
    url: String,
    restore_height: u64,
    next_id: AtomicU64,
}

impl MoneroWalletRpcClient {
    /// Create a client; the wallet-rpc is not contacted until the first call
    pub fn new(xmr: &XmrConfig, net: &NetConfig) -> PayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(net.timeout_seconds))
            .build()
            .map_err(|e| PayError::Configuration(format!("Failed to build monero-wallet-rpc client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/json_rpc", xmr.wallet_rpc_url.trim_end_matches('/')),
            restore_height: xmr.wallet_restore_height,
            next_id: AtomicU64::new(0),
        })
    }

    async fn call(&self, method: &str, params: Value) -> PayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("-{}-> {}", id, method);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.url).json(&body).send().await.map_err(|e| {
            warn!("Error connecting to {}. Is monero-wallet-rpc running? {}", self.url, e);
            PayError::Transient(format!("monero-wallet-rpc unreachable: {}", e))
        })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("{} asks for credentials. Run monero-wallet-rpc with --disable-rpc-login", self.url);
            return Err(PayError::Transient("monero-wallet-rpc requires login".to_string()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| PayError::Transient(format!("Failed to read monero-wallet-rpc response: {}", e)))?;
        let reply: Value = serde_json::from_str(&text).map_err(|_| {
            warn!("[{}] Unexpected non-JSON response: {}", method, text);
            PayError::Transient(format!("{} returned non-JSON response", method))
        })?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            debug!("[{}] JSON-RPC call error: {}", method, error);
            return Err(PayError::Transient(format!("{} failed: {}", method, error)));
        }

        reply
            .get("result")
            .cloned()
            .ok_or_else(|| PayError::Transient(format!("{} response has no result", method)))
    }

    /// Open the view-only wallet for `account`, creating it when missing
    pub async fn ensure_view_only_wallet(&self, account: &MoneroAccount) -> PayResult<()> {
        let filename = wallet_name(account.fingerprint());

        let opened = self
            .call("open_wallet", json!({ "filename": filename, "password": "" }))
            .await;
        if let Err(e) = opened {
            info!("Cannot open {} ({}), creating view-only wallet...", filename, e);
            self.call(
                "generate_from_keys",
                json!({
                    "filename": filename,
                    "address": account.main_address(),
                    "viewkey": account.secret_view_key_hex(),
                    "password": "",
                    "restore_height": self.restore_height,
                    "autosave_current": true,
                }),
            )
            .await?;
        }

        info!("Connected to monero-wallet-rpc wallet {}", filename);
        Ok(())
    }
}

fn piconero_to_xmr(value: &Value) -> PayResult<Decimal> {
    let atomic = value
        .as_u64()
        .ok_or_else(|| PayError::Transient(format!("Cannot parse amount {}", value)))?;
    Ok(Decimal::from_i128_with_scale(i128::from(atomic), PICONERO_SCALE).normalize())
}

/// Credits to `address` in a `get_transfers` result
///
/// Mined incoming transfers are confirmed at their block height, pool
/// transfers are unconfirmed. Transfers flagged as double spent are left out.
fn credits_from_transfers(result: &Value, address: &str) -> PayResult<Vec<Credit>> {
    let mut credits = Vec::new();
    for (section, mined) in [("in", true), ("pool", false)] {
        let Some(transfers) = result.get(section).and_then(Value::as_array) else {
            continue;
        };
        for transfer in transfers {
            if transfer.get("address").and_then(Value::as_str) != Some(address) {
                continue;
            }
            if transfer.get("double_spend_seen").and_then(Value::as_bool) == Some(true) {
                warn!("Ignoring double spent transfer to {}", address);
                continue;
            }
            let value = piconero_to_xmr(transfer.get("amount").unwrap_or(&Value::Null))?;
            let height = transfer.get("height").and_then(Value::as_u64).filter(|h| *h > 0);
            credits.push(match (mined, height) {
                (true, Some(height)) => Credit::confirmed(value, height),
                _ => Credit::unconfirmed(value),
            });
        }
    }
    Ok(credits)
}

#[async_trait]
impl FullNodeClient for MoneroWalletRpcClient {
    async fn get_height(&self) -> PayResult<u64> {
        let result = self.call("get_height", json!({})).await?;
        // Number of blocks the wallet has synced, one past the tip
        result
            .get("height")
            .and_then(Value::as_u64)
            .map(|count| count.saturating_sub(1))
            .ok_or_else(|| PayError::Transient(format!("Unexpected get_height result {}", result)))
    }

    async fn get_address_credits(
        &self,
        wallet_fingerprint: &str,
        address: &str,
        current_height: u64,
    ) -> PayResult<AddressCredits> {
        debug!("Fetching transfers of wallet {}", wallet_name(wallet_fingerprint));
        let result = self
            .call(
                "get_transfers",
                json!({ "in": true, "pool": true, "account_index": 0 }),
            )
            .await?;
        Ok(AddressCredits::new(credits_from_transfers(&result, address)?, current_height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SUBADDRESS: &str =
        "84ByzBVeBTLJKmJL3pZ7Wp3f5Y8nMxKAW6ZPRbbDYQtYEv3jxhCuEMaAH7m1HnEDq5bK1VfTVgSUTmzrD6WDspNvN7aZK4E";

    #[test]
    fn test_credits_from_transfers() {
        let result = json!({
            "in": [
                { "address": SUBADDRESS, "amount": 1_500_000_000_000u64, "height": 2_800_000, "double_spend_seen": false },
                { "address": "8Other", "amount": 7_000_000_000_000u64, "height": 2_800_001 },
                { "address": SUBADDRESS, "amount": 1u64, "height": 2_800_002 },
            ],
            "pool": [
                { "address": SUBADDRESS, "amount": 250_000_000_000u64, "height": 0, "double_spend_seen": false },
                { "address": SUBADDRESS, "amount": 9_000_000_000_000u64, "height": 0, "double_spend_seen": true },
            ],
        });

        let credits = credits_from_transfers(&result, SUBADDRESS).unwrap();
        assert_eq!(
            credits,
            vec![
                Credit::confirmed(dec!(1.5), 2_800_000),
                Credit::confirmed(dec!(0.000000000001), 2_800_002),
                Credit::unconfirmed(dec!(0.25)),
            ]
        );

        let credits = AddressCredits::new(credits, 2_800_002);
        assert_eq!(AddressCredits::total(&credits.confirmed_n(3)), dec!(1.5));
    }

    #[test]
    fn test_no_transfers_yet() {
        // Empty sections are omitted by the wallet-rpc
        assert!(credits_from_transfers(&json!({}), SUBADDRESS).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_amount_fails() {
        let result = json!({ "in": [{ "address": SUBADDRESS, "amount": "lots", "height": 5 }] });
        assert!(matches!(
            credits_from_transfers(&result, SUBADDRESS),
            Err(PayError::Transient(_))
        ));
    }

    #[test]
    fn test_wallet_rpc_url() {
        let client = MoneroWalletRpcClient::new(&XmrConfig::default(), &NetConfig::default()).unwrap();
        assert_eq!(client.url, "http://127.0.0.1:18082/json_rpc");
    }
}
