//! Trezor Blockbook explorer

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{sats_to_btc, BlockExplorer, ExplorerKind, RBF_SEQUENCE_THRESHOLD};
use crate::models::{AddressCredits, Credit};
use crate::net::HttpClient;

#[derive(Debug, Deserialize)]
struct BestHeight {
    blockbook: BlockbookStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockbookStatus {
    best_height: u64,
}

#[derive(Debug, Deserialize)]
struct AddressDetails {
    #[serde(default)]
    transactions: Vec<BlockbookTx>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockbookTx {
    /// -1 or absent while unconfirmed
    block_height: Option<i64>,
    #[serde(default)]
    vin: Vec<BlockbookVin>,
    #[serde(default)]
    vout: Vec<BlockbookVout>,
}

#[derive(Debug, Deserialize)]
struct BlockbookVin {
    #[serde(default)]
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct BlockbookVout {
    #[serde(default)]
    addresses: Vec<String>,
    /// Satoshis as a decimal string
    value: String,
}

/// Trezor's public Blockbook instance
pub struct TrezorExplorer {
    http: HttpClient,
    api_endpoint: &'static str,
}

impl TrezorExplorer {
    /// Create a client
    pub fn new(http: HttpClient, mainnet: bool) -> Self {
        let api_endpoint = if mainnet {
            "https://btc3.trezor.io/api/v2"
        } else {
            "https://tbtc2.trezor.io/api/v2"
        };
        Self { http, api_endpoint }
    }

    pub(crate) fn parse_best_height(body: &str) -> Option<u64> {
        serde_json::from_str::<BestHeight>(body)
            .map(|b| b.blockbook.best_height)
            .map_err(|e| warn!("trezor: unexpected bestHeight response: {}", e))
            .ok()
    }

    pub(crate) fn parse_address_details(address: &str, body: &str, current_height: u64) -> Option<AddressCredits> {
        let details: AddressDetails = match serde_json::from_str(body) {
            Ok(details) => details,
            Err(e) => {
                warn!("trezor: unexpected address response: {}", e);
                return None;
            }
        };

        let mut credits = Vec::new();
        for tx in &details.transactions {
            let height = tx.block_height.filter(|h| *h >= 0).map(|h| h as u64);
            let is_rbf = tx.vin.iter().any(|i| i.sequence < RBF_SEQUENCE_THRESHOLD);
            for out in tx.vout.iter().filter(|o| o.addresses.iter().any(|a| a == address)) {
                let sats = match out.value.parse::<i64>() {
                    Ok(sats) => sats,
                    Err(_) => {
                        warn!("trezor: cannot parse output value '{}'", out.value);
                        return None;
                    }
                };
                credits.push(Credit::new(sats_to_btc(sats), height, is_rbf));
            }
        }

        Some(AddressCredits::new(credits, current_height))
    }
}

#[async_trait]
impl BlockExplorer for TrezorExplorer {
    fn tag(&self) -> &str {
        ExplorerKind::Trezor.tag()
    }

    async fn get_height(&self) -> Option<u64> {
        let url = format!("{}/bestHeight", self.api_endpoint);
        match self.http.get_text(&url).await {
            Ok(body) => Self::parse_best_height(&body),
            Err(e) => {
                warn!("trezor: {}", e);
                None
            }
        }
    }

    async fn get_address_credits(&self, address: &str, current_height: u64) -> Option<AddressCredits> {
        let url = format!("{}/address/{}?details=txs", self.api_endpoint, address);
        match self.http.get_text(&url).await {
            Ok(body) => Self::parse_address_details(address, &body, current_height),
            Err(e) => {
                warn!("trezor: {}", e);
                None
            }
        }
    }
}
