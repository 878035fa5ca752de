//! Bitaps explorer
//!
//! Bitaps reports one net amount per transaction and splits mempool and
//! mined transactions over two endpoints, so credits are the positive
//! amounts of both lists combined.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{sats_to_btc, BlockExplorer, ExplorerKind};
use crate::models::{AddressCredits, Credit};
use crate::net::HttpClient;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LastBlock {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct TxList {
    #[serde(default)]
    list: Vec<BitapsTx>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitapsTx {
    /// Net satoshis for the address, negative when spending
    amount: i64,
    block_height: Option<u64>,
    #[serde(default)]
    rbf: bool,
}

/// api.bitaps.com
pub struct BitapsExplorer {
    http: HttpClient,
    api_endpoint: &'static str,
}

impl BitapsExplorer {
    /// Create a client
    ///
    /// The onion service rate-limits all Tor users together, so the clearnet
    /// endpoint is used in both modes.
    pub fn new(http: HttpClient, mainnet: bool) -> Self {
        let api_endpoint = if mainnet {
            "https://api.bitaps.com/btc/v1/blockchain"
        } else {
            "https://api.bitaps.com/btc/testnet/v1/blockchain"
        };
        Self { http, api_endpoint }
    }

    pub(crate) fn parse_last_block(body: &str) -> Option<u64> {
        serde_json::from_str::<Envelope<LastBlock>>(body)
            .map(|e| e.data.height)
            .map_err(|e| warn!("bitaps: unexpected block/last response: {}", e))
            .ok()
    }

    pub(crate) fn parse_transactions(
        unconfirmed: &str,
        confirmed: &str,
        current_height: u64,
    ) -> Option<AddressCredits> {
        let mut credits = Vec::new();
        for body in [unconfirmed, confirmed] {
            let txs: Envelope<TxList> = match serde_json::from_str(body) {
                Ok(txs) => txs,
                Err(e) => {
                    warn!("bitaps: unexpected transactions response: {}", e);
                    return None;
                }
            };
            credits.extend(
                txs.data
                    .list
                    .iter()
                    .filter(|tx| tx.amount > 0)
                    .map(|tx| Credit::new(sats_to_btc(tx.amount), tx.block_height, tx.rbf)),
            );
        }
        Some(AddressCredits::new(credits, current_height))
    }

    async fn get(&self, url: &str) -> Option<String> {
        match self.http.get_text(url).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("bitaps: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BlockExplorer for BitapsExplorer {
    fn tag(&self) -> &str {
        ExplorerKind::Bitaps.tag()
    }

    async fn get_height(&self) -> Option<u64> {
        let body = self.get(&format!("{}/block/last", self.api_endpoint)).await?;
        Self::parse_last_block(&body)
    }

    async fn get_address_credits(&self, address: &str, current_height: u64) -> Option<AddressCredits> {
        let unconfirmed_url = format!("{}/address/unconfirmed/transactions/{}", self.api_endpoint, address);
        let confirmed_url = format!("{}/address/transactions/{}", self.api_endpoint, address);
        let (unconfirmed, confirmed) = tokio::join!(self.get(&unconfirmed_url), self.get(&confirmed_url));
        Self::parse_transactions(&unconfirmed?, &confirmed?, current_height)
    }
}
