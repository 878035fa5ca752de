//! Esplora-compatible explorers (Blockstream, mempool.space and its mirrors)

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{sats_to_btc, BlockExplorer, ExplorerKind, RBF_SEQUENCE_THRESHOLD};
use crate::models::{AddressCredits, Credit};
use crate::net::HttpClient;

#[derive(Debug, Deserialize)]
struct EsploraTx {
    status: EsploraStatus,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    #[serde(default)]
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: i64,
}

/// An Esplora REST API
pub struct EsploraExplorer {
    kind: ExplorerKind,
    http: HttpClient,
    api_endpoint: String,
}

impl EsploraExplorer {
    /// Create a client for one of the Esplora-family explorers
    pub fn new(kind: ExplorerKind, http: HttpClient, mainnet: bool, use_tor: bool) -> Self {
        Self {
            kind,
            http,
            api_endpoint: Self::api_endpoint(kind, mainnet, use_tor).to_string(),
        }
    }

    fn api_endpoint(kind: ExplorerKind, mainnet: bool, use_tor: bool) -> &'static str {
        match (kind, mainnet, use_tor) {
            (ExplorerKind::Blockstream, true, false) => "https://blockstream.info/api",
            (ExplorerKind::Blockstream, false, false) => "https://blockstream.info/testnet/api",
            (ExplorerKind::Blockstream, true, true) => {
                "http://explorerzydxu5ecjrkwceayqybizmpjjznk5izmitf2modhcusuqlid.onion/api"
            }
            (ExplorerKind::Blockstream, false, true) => {
                "http://explorerzydxu5ecjrkwceayqybizmpjjznk5izmitf2modhcusuqlid.onion/testnet/api"
            }
            (ExplorerKind::Mempool, true, false) => "https://mempool.space/api",
            (ExplorerKind::Mempool, false, false) => "https://mempool.space/testnet/api",
            (ExplorerKind::Mempool, true, true) => {
                "http://mempoolhqx4isw62xs7abwphsq7ldayuidyx2v2oethdhhj6mlo2r6ad.onion/api"
            }
            (ExplorerKind::Mempool, false, true) => {
                "http://mempoolhqx4isw62xs7abwphsq7ldayuidyx2v2oethdhhj6mlo2r6ad.onion/testnet/api"
            }
            (ExplorerKind::Emzy, _, false) => "https://mempool.emzy.de/api",
            (ExplorerKind::Emzy, _, true) => {
                "http://mempool4t6mypeemozyterviq3i5de4kpoua65r3qkn5i3kknu5l2cad.onion/api"
            }
            // No onion service
            (_, _, _) => "https://mempool.bitaroo.net/api",
        }
    }

    /// Parse an `/address/{address}/txs` response
    pub(crate) fn parse_address_txs(address: &str, body: &str, current_height: u64) -> Option<AddressCredits> {
        let txs: Vec<EsploraTx> = match serde_json::from_str(body) {
            Ok(txs) => txs,
            Err(e) => {
                warn!("Non JSON or unexpected Esplora response: {}", e);
                return None;
            }
        };

        let credits = txs
            .iter()
            .flat_map(|tx| {
                let is_rbf = tx.vin.iter().any(|i| i.sequence < RBF_SEQUENCE_THRESHOLD);
                let height = tx.status.block_height;
                tx.vout
                    .iter()
                    .filter(|o| o.scriptpubkey_address.as_deref() == Some(address))
                    .map(move |o| Credit::new(sats_to_btc(o.value), height, is_rbf))
            })
            .collect();

        Some(AddressCredits::new(credits, current_height))
    }
}

#[async_trait]
impl BlockExplorer for EsploraExplorer {
    fn tag(&self) -> &str {
        self.kind.tag()
    }

    async fn get_height(&self) -> Option<u64> {
        let url = format!("{}/blocks/tip/height", self.api_endpoint);
        match self.http.get_text(&url).await {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(height) => Some(height),
                Err(_) => {
                    warn!("{}: cannot parse '{}' as height", self.tag(), text);
                    None
                }
            },
            Err(e) => {
                warn!("{}: {}", self.tag(), e);
                None
            }
        }
    }

    async fn get_address_credits(&self, address: &str, current_height: u64) -> Option<AddressCredits> {
        let url = format!("{}/address/{}/txs", self.api_endpoint, address);
        match self.http.get_text(&url).await {
            Ok(body) => Self::parse_address_txs(address, &body, current_height),
            Err(e) => {
                warn!("{}: {}", self.tag(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ADDRESS: &str = "bc1q9uu4j9xgkppqx3g28ph30zrjte8fs7jaz79uf3";

    #[test]
    fn test_parse_address_txs() {
        let body = format!(
            r#"[
                {{
                    "txid": "aa",
                    "status": {{"confirmed": false}},
                    "vin": [{{"sequence": 4294967293}}],
                    "vout": [
                        {{"scriptpubkey_address": "{a}", "value": 150000}},
                        {{"scriptpubkey_address": "bc1qother", "value": 999}}
                    ]
                }},
                {{
                    "txid": "bb",
                    "status": {{"confirmed": true, "block_height": 700000}},
                    "vin": [{{"sequence": 4294967295}}],
                    "vout": [
                        {{"scriptpubkey_address": "{a}", "value": 100000000}},
                        {{"scriptpubkey": "6a", "value": 0}}
                    ]
                }}
            ]"#,
            a = ADDRESS
        );

        let credits = EsploraExplorer::parse_address_txs(ADDRESS, &body, 700001).unwrap();
        assert_eq!(credits.any().len(), 2);
        assert_eq!(credits.blockchain_height(), 700001);
        assert_eq!(AddressCredits::total(credits.any()), dec!(1.0015));
        assert_eq!(credits.unconfirmed_replaceable().len(), 1);
        assert_eq!(credits.confirmed_n(2).len(), 1);
        assert_eq!(credits, AddressCredits::new(
            vec![Credit::confirmed(dec!(1), 700000), Credit::unconfirmed(dec!(0.0015))],
            700001,
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(EsploraExplorer::parse_address_txs(ADDRESS, "<html>rate limited</html>", 1).is_none());
        assert!(EsploraExplorer::parse_address_txs(ADDRESS, "[]", 1).unwrap().any().is_empty());
    }
}
