//! Block explorers and trust-minimized payment verification
//!
//! No single explorer is trusted. Each charge is assigned two explorers from
//! a static registry and their answers must match exactly (see
//! [`QuorumCreditVerifier`]). The chain height is the lower median over all
//! reachable explorers (see [`HeightTracker`]).

mod bitaps;
mod esplora;
mod height;
mod quorum;
mod trezor;

pub use bitaps::BitapsExplorer;
pub use esplora::EsploraExplorer;
pub use height::{lower_median, HeightTracker};
pub use quorum::{QuorumCreditVerifier, DISCREPANCIES_THRESHOLD};
pub use trezor::TrezorExplorer;

use async_trait::async_trait;
use bitcoin::Network;
use std::sync::Arc;

use crate::models::AddressCredits;
use crate::net::HttpClient;

/// A third-party source of blockchain data
///
/// Both methods return `None` on any transport or parse failure.
#[async_trait]
pub trait BlockExplorer: Send + Sync {
    /// Tag stored on charges to identify this explorer
    fn tag(&self) -> &str;

    /// Current blockchain height
    async fn get_height(&self) -> Option<u64>;

    /// All credits to `address`, snapshotted at `current_height`
    async fn get_address_credits(&self, address: &str, current_height: u64) -> Option<AddressCredits>;
}

/// The closed set of supported explorer implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExplorerKind {
    /// api.bitaps.com
    Bitaps,
    /// blockstream.info (Esplora)
    Blockstream,
    /// mempool.bitaroo.net (Esplora, mainnet only)
    Bitaroo,
    /// mempool.emzy.de (Esplora, mainnet only)
    Emzy,
    /// mempool.space (Esplora)
    Mempool,
    /// Trezor Blockbook
    Trezor,
}

impl ExplorerKind {
    /// Explorers usable on a network
    pub fn supported(network: Network) -> &'static [ExplorerKind] {
        match network {
            Network::Bitcoin => &[
                ExplorerKind::Bitaps,
                ExplorerKind::Blockstream,
                ExplorerKind::Bitaroo,
                ExplorerKind::Emzy,
                ExplorerKind::Mempool,
                ExplorerKind::Trezor,
            ],
            _ => &[
                ExplorerKind::Bitaps,
                ExplorerKind::Blockstream,
                ExplorerKind::Mempool,
                ExplorerKind::Trezor,
            ],
        }
    }

    /// Stored tag
    pub fn tag(&self) -> &'static str {
        match self {
            ExplorerKind::Bitaps => "bitaps",
            ExplorerKind::Blockstream => "blockstream",
            ExplorerKind::Bitaroo => "bitaroo",
            ExplorerKind::Emzy => "emzy",
            ExplorerKind::Mempool => "mempool",
            ExplorerKind::Trezor => "trezor",
        }
    }

    /// Parse a stored tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bitaps" => Some(ExplorerKind::Bitaps),
            "blockstream" => Some(ExplorerKind::Blockstream),
            "bitaroo" => Some(ExplorerKind::Bitaroo),
            "emzy" => Some(ExplorerKind::Emzy),
            "mempool" => Some(ExplorerKind::Mempool),
            "trezor" => Some(ExplorerKind::Trezor),
            _ => None,
        }
    }

    /// Build the client for this explorer
    pub fn instantiate(&self, http: HttpClient, network: Network, use_tor: bool) -> Arc<dyn BlockExplorer> {
        let mainnet = network == Network::Bitcoin;
        match self {
            ExplorerKind::Bitaps => Arc::new(BitapsExplorer::new(http, mainnet)),
            ExplorerKind::Trezor => Arc::new(TrezorExplorer::new(http, mainnet)),
            esplora => Arc::new(EsploraExplorer::new(*esplora, http, mainnet, use_tor)),
        }
    }
}

/// The explorers available to this instance, addressable by stored tag
pub struct ExplorerRegistry {
    explorers: Vec<Arc<dyn BlockExplorer>>,
}

impl ExplorerRegistry {
    /// All explorers supported on `network`
    pub fn for_network(http: HttpClient, network: Network, use_tor: bool) -> Self {
        let explorers = ExplorerKind::supported(network)
            .iter()
            .map(|kind| kind.instantiate(http.clone(), network, use_tor))
            .collect();
        Self { explorers }
    }

    /// A registry over a fixed set of explorers
    pub fn with_explorers(explorers: Vec<Arc<dyn BlockExplorer>>) -> Self {
        Self { explorers }
    }

    /// Tags of every registered explorer
    pub fn tags(&self) -> Vec<String> {
        self.explorers.iter().map(|e| e.tag().to_string()).collect()
    }

    /// Every registered explorer
    pub fn all(&self) -> &[Arc<dyn BlockExplorer>] {
        &self.explorers
    }

    /// The explorer stored under `tag`, if it can still be instantiated
    pub fn instantiate(&self, tag: &str) -> Option<Arc<dyn BlockExplorer>> {
        self.explorers.iter().find(|e| e.tag() == tag).cloned()
    }
}

/// Bitcoin amount from satoshis
pub(crate) fn sats_to_btc(sats: i64) -> rust_decimal::Decimal {
    rust_decimal::Decimal::new(sats, 8).normalize()
}

/// An input sequence below this signals replace-by-fee
pub(crate) const RBF_SEQUENCE_THRESHOLD: u64 = 0xffff_fffe;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Explorer answering with canned data
    pub(crate) struct StubExplorer {
        tag: String,
        height: Option<u64>,
        credits: Mutex<Option<AddressCredits>>,
    }

    impl StubExplorer {
        pub(crate) fn new(tag: &str, credits: Option<AddressCredits>) -> Self {
            Self {
                tag: tag.to_string(),
                height: None,
                credits: Mutex::new(credits),
            }
        }

        pub(crate) fn with_height(tag: &str, height: Option<u64>) -> Self {
            Self {
                tag: tag.to_string(),
                height,
                credits: Mutex::new(None),
            }
        }

        pub(crate) fn set_credits(&self, credits: Option<AddressCredits>) {
            *self.credits.lock().unwrap() = credits;
        }
    }

    #[async_trait]
    impl BlockExplorer for StubExplorer {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn get_height(&self) -> Option<u64> {
            self.height
        }

        async fn get_address_credits(&self, _address: &str, current_height: u64) -> Option<AddressCredits> {
            self.credits
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| AddressCredits::new(c.any().to_vec(), current_height))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    #[test]
    fn test_tags_roundtrip() {
        for kind in ExplorerKind::supported(Network::Bitcoin) {
            assert_eq!(ExplorerKind::from_tag(kind.tag()), Some(*kind));
        }
        assert_eq!(ExplorerKind::from_tag("cypherpunkpay.explorers.bitcoin.gone GoneExplorer"), None);
    }

    #[test]
    fn test_registry_per_network() {
        let http = HttpClient::new(&NetConfig::default()).unwrap();

        let mainnet = ExplorerRegistry::for_network(http.clone(), Network::Bitcoin, false);
        assert_eq!(mainnet.tags().len(), 6);
        assert!(mainnet.instantiate("emzy").is_some());

        let testnet = ExplorerRegistry::for_network(http, Network::Testnet, false);
        assert_eq!(
            testnet.tags(),
            vec!["bitaps", "blockstream", "mempool", "trezor"]
        );
        assert!(testnet.instantiate("emzy").is_none());
    }
}
