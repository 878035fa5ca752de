//! Self-hosted full node integration
//!
//! When a full node is configured it is trusted directly: it replaces both
//! the explorer height consensus and the 2-of-2 credit quorum. XMR has no
//! public explorers, so it is only watched through monero-wallet-rpc.

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{AddressCredits, Coin};
use crate::PayResult;

mod client;
mod wallet_rpc;

pub use client::BitcoinCoreClient;
pub use wallet_rpc::MoneroWalletRpcClient;

/// A blockchain node run by the merchant
#[async_trait]
pub trait FullNodeClient: Send + Sync {
    /// Current blockchain height
    async fn get_height(&self) -> PayResult<u64>;

    /// Credits of `address` as seen by the watch-only wallet `wallet_fingerprint`
    async fn get_address_credits(
        &self,
        wallet_fingerprint: &str,
        address: &str,
        current_height: u64,
    ) -> PayResult<AddressCredits>;
}

/// The merchant's own nodes, per coin
#[derive(Clone, Default)]
pub struct FullNodes {
    /// Bitcoin Core
    pub btc: Option<Arc<dyn FullNodeClient>>,
    /// monero-wallet-rpc
    pub xmr: Option<Arc<dyn FullNodeClient>>,
}

impl FullNodes {
    /// Node watching `coin`, if any
    pub fn for_coin(&self, coin: Coin) -> Option<&Arc<dyn FullNodeClient>> {
        match coin {
            Coin::Btc => self.btc.as_ref(),
            Coin::Xmr => self.xmr.as_ref(),
        }
    }
}

/// Name of the node wallet watching the account with `fingerprint`
pub fn wallet_name(fingerprint: &str) -> String {
    format!("cypherpunkpay-wallet-{}", fingerprint)
}
