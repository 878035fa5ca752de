//! Deterministic watch-only receiving addresses
//!
//! Every picked charge gets the next unused address of the configured wallet.
//! The index is the number of charges already bound to the wallet fingerprint,
//! so addresses are never handed out twice. No private key material is used.

mod bitcoin;
mod monero;

pub use self::bitcoin::BitcoinAccount;
pub use self::monero::{MoneroAccount, MoneroNetwork};

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::db::{ChargeQueries, Database};
use crate::models::Coin;
use crate::{PayError, PayResult};

/// Derives receiving addresses for the configured wallets
pub struct AddressDerivationService {
    db: Arc<Database>,
    btc: Option<BitcoinAccount>,
    xmr: Option<MoneroAccount>,
}

impl AddressDerivationService {
    /// Create a service over already parsed accounts
    pub fn new(db: Arc<Database>, btc: Option<BitcoinAccount>, xmr: Option<MoneroAccount>) -> Self {
        Self { db, btc, xmr }
    }

    /// Parse the wallets in the configuration
    ///
    /// A configured but malformed or network-mismatched key is an error.
    pub fn from_config(config: &Config, db: Arc<Database>) -> PayResult<Self> {
        let btc = match &config.btc.account_xpub {
            Some(xpub) if !xpub.trim().is_empty() => {
                let account = BitcoinAccount::parse(xpub, config.btc_network()?)?;
                info!(
                    "BTC {} wallet fingerprint {}",
                    config.btc.network,
                    account.fingerprint()
                );
                Some(account)
            }
            _ => None,
        };

        let xmr = match (&config.xmr.main_address, &config.xmr.secret_view_key) {
            (Some(address), Some(view_key)) => {
                let network = MoneroNetwork::from_name(&config.xmr.network)?;
                let account = MoneroAccount::parse(address, view_key, network)?;
                info!(
                    "XMR {} wallet fingerprint {}",
                    config.xmr.network,
                    account.fingerprint()
                );
                Some(account)
            }
            _ => None,
        };

        Ok(Self::new(db, btc, xmr))
    }

    /// Coins with a wallet configured
    pub fn configured_coins(&self) -> Vec<Coin> {
        let mut coins = Vec::new();
        if self.btc.is_some() {
            coins.push(Coin::Btc);
        }
        if self.xmr.is_some() {
            coins.push(Coin::Xmr);
        }
        coins
    }

    /// The Bitcoin account, if configured
    pub fn bitcoin_account(&self) -> Option<&BitcoinAccount> {
        self.btc.as_ref()
    }

    /// The Monero account, if configured
    pub fn monero_account(&self) -> Option<&MoneroAccount> {
        self.xmr.as_ref()
    }

    /// Fingerprint of the wallet configured for `coin`
    pub fn wallet_fingerprint(&self, coin: Coin) -> PayResult<String> {
        match coin {
            Coin::Btc => self.btc.as_ref().map(|a| a.fingerprint().to_string()),
            Coin::Xmr => self.xmr.as_ref().map(|a| a.fingerprint().to_string()),
        }
        .ok_or_else(|| PayError::UnsupportedCoin(format!("No wallet configured for {}", coin)))
    }

    /// Address at a given index of the wallet configured for `coin`
    pub fn address_at(&self, coin: Coin, index: u32) -> PayResult<String> {
        match coin {
            Coin::Btc => self
                .btc
                .as_ref()
                .ok_or_else(|| PayError::UnsupportedCoin("No wallet configured for btc".to_string()))?
                .address_at(index),
            Coin::Xmr => Ok(self
                .xmr
                .as_ref()
                .ok_or_else(|| PayError::UnsupportedCoin("No wallet configured for xmr".to_string()))?
                .address_at(index)),
        }
    }

    /// `(wallet_fingerprint, index, address)` of the first address not bound to any charge
    ///
    /// Callers must persist the charge before asking again, otherwise the same
    /// index is returned twice.
    pub async fn next_unused_address(&self, coin: Coin) -> PayResult<(String, i64, String)> {
        let fingerprint = self.wallet_fingerprint(coin)?;
        let index = ChargeQueries::new(&self.db)
            .count_by_wallet_fingerprint(&fingerprint)
            .await?;
        let derivation_index = u32::try_from(index)
            .map_err(|_| PayError::InvalidAccountKey(format!("Wallet {} exhausted", fingerprint)))?;
        let address = self.address_at(coin, derivation_index)?;
        Ok((fingerprint, index, address))
    }
}
