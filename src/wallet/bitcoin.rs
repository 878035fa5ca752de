//! Watch-only P2WPKH derivation from a BIP32 account public key
//!
//! Accepts the standard (`xpub`/`tpub`) and SLIP-132 native segwit
//! (`zpub`/`vpub`) encodings. Both encode the same key, so the fingerprint is
//! computed from the key itself and is identical for either form.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Network, NetworkKind};

use crate::{PayError, PayResult};

const XPUB: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const ZPUB: [u8; 4] = [0x04, 0xb2, 0x47, 0x46];
const TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];
const VPUB: [u8; 4] = [0x04, 0x5f, 0x1c, 0xf6];

/// A parsed account public key bound to its network
#[derive(Debug, Clone)]
pub struct BitcoinAccount {
    xpub: Xpub,
    network: Network,
    fingerprint: String,
    secp: Secp256k1<VerifyOnly>,
}

impl BitcoinAccount {
    /// Parse and validate an account key for `network`
    pub fn parse(encoded: &str, network: Network) -> PayResult<Self> {
        let mut data = bitcoin::base58::decode_check(encoded.trim())
            .map_err(|e| PayError::InvalidAccountKey(format!("Malformed account key: {}", e)))?;

        if data.len() != 78 {
            return Err(PayError::InvalidAccountKey(format!(
                "Account key has {} bytes, expected 78",
                data.len()
            )));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&data[..4]);
        let standard = match version {
            XPUB | ZPUB => XPUB,
            TPUB | VPUB => TPUB,
            _ => {
                return Err(PayError::InvalidAccountKey(
                    "Only P2WPKH wallets are supported: use xpub/zpub on mainnet or tpub/vpub on testnet"
                        .to_string(),
                ))
            }
        };
        data[..4].copy_from_slice(&standard);

        let xpub = Xpub::decode(&data)
            .map_err(|e| PayError::InvalidAccountKey(format!("Malformed account key: {}", e)))?;

        let expected = match network {
            Network::Bitcoin => NetworkKind::Main,
            _ => NetworkKind::Test,
        };
        if xpub.network != expected {
            return Err(PayError::InvalidAccountKey(format!(
                "Account key does not belong to {}",
                network
            )));
        }

        let identifier = xpub.identifier().to_byte_array();
        let fingerprint = hex::encode(&identifier[..8]);

        Ok(Self {
            xpub,
            network,
            fingerprint,
            secp: Secp256k1::verification_only(),
        })
    }

    /// Stable identifier of the account key
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Key in standard `xpub`/`tpub` encoding
    pub fn standard_xpub(&self) -> String {
        self.xpub.to_string()
    }

    /// Network the key belongs to
    pub fn network(&self) -> Network {
        self.network
    }

    /// Receiving address at `m/0/index` relative to the account
    pub fn address_at(&self, index: u32) -> PayResult<String> {
        let path = [
            ChildNumber::from_normal_idx(0)
                .map_err(|e| PayError::InvalidAccountKey(e.to_string()))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|e| PayError::InvalidAccountKey(e.to_string()))?,
        ];
        let child = self
            .xpub
            .derive_pub(&self.secp, &path)
            .map_err(|e| PayError::InvalidAccountKey(format!("Derivation failed: {}", e)))?;

        Ok(Address::p2wpkh(&child.to_pub(), self.network).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_ZPUB: &str = "zpub6ny78Lm9fLNsW9ppXy1NB6jZUX6M8QiKphsPQrN8upBMZiSA8QtT9hkssy1ZZoKSB2muc4PQPdWMHfq41PTNGJ8iMtY5KNzJTHxHRKvNMUf";
    const TESTNET_VPUB: &str = "vpub5VpqsnbyXKZjcgWoTj8YThxGXMxFDnWo7AvCqBAsJhbgn5eRfT64uzXWAcfx1GGDTovhG9hN7uNVVedqjiyQ4XNctZM1q7PvfkHJ82PPKaY";

    #[test]
    fn test_golden_vector() {
        let account = BitcoinAccount::parse(
            "zpub6oMKbeQTqZyz7mbfjdSBXbHwyXYYwEN5sDSV48rLqRk6rnLELQCnnG1GqKju3DwjKX7C8MkfTWjLUPCM6RoCMnTskbvQqaDSaatwVtBQVPL",
            Network::Bitcoin,
        )
        .unwrap();
        assert_eq!(
            account.address_at(0).unwrap(),
            "bc1q9uu4j9xgkppqx3g28ph30zrjte8fs7jaz79uf3"
        );
    }

    #[test]
    fn test_mainnet_addresses() {
        let account = BitcoinAccount::parse(MAINNET_ZPUB, Network::Bitcoin).unwrap();
        assert_eq!(account.address_at(0).unwrap(), "bc1q4je2vdd5m3mffssjx2quza630f5k54cftmvktk");
        assert_eq!(account.address_at(1).unwrap(), "bc1qpwd06w4hfk7qasvce203jc2pshqrqkhg3chx9d");
        assert_eq!(account.address_at(19).unwrap(), "bc1qeuu8nqfth2as5hm39hpzezes55gy8mrz79zejt");
    }

    #[test]
    fn test_testnet_addresses() {
        let account = BitcoinAccount::parse(TESTNET_VPUB, Network::Testnet).unwrap();
        assert_eq!(account.address_at(0).unwrap(), "tb1qwm3y963a5vwudsfunzgsev4ms9n06vq5a5tglv");
        assert_eq!(account.address_at(1).unwrap(), "tb1qggypq3g9zl0fd2qtsh6eeek34vetc09kvc5g3y");
        assert!(account.standard_xpub().starts_with("tpub"));
    }

    #[test]
    fn test_fingerprint_ignores_encoding() {
        let zpub = BitcoinAccount::parse(MAINNET_ZPUB, Network::Bitcoin).unwrap();
        let xpub = BitcoinAccount::parse(&zpub.standard_xpub(), Network::Bitcoin).unwrap();
        assert_eq!(zpub.fingerprint(), xpub.fingerprint());
        assert_eq!(zpub.fingerprint().len(), 16);
        assert_eq!(xpub.address_at(1).unwrap(), zpub.address_at(1).unwrap());
    }

    #[test]
    fn test_rejects_bad_keys() {
        // ypub (P2SH-P2WPKH) is not supported
        let mut data = bitcoin::base58::decode_check(MAINNET_ZPUB).unwrap();
        data[..4].copy_from_slice(&[0x04, 0x9d, 0x7c, 0xb2]);
        let ypub = bitcoin::base58::encode_check(&data);
        assert!(ypub.starts_with("ypub"));
        assert!(matches!(
            BitcoinAccount::parse(&ypub, Network::Bitcoin),
            Err(PayError::InvalidAccountKey(_))
        ));

        // wrong network
        assert!(BitcoinAccount::parse(MAINNET_ZPUB, Network::Testnet).is_err());
        assert!(BitcoinAccount::parse(TESTNET_VPUB, Network::Bitcoin).is_err());

        // broken checksum
        let mut broken = MAINNET_ZPUB.to_string();
        broken.pop();
        broken.push('g');
        assert!(BitcoinAccount::parse(&broken, Network::Bitcoin).is_err());

        assert!(BitcoinAccount::parse("", Network::Bitcoin).is_err());
    }
}
