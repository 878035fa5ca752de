//! Watch-only Monero subaddress derivation
//!
//! Index 0 is the wallet's primary address; index `n` is subaddress `(0, n)`,
//! computed from the public spend key and the secret view key:
//!
//! ```text
//! m = Hs("SubAddr\0" || a || major || minor)
//! D = B + m*G
//! C = a*D
//! ```

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::{PayError, PayResult};

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const FULL_BLOCK_SIZE: usize = 8;
const FULL_ENCODED_BLOCK_SIZE: usize = 11;
const ENCODED_BLOCK_SIZES: [usize; 9] = [0, 2, 3, 5, 6, 7, 9, 10, 11];

/// Monero network, which selects the address prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoneroNetwork {
    /// Main network
    Mainnet,
    /// Stagenet
    Stagenet,
    /// Testnet
    Testnet,
}

impl MoneroNetwork {
    /// Parse a configured network name
    pub fn from_name(name: &str) -> PayResult<Self> {
        match name {
            "mainnet" => Ok(MoneroNetwork::Mainnet),
            "stagenet" => Ok(MoneroNetwork::Stagenet),
            "testnet" => Ok(MoneroNetwork::Testnet),
            other => Err(PayError::Configuration(format!("Unsupported XMR network: {}", other))),
        }
    }

    fn primary_prefix(&self) -> u8 {
        match self {
            MoneroNetwork::Mainnet => 18,
            MoneroNetwork::Stagenet => 24,
            MoneroNetwork::Testnet => 53,
        }
    }

    fn subaddress_prefix(&self) -> u8 {
        match self {
            MoneroNetwork::Mainnet => 42,
            MoneroNetwork::Stagenet => 36,
            MoneroNetwork::Testnet => 63,
        }
    }
}

/// A view-only Monero wallet
#[derive(Debug, Clone)]
pub struct MoneroAccount {
    main_address: String,
    network: MoneroNetwork,
    spend_public: EdwardsPoint,
    view_secret: Scalar,
    fingerprint: String,
}

impl MoneroAccount {
    /// Parse the primary address and secret view key, checking they belong together
    pub fn parse(main_address: &str, secret_view_key: &str, network: MoneroNetwork) -> PayResult<Self> {
        let main_address = main_address.trim();
        let secret_view_key = secret_view_key.trim();

        let data = base58_decode(main_address)
            .ok_or_else(|| PayError::InvalidAccountKey("Malformed XMR main address".to_string()))?;
        if data.len() != 69 {
            return Err(PayError::InvalidAccountKey(
                "XMR main address must be a primary (non-integrated) address".to_string(),
            ));
        }
        let (payload, checksum) = data.split_at(65);
        if keccak256(payload)[..4] != *checksum {
            return Err(PayError::InvalidAccountKey("XMR main address checksum mismatch".to_string()));
        }
        if payload[0] != network.primary_prefix() {
            return Err(PayError::InvalidAccountKey(format!(
                "XMR main address is not a {:?} primary address",
                network
            )));
        }

        let spend_public = decompress(&payload[1..33])
            .ok_or_else(|| PayError::InvalidAccountKey("Invalid XMR public spend key".to_string()))?;
        let view_public = decompress(&payload[33..65])
            .ok_or_else(|| PayError::InvalidAccountKey("Invalid XMR public view key".to_string()))?;

        let view_bytes: [u8; 32] = hex::decode(secret_view_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PayError::InvalidAccountKey("XMR secret view key must be 32 hex bytes".to_string()))?;
        let view_secret = Option::<Scalar>::from(Scalar::from_canonical_bytes(view_bytes))
            .ok_or_else(|| PayError::InvalidAccountKey("XMR secret view key is not a canonical scalar".to_string()))?;

        if EdwardsPoint::mul_base(&view_secret) != view_public {
            return Err(PayError::InvalidAccountKey(
                "XMR secret view key does not match the main address".to_string(),
            ));
        }

        // Over the canonical lowercase hex, so any spelling of the key agrees
        let fingerprint = hex::encode(Sha256::digest(hex::encode(view_bytes).as_bytes()));

        Ok(Self {
            main_address: main_address.to_string(),
            network,
            spend_public,
            view_secret,
            fingerprint,
        })
    }

    /// Stable identifier of the wallet
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Primary address
    pub fn main_address(&self) -> &str {
        &self.main_address
    }

    /// Secret view key as lowercase hex
    pub fn secret_view_key_hex(&self) -> String {
        hex::encode(self.view_secret.as_bytes())
    }

    /// Primary address for index 0, subaddress `(0, index)` otherwise
    pub fn address_at(&self, index: u32) -> String {
        if index == 0 {
            return self.main_address.clone();
        }

        let mut preimage = Vec::with_capacity(8 + 32 + 8);
        preimage.extend_from_slice(b"SubAddr\0");
        preimage.extend_from_slice(self.view_secret.as_bytes());
        preimage.extend_from_slice(&0u32.to_le_bytes());
        preimage.extend_from_slice(&index.to_le_bytes());
        let m = Scalar::from_bytes_mod_order(keccak256(&preimage));

        let spend = self.spend_public + EdwardsPoint::mul_base(&m);
        let view = self.view_secret * spend;

        let mut payload = Vec::with_capacity(69);
        payload.push(self.network.subaddress_prefix());
        payload.extend_from_slice(spend.compress().as_bytes());
        payload.extend_from_slice(view.compress().as_bytes());
        let checksum = keccak256(&payload);
        payload.extend_from_slice(&checksum[..4]);

        base58_encode(&payload)
    }
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

fn decompress(bytes: &[u8]) -> Option<EdwardsPoint> {
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    CompressedEdwardsY(bytes).decompress()
}

/// Monero's block-wise base58
fn base58_encode(data: &[u8]) -> String {
    let mut out = String::new();
    for block in data.chunks(FULL_BLOCK_SIZE) {
        let mut num: u64 = 0;
        for byte in block {
            num = (num << 8) | u64::from(*byte);
        }
        let width = ENCODED_BLOCK_SIZES[block.len()];
        let mut chars = vec![ALPHABET[0]; width];
        let mut i = width;
        while num > 0 && i > 0 {
            i -= 1;
            chars[i] = ALPHABET[(num % 58) as usize];
            num /= 58;
        }
        out.extend(chars.into_iter().map(char::from));
    }
    out
}

fn base58_decode(encoded: &str) -> Option<Vec<u8>> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::new();
    for block in bytes.chunks(FULL_ENCODED_BLOCK_SIZE) {
        let size = ENCODED_BLOCK_SIZES.iter().position(|&s| s == block.len())?;
        if size == 0 {
            return None;
        }
        let mut num: u128 = 0;
        for c in block {
            let digit = ALPHABET.iter().position(|a| a == c)?;
            num = num * 58 + digit as u128;
        }
        if size < FULL_BLOCK_SIZE && num >> (size * 8) != 0 {
            return None;
        }
        if num > u128::from(u64::MAX) {
            return None;
        }
        let be = (num as u64).to_be_bytes();
        out.extend_from_slice(&be[FULL_BLOCK_SIZE - size..]);
    }
    Some(out)
}
