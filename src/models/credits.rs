//! Observed inbound transfers to an address

use rust_decimal::Decimal;

/// One observed inbound transfer
#[derive(Debug, Clone, Copy)]
pub struct Credit {
    value: Decimal,
    confirmed_height: Option<u64>,
    replaceable: bool,
}

impl Credit {
    /// A credit as reported by a source; `confirmed_height` is None while in the mempool
    pub fn new(value: Decimal, confirmed_height: Option<u64>, replaceable: bool) -> Self {
        Self {
            value,
            confirmed_height,
            replaceable,
        }
    }

    /// A credit mined at `height`
    pub fn confirmed(value: Decimal, height: u64) -> Self {
        Self {
            value,
            confirmed_height: Some(height),
            replaceable: false,
        }
    }

    /// A credit still in the mempool
    pub fn unconfirmed(value: Decimal) -> Self {
        Self {
            value,
            confirmed_height: None,
            replaceable: false,
        }
    }

    /// A mempool credit that signals replace-by-fee
    pub fn unconfirmed_replaceable(value: Decimal) -> Self {
        Self {
            value,
            confirmed_height: None,
            replaceable: true,
        }
    }

    /// Transferred amount in whole coins
    pub fn value(&self) -> Decimal {
        self.value
    }

    /// Block height the transfer was mined at
    pub fn confirmed_height(&self) -> Option<u64> {
        self.confirmed_height
    }

    /// Whether the transfer is mined
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_height.is_some()
    }

    /// Whether the transfer is in the mempool and signals replaceability
    pub fn is_unconfirmed_replaceable(&self) -> bool {
        !self.is_confirmed() && self.replaceable
    }

    fn sort_key(&self) -> (Decimal, Option<u64>, bool) {
        (self.value, self.confirmed_height, self.replaceable)
    }
}

// Explorers disagree on how they detect the replaceable flag, so it is not part of equality
impl PartialEq for Credit {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.confirmed_height == other.confirmed_height
    }
}

impl Eq for Credit {}

/// All credits of an address as seen at one blockchain height
///
/// Equality is multiset equality over the credits plus the height snapshot,
/// so two sources listing the same transfers in a different order agree.
#[derive(Debug, Clone)]
pub struct AddressCredits {
    credits: Vec<Credit>,
    blockchain_height: u64,
}

impl AddressCredits {
    /// Build a snapshot; the credit order is irrelevant
    pub fn new(mut credits: Vec<Credit>, blockchain_height: u64) -> Self {
        credits.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            credits,
            blockchain_height,
        }
    }

    /// Snapshot with no credits
    pub fn empty(blockchain_height: u64) -> Self {
        Self::new(Vec::new(), blockchain_height)
    }

    /// Every credit regardless of depth
    pub fn any(&self) -> &[Credit] {
        &self.credits
    }

    /// Credits with at least one confirmation
    pub fn confirmed_1(&self) -> Vec<Credit> {
        self.confirmed_n(1)
    }

    /// Credits buried under at least `required` blocks (the mining block counts as one)
    pub fn confirmed_n(&self, required: u64) -> Vec<Credit> {
        self.credits
            .iter()
            .filter(|c| match c.confirmed_height {
                Some(h) => self.depth_of(h) >= required as i64,
                None => false,
            })
            .copied()
            .collect()
    }

    /// Mempool credits signalling replace-by-fee
    pub fn unconfirmed_replaceable(&self) -> Vec<Credit> {
        self.credits
            .iter()
            .filter(|c| c.is_unconfirmed_replaceable())
            .copied()
            .collect()
    }

    /// Height the snapshot was taken at
    pub fn blockchain_height(&self) -> u64 {
        self.blockchain_height
    }

    /// Confirmations of a credit mined at `height`
    ///
    /// Negative when a source reports a block above our snapshot height.
    pub fn depth_of(&self, height: u64) -> i64 {
        self.blockchain_height as i64 - height as i64 + 1
    }

    /// Sum of credit values
    pub fn total(credits: &[Credit]) -> Decimal {
        credits.iter().map(|c| c.value).sum()
    }

    /// Confirmations of the shallowest credit, 0 for an empty list
    pub fn min_confirmations(&self, credits: &[Credit]) -> i64 {
        credits
            .iter()
            .filter_map(|c| c.confirmed_height)
            .map(|h| self.depth_of(h))
            .min()
            .unwrap_or(0)
    }
}

impl PartialEq for AddressCredits {
    fn eq(&self, other: &Self) -> bool {
        self.blockchain_height == other.blockchain_height && self.credits == other.credits
    }
}

impl Eq for AddressCredits {}
