//! 2-of-2 explorer agreement per charge

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{info, warn};

use super::ExplorerRegistry;
use crate::models::{AddressCredits, Charge};

/// Disagreements in a row after which a charge gets a new explorer pair
pub const DISCREPANCIES_THRESHOLD: i64 = 10;

/// Fetches credits from a charge's two assigned explorers and only trusts
/// an answer both of them give
pub struct QuorumCreditVerifier {
    registry: Arc<ExplorerRegistry>,
}

impl QuorumCreditVerifier {
    /// Create a verifier over a registry
    pub fn new(registry: Arc<ExplorerRegistry>) -> Self {
        Self { registry }
    }

    /// Make sure the charge has a usable explorer pair
    ///
    /// Assigns a random pair (and resets the discrepancy counter) when none
    /// is assigned, when the counter reached [`DISCREPANCIES_THRESHOLD`], or
    /// when an assigned explorer is no longer available. Returns whether the
    /// charge changed.
    pub fn ensure_pair(&self, charge: &mut Charge) -> bool {
        let (first, second) = match (&charge.block_explorer_1, &charge.block_explorer_2) {
            (Some(first), Some(second)) => (first.clone(), second.clone()),
            _ => return self.assign_random_pair(charge, None),
        };

        if charge.subsequent_discrepancies >= DISCREPANCIES_THRESHOLD {
            info!(
                "Picking new block explorers for charge={} as {} and {} did not agree {} times in a row",
                charge.short_uid(),
                first,
                second,
                DISCREPANCIES_THRESHOLD
            );
            return self.assign_random_pair(charge, Some((&first, &second)));
        }

        if self.registry.instantiate(&first).is_none() || self.registry.instantiate(&second).is_none() {
            info!(
                "Picking new block explorers for charge={} as {} or {} is no longer available",
                charge.short_uid(),
                first,
                second
            );
            return self.assign_random_pair(charge, None);
        }

        false
    }

    fn assign_random_pair(&self, charge: &mut Charge, previous: Option<(&str, &str)>) -> bool {
        let tags = self.registry.tags();
        if tags.len() < 2 {
            warn!(
                "Cannot assign block explorers to charge={}: {} available, 2 required",
                charge.short_uid(),
                tags.len()
            );
            return false;
        }

        let mut pairs = Vec::new();
        for (i, first) in tags.iter().enumerate() {
            for second in &tags[i + 1..] {
                pairs.push((first.clone(), second.clone()));
            }
        }

        // With a single possible pair the same pair is picked again
        if let Some((old_1, old_2)) = previous {
            if pairs.len() > 1 {
                pairs.retain(|(a, b)| !((a == old_1 && b == old_2) || (a == old_2 && b == old_1)));
            }
        }

        let mut rng = rand::thread_rng();
        let Some((mut first, mut second)) = pairs.choose(&mut rng).cloned() else {
            return false;
        };
        if rand::random::<bool>() {
            std::mem::swap(&mut first, &mut second);
        }

        charge.block_explorer_1 = Some(first);
        charge.block_explorer_2 = Some(second);
        charge.subsequent_discrepancies = 0;
        true
    }

    /// Credits of `address` if both assigned explorers report exactly the same
    ///
    /// Any failure or disagreement increments the charge's discrepancy counter
    /// and yields `None`; agreement resets the counter.
    pub async fn fetch(&self, charge: &mut Charge, address: &str, current_height: u64) -> Option<AddressCredits> {
        let explorers = match (&charge.block_explorer_1, &charge.block_explorer_2) {
            (Some(first), Some(second)) => {
                match (self.registry.instantiate(first), self.registry.instantiate(second)) {
                    (Some(e1), Some(e2)) => Some((e1, e2)),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some((explorer_1, explorer_2)) = explorers else {
            warn!("Charge {} has no usable block explorer pair", charge.short_uid());
            return None;
        };

        let (credits_1, credits_2) = tokio::join!(
            explorer_1.get_address_credits(address, current_height),
            explorer_2.get_address_credits(address, current_height)
        );

        match (credits_1, credits_2) {
            (Some(credits_1), Some(credits_2)) if credits_1 == credits_2 => {
                if charge.subsequent_discrepancies > 0 {
                    info!(
                        "Charge {} reset subsequent_discrepancies {} -> 0",
                        charge.short_uid(),
                        charge.subsequent_discrepancies
                    );
                    charge.subsequent_discrepancies = 0;
                }
                Some(credits_1)
            }
            (credits_1, credits_2) => {
                info!(
                    "Charge {} discrepancy between block explorers (likely temporary)   {} => {:?}   {} => {:?}",
                    charge.short_uid(),
                    explorer_1.tag(),
                    credits_1,
                    explorer_2.tag(),
                    credits_2
                );
                charge.subsequent_discrepancies += 1;
                info!(
                    "Charge {} subsequent_discrepancies {} -> {}",
                    charge.short_uid(),
                    charge.subsequent_discrepancies - 1,
                    charge.subsequent_discrepancies
                );
                None
            }
        }
    }
}
