//! Charge lifecycle transitions
//!
//! Pure functions of the stored charge, the observed credits and the current
//! time. `pay_status` is recomputed from scratch on every pass and may
//! regress when a transaction drops out of the mempool. `status` only ever
//! moves forward.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{AddressCredits, Charge, ChargeStatus, PayStatus};

/// Confirmations after which a charge is completed
pub const CONFIRMATIONS_TO_COMPLETE: u64 = 2;

/// Outcome of folding credits into a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed
    Unchanged,
    /// Payment fields or status changed
    Changed,
    /// The charge is (still) fully confirmed; always written
    Completed,
}

impl Transition {
    /// Whether the charge has to be saved
    pub fn must_persist(&self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

/// Expire the charge when a deadline passed
///
/// Returns whether a deadline has passed, in which case the charge is saved
/// even if it was already expired.
pub fn expire_if_due(charge: &mut Charge, now: DateTime<Utc>) -> bool {
    if !(charge.is_hard_expired_to_pay(now) || charge.is_expired_to_complete(now)) {
        return false;
    }
    if !charge.has_final_status() {
        charge.advance_to_expired(now);
    }
    true
}

type Observed = (Decimal, PayStatus, i64, ChargeStatus);

fn observed(charge: &Charge) -> Observed {
    (
        charge.cc_received_total,
        charge.pay_status,
        charge.confirmations,
        charge.status,
    )
}

/// Fold observed credits into the charge
///
/// Rules, first match wins, with T = `cc_total`:
///
/// 1. credits with 2+ confirmations sum to at least T: confirmed, completed
/// 2. credits with 1+ confirmation sum to at least T: confirmed, awaiting
/// 3. all credits sum to at least T: paid
/// 4. all credits sum to more than 0: underpaid
/// 5. otherwise: unpaid
///
/// A charge without `cc_total` is left untouched.
pub fn apply_credits(charge: &mut Charge, credits: &AddressCredits, now: DateTime<Utc>) -> Transition {
    let Some(required) = charge.cc_total else {
        return Transition::Unchanged;
    };
    let before = observed(charge);

    let fully_confirmed = credits.confirmed_n(CONFIRMATIONS_TO_COMPLETE);
    let total_fully_confirmed = AddressCredits::total(&fully_confirmed);
    if total_fully_confirmed >= required {
        charge.cc_received_total = total_fully_confirmed;
        charge.confirmations = credits.min_confirmations(&fully_confirmed);
        charge.pay_status = PayStatus::Confirmed;
        if charge.paid_at.is_none() {
            // Went straight from unpaid to deeply confirmed
            charge.paid_at = Some(now);
        }
        if !charge.has_final_status() {
            charge.advance_to_completed(now);
        }
        return Transition::Completed;
    }

    let confirmed_1 = credits.confirmed_1();
    let total_confirmed_1 = AddressCredits::total(&confirmed_1);
    let total_any = AddressCredits::total(credits.any());

    if total_confirmed_1 >= required {
        charge.cc_received_total = total_confirmed_1;
        charge.confirmations = credits.min_confirmations(&confirmed_1);
        charge.pay_status = PayStatus::Confirmed;
        if charge.paid_at.is_none() {
            charge.paid_at = Some(now);
        }
    } else if total_any >= required {
        if matches!(charge.pay_status, PayStatus::Unpaid | PayStatus::Underpaid) || charge.paid_at.is_none() {
            charge.paid_at = Some(now);
        }
        charge.cc_received_total = total_any;
        charge.confirmations = 0;
        charge.pay_status = PayStatus::Paid;
    } else if total_any > Decimal::ZERO {
        charge.cc_received_total = total_any;
        charge.confirmations = 0;
        charge.pay_status = PayStatus::Underpaid;
    } else {
        charge.cc_received_total = Decimal::ZERO;
        charge.confirmations = 0;
        charge.pay_status = PayStatus::Unpaid;
    }

    if !charge.has_final_status() {
        charge.advance_to_awaiting(now);
    }

    if observed(charge) == before {
        Transition::Unchanged
    } else {
        Transition::Changed
    }
}
