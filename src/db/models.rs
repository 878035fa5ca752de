//! Database models

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;

use crate::models::Charge;

/// Column list shared by every charge SELECT, in `charge_from_row` order
pub const CHARGE_COLUMNS: &str = "uid, merchant_order_id, time_to_pay_ms, time_to_complete_ms, \
    total, currency, cc_total, cc_currency, cc_address, cc_lightning_payment_request, cc_price, \
    usd_total, cc_received_total, confirmations, pay_status, status, activated_at, paid_at, \
    completed_at, expired_at, cancelled_at, wallet_fingerprint, address_derivation_index, \
    block_explorer_1, block_explorer_2, subsequent_discrepancies, created_at, updated_at";

/// Store an amount as an integer with 8 implied decimal digits
pub fn decimal_to_db_int8(value: Decimal) -> i64 {
    (value.round_dp(8) * Decimal::from(100_000_000))
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Inverse of [`decimal_to_db_int8`]
pub fn db_int8_to_decimal(value: i64) -> Decimal {
    Decimal::new(value, 8).normalize()
}

fn parse_column<T: FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    T::from_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a row selected with [`CHARGE_COLUMNS`]
pub fn charge_from_row(row: &Row<'_>) -> rusqlite::Result<Charge> {
    let cc_currency: Option<String> = row.get(7)?;
    let cc_currency = match cc_currency {
        Some(raw) => Some(parse_column(7, raw)?),
        None => None,
    };

    Ok(Charge {
        uid: row.get(0)?,
        merchant_order_id: row.get(1)?,
        time_to_pay_ms: row.get(2)?,
        time_to_complete_ms: row.get(3)?,
        total: db_int8_to_decimal(row.get(4)?),
        currency: row.get(5)?,
        cc_total: row.get::<_, Option<i64>>(6)?.map(db_int8_to_decimal),
        cc_currency,
        cc_address: row.get(8)?,
        cc_lightning_payment_request: row.get(9)?,
        cc_price: row.get::<_, Option<i64>>(10)?.map(db_int8_to_decimal),
        usd_total: row.get::<_, Option<i64>>(11)?.map(db_int8_to_decimal),
        cc_received_total: db_int8_to_decimal(row.get(12)?),
        confirmations: row.get(13)?,
        pay_status: parse_column(14, row.get(14)?)?,
        status: parse_column(15, row.get(15)?)?,
        activated_at: row.get(16)?,
        paid_at: row.get(17)?,
        completed_at: row.get(18)?,
        expired_at: row.get(19)?,
        cancelled_at: row.get(20)?,
        wallet_fingerprint: row.get(21)?,
        address_derivation_index: row.get(22)?,
        block_explorer_1: row.get(23)?,
        block_explorer_2: row.get(24)?,
        subsequent_discrepancies: row.get(25)?,
        created_at: row.get(26)?,
        updated_at: row.get(27)?,
    })
}
