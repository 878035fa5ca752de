//! Coin exchange rates
//!
//! Prices are refreshed in the background and read synchronously when a coin
//! is picked for a charge. A price older than [`PRICE_FRESHNESS_MINUTES`] counts as
//! missing, which blocks new charges but not the processing of active ones.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::models::Coin;
use crate::net::{decimal_from_json, HttpClient};
use crate::{PayError, PayResult};

/// Maximum age of a usable price
pub const PRICE_FRESHNESS_MINUTES: i64 = 20;

/// Source of coin prices
pub trait PriceOracle: Send + Sync {
    /// Units of `fiat` one `coin` buys; 1 when `fiat` is the coin itself
    fn price(&self, coin: Coin, fiat: &str) -> PayResult<Decimal>;

    /// USD price of `coin`
    fn usd_price(&self, coin: Coin) -> PayResult<Decimal> {
        self.price(coin, "usd")
    }
}

#[derive(Default)]
struct Snapshot {
    prices: HashMap<(Coin, String), Decimal>,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory price cache fed from CoinGecko
pub struct PriceTickers {
    http: HttpClient,
    fiats: Vec<String>,
    snapshot: RwLock<Snapshot>,
}

impl PriceTickers {
    /// Create an empty cache for the given fiat currencies
    pub fn new(http: HttpClient, fiats: Vec<String>) -> Self {
        let mut fiats: Vec<String> = fiats.into_iter().map(|f| f.to_lowercase()).collect();
        if !fiats.iter().any(|f| f == "usd") {
            fiats.push("usd".to_string());
        }
        Self {
            http,
            fiats,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    fn api_url(&self) -> String {
        format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={},{}&vs_currencies={}",
            coingecko_id(Coin::Btc),
            coingecko_id(Coin::Xmr),
            self.fiats.join(",")
        )
    }

    /// Fetch fresh prices for every coin and fiat
    ///
    /// On failure the previous prices stay in place until they go stale.
    pub async fn refresh(&self) -> PayResult<()> {
        let body: Value = self.http.get_json(&self.api_url()).await?;
        let prices = parse_simple_price(&body, &self.fiats);
        if prices.is_empty() {
            warn!("Price source returned no usable prices");
            return Err(PayError::Transient("No usable prices".to_string()));
        }

        let count = prices.len();
        self.store(prices, Utc::now());
        info!("Updated {} price tickers", count);
        Ok(())
    }

    /// Set one price directly
    pub fn set_price(&self, coin: Coin, fiat: &str, price: Decimal, at: DateTime<Utc>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        snapshot.prices.insert((coin, fiat.to_lowercase()), price);
        snapshot.updated_at = Some(at);
    }

    fn store(&self, prices: HashMap<(Coin, String), Decimal>, at: DateTime<Utc>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        snapshot.prices.extend(prices);
        snapshot.updated_at = Some(at);
    }

    fn lookup(&self, coin: Coin, fiat: &str, now: DateTime<Utc>) -> PayResult<Decimal> {
        if fiat == coin.as_str() {
            return Ok(Decimal::ONE);
        }
        if !self.fiats.iter().any(|f| f == fiat) {
            return Err(PayError::Validation(format!("Unsupported currency {}", fiat)));
        }

        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        let updated_at = snapshot
            .updated_at
            .ok_or_else(|| PayError::PriceMissing("Prices not fetched yet".to_string()))?;
        if now - updated_at > Duration::minutes(PRICE_FRESHNESS_MINUTES) {
            error!("Price tickers are out of date. New charges cannot be priced, active charges are still processed.");
            return Err(PayError::PriceMissing(format!("Prices last updated at {}", updated_at)));
        }

        snapshot
            .prices
            .get(&(coin, fiat.to_string()))
            .copied()
            .ok_or_else(|| PayError::PriceMissing(format!("{}/{}", coin, fiat)))
    }
}

impl PriceOracle for PriceTickers {
    fn price(&self, coin: Coin, fiat: &str) -> PayResult<Decimal> {
        self.lookup(coin, &fiat.to_lowercase(), Utc::now())
    }
}

fn coingecko_id(coin: Coin) -> &'static str {
    match coin {
        Coin::Btc => "bitcoin",
        Coin::Xmr => "monero",
    }
}

/// Parse `{"bitcoin": {"usd": 65000.1, ...}, "monero": {...}}`
fn parse_simple_price(body: &Value, fiats: &[String]) -> HashMap<(Coin, String), Decimal> {
    let mut prices = HashMap::new();
    for coin in Coin::ALL {
        let Some(quotes) = body.get(coingecko_id(coin)) else {
            debug!("No {} quotes in price response", coin);
            continue;
        };
        for fiat in fiats {
            match quotes.get(fiat).and_then(decimal_from_json) {
                Some(price) if price > Decimal::ZERO => {
                    prices.insert((coin, fiat.clone()), price);
                }
                _ => debug!("No {}/{} quote in price response", coin, fiat),
            }
        }
    }
    prices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use rust_decimal_macros::dec;

    fn tickers() -> PriceTickers {
        let http = HttpClient::new(&NetConfig::default()).unwrap();
        PriceTickers::new(http, vec!["USD".to_string(), "eur".to_string()])
    }

    #[test]
    fn test_same_coin_is_one() {
        assert_eq!(tickers().price(Coin::Btc, "btc").unwrap(), Decimal::ONE);
        assert_eq!(tickers().price(Coin::Xmr, "XMR").unwrap(), Decimal::ONE);
    }

    #[test]
    fn test_missing_until_fetched() {
        let tickers = tickers();
        assert!(matches!(tickers.price(Coin::Btc, "usd"), Err(PayError::PriceMissing(_))));
        assert!(matches!(tickers.price(Coin::Btc, "pln"), Err(PayError::Validation(_))));
    }

    #[test]
    fn test_stale_prices_are_missing() {
        let tickers = tickers();
        let now = Utc::now();
        tickers.set_price(Coin::Btc, "usd", dec!(50000), now - Duration::minutes(5));
        assert_eq!(tickers.lookup(Coin::Btc, "usd", now).unwrap(), dec!(50000));
        assert_eq!(tickers.usd_price(Coin::Btc).unwrap(), dec!(50000));

        let later = now + Duration::minutes(16);
        assert!(matches!(tickers.lookup(Coin::Btc, "usd", later), Err(PayError::PriceMissing(_))));
    }

    #[test]
    fn test_parse_simple_price() {
        let body: Value = serde_json::from_str(
            r#"{"bitcoin": {"usd": 65000.12, "eur": 60000}, "monero": {"usd": 160.5}}"#,
        )
        .unwrap();
        let fiats = vec!["usd".to_string(), "eur".to_string()];
        let prices = parse_simple_price(&body, &fiats);

        assert_eq!(prices.len(), 3);
        assert_eq!(prices[&(Coin::Btc, "usd".to_string())], dec!(65000.12));
        assert_eq!(prices[&(Coin::Xmr, "usd".to_string())], dec!(160.5));
        assert!(!prices.contains_key(&(Coin::Xmr, "eur".to_string())));
    }
}
