//! Charges: creation, coin picking, cancellation and reconciliation
//!
//! A charge is created as a draft in the merchant's currency. Picking a coin
//! fixes the coin amount and binds a fresh address (or Lightning invoice),
//! after which [`RefreshOrchestrator`] tracks it until it reaches a final
//! status.

mod refresh;
pub mod state_machine;

pub use refresh::{RefreshOrchestrator, RefreshOutcome};

use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::db::{ChargeQueries, Database};
use crate::lightning::LightningClient;
use crate::models::{Charge, Coin};
use crate::prices::PriceOracle;
use crate::wallet::AddressDerivationService;
use crate::{PayError, PayResult};

/// Largest amount that fits the store's 8-decimal fixed-point integers
const MAX_TOTAL: i64 = 92_233_720_369;

/// Satoshis per bitcoin
const SATS_PER_BTC: i64 = 100_000_000;

/// Entry points the web layer uses to manage charges
pub struct ChargeService {
    config: Arc<Config>,
    db: Arc<Database>,
    wallets: Arc<AddressDerivationService>,
    prices: Arc<dyn PriceOracle>,
    lightning: Option<Arc<dyn LightningClient>>,
    /// Held from loading a charge to saving it in pick and cancel, so a
    /// charge is picked once and no address index is handed out twice
    pick_lock: Mutex<()>,
}

impl ChargeService {
    /// Create the service
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        wallets: Arc<AddressDerivationService>,
        prices: Arc<dyn PriceOracle>,
        lightning: Option<Arc<dyn LightningClient>>,
    ) -> Self {
        Self {
            config,
            db,
            wallets,
            prices,
            lightning,
            pick_lock: Mutex::new(()),
        }
    }

    /// Coins with a configured wallet whose payments can be detected
    ///
    /// XMR needs monero-wallet-rpc on top of the wallet.
    pub fn configured_coins(&self) -> Vec<Coin> {
        self.wallets
            .configured_coins()
            .into_iter()
            .filter(|coin| self.can_detect_payments(*coin))
            .collect()
    }

    fn can_detect_payments(&self, coin: Coin) -> bool {
        match coin {
            Coin::Btc => true,
            Coin::Xmr => self.config.xmr.node_enabled,
        }
    }

    /// Create a draft charge for `total` in `currency`
    ///
    /// `currency` is a supported fiat, a configured coin or `sats`.
    pub async fn create_charge(
        &self,
        total: &str,
        currency: &str,
        merchant_order_id: Option<String>,
    ) -> PayResult<Charge> {
        let currency = currency.trim().to_lowercase();
        self.validate_currency(&currency)?;
        let total = self.validate_total(total, &currency)?;

        let mut charge = Charge::new_draft(
            total,
            &currency,
            self.config.time_to_pay_ms(),
            self.config.time_to_complete_ms(),
            Utc::now(),
        );
        charge.merchant_order_id = merchant_order_id.filter(|id| !id.is_empty());

        ChargeQueries::new(&self.db).insert(&charge).await?;
        Ok(charge)
    }

    fn is_fiat(&self, currency: &str) -> bool {
        self.config
            .charges
            .supported_fiats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(currency))
    }

    fn validate_currency(&self, currency: &str) -> PayResult<()> {
        if self.is_fiat(currency) {
            return Ok(());
        }
        let coin_name = if currency == "sats" { "btc" } else { currency };
        match Coin::from_str(coin_name) {
            Ok(coin) => self.ensure_configured(coin),
            Err(_) => Err(PayError::Validation(format!("Unsupported currency '{}'", currency))),
        }
    }

    fn ensure_configured(&self, coin: Coin) -> PayResult<()> {
        if self.configured_coins().contains(&coin) {
            Ok(())
        } else if self.wallets.configured_coins().contains(&coin) {
            Err(PayError::Validation(format!(
                "No node configured to detect {} payments",
                coin
            )))
        } else {
            Err(PayError::Validation(format!(
                "No wallet configured for {} {}",
                self.config.cc_network(coin),
                coin
            )))
        }
    }

    fn validate_total(&self, total: &str, currency: &str) -> PayResult<Decimal> {
        let total = total.trim();
        if total.is_empty() {
            return Err(PayError::Validation("Amount cannot be empty".to_string()));
        }
        let total = Decimal::from_str(total)
            .or_else(|_| Decimal::from_scientific(total))
            .map_err(|_| PayError::Validation("Invalid amount".to_string()))?;

        if total <= Decimal::ZERO {
            return Err(PayError::Validation("Amount must be positive".to_string()));
        }
        if self.is_fiat(currency) && total < Decimal::new(1, 2) {
            return Err(PayError::Validation("Amount too small".to_string()));
        }
        if currency == "sats" {
            if total < Decimal::ONE {
                return Err(PayError::Validation("Amount too small".to_string()));
            }
            if !total.fract().is_zero() {
                return Err(PayError::Validation("Amount in sats can't have decimals".to_string()));
            }
        } else if Coin::from_str(currency).is_ok() && total < Decimal::new(1, 8) {
            // Below the store's precision
            return Err(PayError::Validation("Amount too small".to_string()));
        }
        if total >= Decimal::from(MAX_TOTAL) {
            return Err(PayError::Validation("Amount too large".to_string()));
        }
        Ok(total)
    }

    /// Charge by uid
    pub async fn get_charge(&self, uid: &str) -> PayResult<Charge> {
        ChargeQueries::new(&self.db)
            .get_by_uid(uid)
            .await?
            .ok_or_else(|| PayError::NotFound(format!("Charge {}", uid)))
    }

    /// Settle the draft charge `uid` in `coin`, on-chain or over Lightning
    ///
    /// Fixes `cc_total` at the current price and binds the next unused
    /// address of the coin's wallet (or a new invoice), then activates the
    /// charge. Concurrent picks of one charge: the first wins, the others
    /// fail with a validation error.
    pub async fn pick_cryptocurrency(&self, uid: &str, coin: Coin, lightning: bool) -> PayResult<Charge> {
        let _guard = self.pick_lock.lock().await;
        let mut charge = self.get_charge(uid).await?;
        if !charge.is_draft() {
            return Err(PayError::Validation(format!(
                "Charge is not a draft, unexpected status={}",
                charge.status
            )));
        }
        self.ensure_configured(coin)?;
        if lightning && coin != Coin::Btc {
            return Err(PayError::UnsupportedCoin(format!("Lightning is not available for {}", coin)));
        }

        if charge.currency == "sats" {
            charge.currency = Coin::Btc.as_str().to_string();
            charge.total /= Decimal::from(SATS_PER_BTC);
        }

        let cc_price = self.prices.price(coin, &charge.currency)?;
        if cc_price <= Decimal::ZERO {
            return Err(PayError::PriceMissing(format!("{}/{}", coin, charge.currency)));
        }
        let cc_total = charge
            .total
            .checked_div(cc_price)
            .map(|t| t.round_dp(8))
            .filter(|t| *t > Decimal::ZERO)
            .ok_or_else(|| PayError::Validation("Amount too small".to_string()))?;

        charge.cc_currency = Some(coin);
        charge.cc_price = Some(cc_price);
        charge.cc_total = Some(cc_total);
        charge.usd_total = self
            .prices
            .usd_price(coin)
            .ok()
            .map(|usd| (cc_total * usd).round_dp(2));

        let queries = ChargeQueries::new(&self.db);
        if lightning {
            let client = self
                .lightning
                .as_ref()
                .ok_or_else(|| PayError::UnsupportedCoin("Lightning is not enabled".to_string()))?;
            let expiry_seconds = self.config.charges.payment_timeout_minutes * 60;
            let payment_request = client
                .create_invoice(Some(cc_total), Some(charge.description()), Some(expiry_seconds))
                .await?;
            charge.cc_lightning_payment_request = Some(payment_request);
            charge.advance_to_awaiting(Utc::now());
            queries.save(&mut charge).await?;
        } else {
            let (fingerprint, index, address) = self.wallets.next_unused_address(coin).await?;
            charge.wallet_fingerprint = Some(fingerprint);
            charge.address_derivation_index = Some(index);
            charge.cc_address = Some(address);
            charge.advance_to_awaiting(Utc::now());
            queries.save(&mut charge).await?;
        }

        info!(
            "Charge {} picked {} {} at price {} {}",
            charge.short_uid(),
            cc_total,
            coin,
            cc_price,
            charge.currency
        );
        Ok(charge)
    }

    /// Cancel a charge that has not reached a final status
    pub async fn cancel_charge(&self, uid: &str) -> PayResult<Charge> {
        let _guard = self.pick_lock.lock().await;
        let mut charge = self.get_charge(uid).await?;
        if charge.has_final_status() {
            return Err(PayError::Validation(format!(
                "Charge cannot be cancelled, status={}",
                charge.status
            )));
        }
        charge.advance_to_cancelled(Utc::now());
        ChargeQueries::new(&self.db).save(&mut charge).await?;
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::lightning::testing::StubLightning;
    use crate::models::{ChargeStatus, PayStatus};
    use crate::net::HttpClient;
    use crate::prices::PriceTickers;
    use rust_decimal_macros::dec;

    const GOLDEN_ZPUB: &str = "zpub6oMKbeQTqZyz7mbfjdSBXbHwyXYYwEN5sDSV48rLqRk6rnLELQCnnG1GqKju3DwjKX7C8MkfTWjLUPCM6RoCMnTskbvQqaDSaatwVtBQVPL";

    const XMR_ADDRESS: &str = "453M2eBkgWT7P2aDsiTTzr4ohBGfCSCjnRpbQXMHjL8bRgzb6hae9UbFRg6eKF9CvKMtA8uRc9SroZHBkqzuhQB7MGAEGvP";
    const XMR_VIEW_KEY: &str = "eca6ba6f85df40096867a44cf7b516dc754c0ad7682933188a30b93e9a32ff0c";

    async fn service(lightning: Option<Arc<dyn LightningClient>>) -> ChargeService {
        let mut config = Config::default();
        config.btc.account_xpub = Some(GOLDEN_ZPUB.to_string());
        service_with(config, lightning).await
    }

    /// BTC plus an XMR wallet, watched through monero-wallet-rpc or not
    async fn xmr_service(node_enabled: bool) -> ChargeService {
        let mut config = Config::default();
        config.btc.account_xpub = Some(GOLDEN_ZPUB.to_string());
        config.xmr.main_address = Some(XMR_ADDRESS.to_string());
        config.xmr.secret_view_key = Some(XMR_VIEW_KEY.to_string());
        config.xmr.node_enabled = node_enabled;
        service_with(config, None).await
    }

    async fn service_with(config: Config, lightning: Option<Arc<dyn LightningClient>>) -> ChargeService {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let config = Arc::new(config);

        let wallets = Arc::new(AddressDerivationService::from_config(&config, db.clone()).unwrap());
        let prices = Arc::new(PriceTickers::new(
            HttpClient::new(&NetConfig::default()).unwrap(),
            config.charges.supported_fiats.clone(),
        ));
        prices.set_price(Coin::Btc, "usd", dec!(50000), Utc::now());
        prices.set_price(Coin::Btc, "eur", dec!(40000), Utc::now());
        prices.set_price(Coin::Xmr, "usd", dec!(200), Utc::now());

        ChargeService::new(config, db, wallets, prices, lightning)
    }

    fn validation_message(result: PayResult<Charge>) -> String {
        match result {
            Err(PayError::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_charge_validation() {
        let service = service(None).await;

        let charge = service.create_charge("12.50", "USD", Some("order-1".to_string())).await.unwrap();
        assert!(charge.is_draft());
        assert_eq!(charge.currency, "usd");
        assert_eq!(charge.total, dec!(12.50));
        assert_eq!(charge.time_to_pay_ms, 15 * 60 * 1000);

        assert!(service.create_charge("0.0001", "btc", None).await.is_ok());
        assert!(service.create_charge("1000", "sats", None).await.is_ok());

        assert_eq!(validation_message(service.create_charge("", "usd", None).await), "Amount cannot be empty");
        assert_eq!(validation_message(service.create_charge("abc", "usd", None).await), "Invalid amount");
        assert_eq!(validation_message(service.create_charge("-1", "usd", None).await), "Amount must be positive");
        assert_eq!(validation_message(service.create_charge("0.001", "eur", None).await), "Amount too small");
        assert_eq!(validation_message(service.create_charge("0.000000001", "btc", None).await), "Amount too small");
        assert_eq!(
            validation_message(service.create_charge("1.5", "sats", None).await),
            "Amount in sats can't have decimals"
        );
        assert_eq!(
            validation_message(service.create_charge("92233720369", "usd", None).await),
            "Amount too large"
        );
        assert!(validation_message(service.create_charge("1", "doge", None).await).starts_with("Unsupported currency"));
        assert_eq!(
            validation_message(service.create_charge("1", "xmr", None).await),
            "No wallet configured for mainnet xmr"
        );
    }

    #[tokio::test]
    async fn test_xmr_is_refused_without_wallet_rpc() {
        let service = xmr_service(false).await;
        assert_eq!(service.configured_coins(), vec![Coin::Btc]);
        assert_eq!(
            validation_message(service.create_charge("1", "xmr", None).await),
            "No node configured to detect xmr payments"
        );

        let charge = service.create_charge("100", "usd", None).await.unwrap();
        assert_eq!(
            validation_message(service.pick_cryptocurrency(&charge.uid, Coin::Xmr, false).await),
            "No node configured to detect xmr payments"
        );
        assert!(service.get_charge(&charge.uid).await.unwrap().is_draft());
    }

    #[tokio::test]
    async fn test_xmr_pick_with_wallet_rpc() {
        let service = xmr_service(true).await;
        assert_eq!(service.configured_coins(), vec![Coin::Btc, Coin::Xmr]);

        let charge = service.create_charge("100", "usd", None).await.unwrap();
        let picked = service.pick_cryptocurrency(&charge.uid, Coin::Xmr, false).await.unwrap();
        assert_eq!(picked.cc_total, Some(dec!(0.5)));
        assert_eq!(picked.cc_currency, Some(Coin::Xmr));
        assert!(picked.cc_address.is_some());
        assert_eq!(picked.status, ChargeStatus::Awaiting);
    }

    #[tokio::test]
    async fn test_pick_fixes_price_and_binds_address() {
        let service = service(None).await;
        let charge = service.create_charge("100", "usd", None).await.unwrap();

        let picked = service.pick_cryptocurrency(&charge.uid, Coin::Btc, false).await.unwrap();
        assert_eq!(picked.status, ChargeStatus::Awaiting);
        assert_eq!(picked.pay_status, PayStatus::Unpaid);
        assert_eq!(picked.cc_price, Some(dec!(50000)));
        assert_eq!(picked.cc_total, Some(dec!(0.002)));
        assert_eq!(picked.usd_total, Some(dec!(100)));
        assert_eq!(picked.cc_address.as_deref(), Some("bc1q9uu4j9xgkppqx3g28ph30zrjte8fs7jaz79uf3"));
        assert_eq!(picked.address_derivation_index, Some(0));
        assert!(picked.activated_at.is_some());

        let stored = service.get_charge(&charge.uid).await.unwrap();
        assert_eq!(stored.cc_total, picked.cc_total);

        // Not a draft anymore
        assert!(service.pick_cryptocurrency(&charge.uid, Coin::Btc, false).await.is_err());
    }

    #[tokio::test]
    async fn test_pick_assigns_sequential_indexes() {
        let service = service(None).await;
        let mut addresses = Vec::new();
        for expected in 0..3 {
            let charge = service.create_charge("1", "eur", None).await.unwrap();
            let picked = service.pick_cryptocurrency(&charge.uid, Coin::Btc, false).await.unwrap();
            assert_eq!(picked.address_derivation_index, Some(expected));
            assert_eq!(picked.cc_total, Some(dec!(0.000025)));
            addresses.push(picked.cc_address.unwrap());
        }
        addresses.dedup();
        assert_eq!(addresses.len(), 3);
    }

    async fn pick_twice(service: Arc<ChargeService>, uid: &str, lightning: bool) -> Vec<PayResult<Charge>> {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let service = service.clone();
            let barrier = barrier.clone();
            let uid = uid.to_string();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                service.pick_cryptocurrency(&uid, Coin::Btc, lightning).await
            }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_picks_of_one_charge() {
        let service = Arc::new(service(None).await);
        let charge = service.create_charge("1", "eur", None).await.unwrap();

        let results = pick_twice(service.clone(), &charge.uid, false).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(PayError::Validation(m)) if m.starts_with("Charge is not a draft"))));
        assert_eq!(
            service.get_charge(&charge.uid).await.unwrap().address_derivation_index,
            Some(0)
        );

        // The index count is still consistent for the next charge
        let next = service.create_charge("1", "eur", None).await.unwrap();
        let picked = service.pick_cryptocurrency(&next.uid, Coin::Btc, false).await.unwrap();
        assert_eq!(picked.address_derivation_index, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lightning_picks_create_one_invoice() {
        let stub = Arc::new(StubLightning::new("lnbc1stub", None));
        let service = Arc::new(service(Some(stub.clone() as Arc<dyn LightningClient>)).await);
        let charge = service.create_charge("10", "usd", None).await.unwrap();

        let results = pick_twice(service, &charge.uid, true).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(stub.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pick_sats_normalizes_to_btc() {
        let service = service(None).await;
        let charge = service.create_charge("12345", "sats", None).await.unwrap();
        let picked = service.pick_cryptocurrency(&charge.uid, Coin::Btc, false).await.unwrap();
        assert_eq!(picked.currency, "btc");
        assert_eq!(picked.total, dec!(0.00012345));
        assert_eq!(picked.cc_price, Some(Decimal::ONE));
        assert_eq!(picked.cc_total, Some(dec!(0.00012345)));
    }

    #[tokio::test]
    async fn test_pick_lightning_creates_invoice() {
        let stub = Arc::new(StubLightning::new("lnbc1stub", None));
        let service = service(Some(stub.clone() as Arc<dyn LightningClient>)).await;
        let charge = service.create_charge("10", "usd", None).await.unwrap();

        let picked = service.pick_cryptocurrency(&charge.uid, Coin::Btc, true).await.unwrap();
        assert!(picked.is_lightning());
        assert!(picked.cc_address.is_none());
        assert!(picked.address_derivation_index.is_none());
        assert_eq!(picked.status, ChargeStatus::Awaiting);

        let created = stub.created.lock().unwrap().clone();
        assert_eq!(created, vec![(Some(dec!(0.0002)), Some(15 * 60))]);
    }

    #[tokio::test]
    async fn test_pick_without_price_fails() {
        let service = service(None).await;
        let charge = service.create_charge("10", "gbp", None).await.unwrap();
        assert!(matches!(
            service.pick_cryptocurrency(&charge.uid, Coin::Btc, false).await,
            Err(PayError::PriceMissing(_))
        ));
        assert!(service.get_charge(&charge.uid).await.unwrap().is_draft());
    }

    #[tokio::test]
    async fn test_cancel_charge() {
        let service = service(None).await;
        let charge = service.create_charge("10", "usd", None).await.unwrap();

        let cancelled = service.cancel_charge(&charge.uid).await.unwrap();
        assert_eq!(cancelled.status, ChargeStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        assert!(service.cancel_charge(&charge.uid).await.is_err());
        assert!(matches!(service.cancel_charge("missing").await, Err(PayError::NotFound(_))));
    }
}
