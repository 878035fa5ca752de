//! One reconciliation pass per charge

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state_machine::{apply_credits, expire_if_due};
use crate::config::Config;
use crate::db::{ChargeQueries, CoinQueries, Database};
use crate::explorers::QuorumCreditVerifier;
use crate::lightning::{payment_hash, LightningClient, LightningInvoice};
use crate::models::{AddressCredits, Charge, ChargeStatus, Coin, Credit};
use crate::node::FullNodes;
use crate::PayResult;

/// Depth given to a settled Lightning payment so it counts as fully confirmed
const LIGHTNING_FAKE_DEPTH: u64 = 65535;

/// What a refresh pass ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Draft, unknown, or no longer payable
    Skipped,
    /// No trustworthy credits this round; payment state untouched
    NoData,
    /// Credits fetched but nothing changed
    Unchanged,
    /// The charge was saved
    Persisted,
    /// Store error; retried on the next tick
    Failed,
}

/// Reconciles charges against the network
pub struct RefreshOrchestrator {
    config: Arc<Config>,
    db: Arc<Database>,
    quorum: Arc<QuorumCreditVerifier>,
    full_nodes: FullNodes,
    lightning: Option<Arc<dyn LightningClient>>,
}

impl RefreshOrchestrator {
    /// Create an orchestrator
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        quorum: Arc<QuorumCreditVerifier>,
        full_nodes: FullNodes,
        lightning: Option<Arc<dyn LightningClient>>,
    ) -> Self {
        Self {
            config,
            db,
            quorum,
            full_nodes,
            lightning,
        }
    }

    /// Reconcile the charge `uid`
    ///
    /// Never fails: fetch problems mean no data this round and store errors
    /// are logged. Safe to call at any time, concurrently for different charges.
    pub async fn refresh_charge(&self, uid: &str) -> RefreshOutcome {
        match self.refresh_at(uid, Utc::now()).await {
            Ok(outcome) => {
                debug!("Refresh of charge {} ended with {:?}", uid, outcome);
                outcome
            }
            Err(e) => {
                warn!("Refresh of charge {} failed: {}", uid, e);
                RefreshOutcome::Failed
            }
        }
    }

    pub(crate) async fn refresh_at(&self, uid: &str, now: DateTime<Utc>) -> PayResult<RefreshOutcome> {
        let queries = ChargeQueries::new(&self.db);
        let Some(mut charge) = queries.get_by_uid(uid).await? else {
            warn!("Refresh of unknown charge {}", uid);
            return Ok(RefreshOutcome::Skipped);
        };
        if charge.is_draft() {
            return Ok(RefreshOutcome::Skipped);
        }

        let mut dirty = false;
        if expire_if_due(&mut charge, now) {
            dirty = true;
            if charge.is_lightning() {
                // An expired invoice cannot be paid anymore
                queries.save(&mut charge).await?;
                return Ok(RefreshOutcome::Persisted);
            }
        }

        let payable = match charge.status {
            // Expired or cancelled before a coin was picked
            ChargeStatus::Expired | ChargeStatus::Cancelled if charge.cc_total.is_none() => false,
            ChargeStatus::Expired | ChargeStatus::Completed if charge.is_lightning() => false,
            _ => true,
        };
        if !payable {
            return self.finish(&queries, &mut charge, dirty, RefreshOutcome::Skipped).await;
        }

        let Some(credits) = self.fetch_credits(&mut charge, &mut dirty).await? else {
            return self.finish(&queries, &mut charge, dirty, RefreshOutcome::NoData).await;
        };

        let transition = apply_credits(&mut charge, &credits, now);
        if transition.must_persist() || dirty {
            queries.save(&mut charge).await?;
            Ok(RefreshOutcome::Persisted)
        } else {
            Ok(RefreshOutcome::Unchanged)
        }
    }

    async fn finish(
        &self,
        queries: &ChargeQueries<'_>,
        charge: &mut Charge,
        dirty: bool,
        outcome: RefreshOutcome,
    ) -> PayResult<RefreshOutcome> {
        if dirty {
            queries.save(charge).await?;
        }
        Ok(outcome)
    }

    /// Credits from the Lightning node, the coin's own node or the explorer quorum
    ///
    /// Sets `dirty` when the explorer bookkeeping on the charge changed.
    async fn fetch_credits(&self, charge: &mut Charge, dirty: &mut bool) -> PayResult<Option<AddressCredits>> {
        let Some(coin) = charge.cc_currency else {
            warn!("Charge {} is active without a coin", charge.short_uid());
            return Ok(None);
        };
        let current_height = CoinQueries::new(&self.db)
            .get_blockchain_height(coin, self.config.cc_network(coin))
            .await?;

        if charge.is_lightning() {
            return Ok(self.fetch_from_lightning(charge, current_height).await);
        }

        let Some(address) = charge.cc_address.clone() else {
            warn!("Charge {} has neither address nor payment request", charge.short_uid());
            return Ok(None);
        };

        if current_height == 0 {
            debug!("{} height unknown yet, skipping charge {}", coin, charge.short_uid());
            return Ok(None);
        }

        if let Some(node) = self.full_nodes.for_coin(coin) {
            let Some(fingerprint) = charge.wallet_fingerprint.as_deref() else {
                return Ok(None);
            };
            return match node.get_address_credits(fingerprint, &address, current_height).await {
                Ok(credits) => Ok(Some(credits)),
                Err(e) => {
                    warn!("{} node fetch for charge {} failed: {}", coin, charge.short_uid(), e);
                    Ok(None)
                }
            };
        }

        match coin {
            Coin::Btc => {
                if self.quorum.ensure_pair(charge) {
                    *dirty = true;
                }
                let discrepancies = charge.subsequent_discrepancies;
                let credits = self.quorum.fetch(charge, &address, current_height).await;
                if charge.subsequent_discrepancies != discrepancies {
                    *dirty = true;
                }
                Ok(credits)
            }
            Coin::Xmr => {
                warn!("Charge {} is in XMR but no monero-wallet-rpc is configured", charge.short_uid());
                Ok(None)
            }
        }
    }

    async fn fetch_from_lightning(&self, charge: &Charge, current_height: u64) -> Option<AddressCredits> {
        let Some(client) = &self.lightning else {
            warn!("Charge {} is a Lightning charge but Lightning is disabled", charge.short_uid());
            return None;
        };
        let payment_request = charge.cc_lightning_payment_request.as_deref()?;
        let hash = match payment_hash(payment_request) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Charge {} has an unreadable payment request: {}", charge.short_uid(), e);
                return None;
            }
        };
        match client.get_invoice(&hash).await {
            Ok(invoice) => Some(lightning_credits(&invoice, current_height)),
            Err(e) => {
                warn!("Lightning lookup for charge {} failed: {}", charge.short_uid(), e);
                None
            }
        }
    }
}

/// A settled invoice as one credit deep enough to complete the charge
fn lightning_credits(invoice: &LightningInvoice, current_height: u64) -> AddressCredits {
    let snapshot_height = current_height.max(LIGHTNING_FAKE_DEPTH);
    let mut credits = Vec::new();
    if invoice.is_settled && invoice.amount_paid_msat > 0 {
        info!("Lightning invoice settled with {} msat", invoice.amount_paid_msat);
        credits.push(Credit::confirmed(
            invoice.amount_paid_btc(),
            snapshot_height - LIGHTNING_FAKE_DEPTH,
        ));
    }
    AddressCredits::new(credits, snapshot_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorers::testing::StubExplorer;
    use crate::explorers::{BlockExplorer, ExplorerRegistry, DISCREPANCIES_THRESHOLD};
    use crate::models::PayStatus;
    use crate::node::testing::StubNode;
    use crate::node::FullNodeClient;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const H: u64 = 700_000;
    const XMR_H: u64 = 3_100_000;
    const XMR_SUBADDRESS: &str =
        "84ByzBVeBTLJKmJL3pZ7Wp3f5Y8nMxKAW6ZPRbbDYQtYEv3jxhCuEMaAH7m1HnEDq5bK1VfTVgSUTmzrD6WDspNvN7aZK4E";

    struct Fixture {
        db: Arc<Database>,
        explorer_a: Arc<StubExplorer>,
        explorer_b: Arc<StubExplorer>,
        orchestrator: RefreshOrchestrator,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let explorer_a = Arc::new(StubExplorer::new("a", None));
        let explorer_b = Arc::new(StubExplorer::new("b", None));
        let registry = Arc::new(ExplorerRegistry::with_explorers(vec![
            explorer_a.clone() as Arc<dyn BlockExplorer>,
            explorer_b.clone() as Arc<dyn BlockExplorer>,
        ]));
        let orchestrator = RefreshOrchestrator::new(
            Arc::new(Config::default()),
            db.clone(),
            Arc::new(QuorumCreditVerifier::new(registry)),
            FullNodes::default(),
            None,
        );
        Fixture {
            db,
            explorer_a,
            explorer_b,
            orchestrator,
        }
    }

    async fn set_height(db: &Database, height: u64) {
        set_coin_height(db, Coin::Btc, height).await;
    }

    async fn set_coin_height(db: &Database, coin: Coin, height: u64) {
        CoinQueries::new(db)
            .update_blockchain_height(coin, "mainnet", height)
            .await
            .unwrap();
    }

    /// An awaiting charge moved over to XMR
    async fn insert_awaiting_xmr(db: &Database, cc_total: Decimal, activated_at: DateTime<Utc>) -> Charge {
        let mut charge = insert_awaiting(db, cc_total, activated_at).await;
        charge.cc_currency = Some(Coin::Xmr);
        charge.cc_address = Some(XMR_SUBADDRESS.to_string());
        charge.wallet_fingerprint = Some("ab".repeat(32));
        ChargeQueries::new(db).save(&mut charge).await.unwrap();
        charge
    }

    async fn insert_awaiting(db: &Database, cc_total: Decimal, activated_at: DateTime<Utc>) -> Charge {
        let mut charge = Charge::new_draft(cc_total, "btc", 15 * 60 * 1000, 48 * 60 * 60 * 1000, activated_at);
        charge.cc_total = Some(cc_total);
        charge.cc_currency = Some(Coin::Btc);
        charge.cc_price = Some(Decimal::ONE);
        charge.cc_address = Some("bc1q9uu4j9xgkppqx3g28ph30zrjte8fs7jaz79uf3".to_string());
        charge.wallet_fingerprint = Some("ffffffffffffffff".to_string());
        charge.address_derivation_index = Some(0);
        charge.advance_to_awaiting(activated_at);
        ChargeQueries::new(db).insert(&charge).await.unwrap();
        charge
    }

    async fn load(db: &Database, uid: &str) -> Charge {
        ChargeQueries::new(db).get_by_uid(uid).await.unwrap().unwrap()
    }

    fn agree(fixture: &Fixture, credits: Vec<Credit>) {
        let credits = AddressCredits::new(credits, 0);
        fixture.explorer_a.set_credits(Some(credits.clone()));
        fixture.explorer_b.set_credits(Some(credits));
    }

    fn scenario_credits() -> Vec<Credit> {
        vec![
            Credit::confirmed(dec!(900), H - 1),
            Credit::confirmed(dec!(99), H),
            Credit::confirmed(dec!(1), H),
        ]
    }

    #[tokio::test]
    async fn test_scenario_confirmed_then_completed() {
        let f = fixture().await;
        let now = Utc::now();
        let charge = insert_awaiting(&f.db, dec!(1000), now).await;
        agree(&f, scenario_credits());

        set_height(&f.db, H).await;
        let outcome = f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Persisted);
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.cc_received_total, dec!(1000));
        assert_eq!(stored.confirmations, 1);
        assert_eq!(stored.pay_status, PayStatus::Confirmed);
        assert_eq!(stored.status, ChargeStatus::Awaiting);
        assert!(stored.block_explorer_1.is_some());

        set_height(&f.db, H + 1).await;
        f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.confirmations, 2);
        assert_eq!(stored.pay_status, PayStatus::Confirmed);
        assert_eq!(stored.status, ChargeStatus::Completed);
    }

    #[tokio::test]
    async fn test_unchanged_data_is_not_persisted_again() {
        let f = fixture().await;
        let now = Utc::now();
        let charge = insert_awaiting(&f.db, dec!(1), now).await;
        agree(&f, vec![Credit::unconfirmed(dec!(0.4))]);
        set_height(&f.db, H).await;

        assert_eq!(
            f.orchestrator.refresh_at(&charge.uid, now).await.unwrap(),
            RefreshOutcome::Persisted
        );
        let first = load(&f.db, &charge.uid).await;

        assert_eq!(
            f.orchestrator.refresh_at(&charge.uid, now).await.unwrap(),
            RefreshOutcome::Unchanged
        );
        let second = load(&f.db, &charge.uid).await;
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(second.pay_status, PayStatus::Underpaid);
    }

    #[tokio::test]
    async fn test_disagreement_leaves_payment_state_untouched() {
        let f = fixture().await;
        let now = Utc::now();
        let charge = insert_awaiting(&f.db, dec!(1), now).await;
        set_height(&f.db, H).await;

        agree(&f, vec![Credit::unconfirmed(dec!(0.4))]);
        f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        let before = load(&f.db, &charge.uid).await;
        assert_eq!(before.subsequent_discrepancies, 0);

        // A reports an extra credit B lacks
        f.explorer_a.set_credits(Some(AddressCredits::new(
            vec![Credit::unconfirmed(dec!(0.4)), Credit::unconfirmed(dec!(0.6))],
            0,
        )));
        let outcome = f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoData);

        let after = load(&f.db, &charge.uid).await;
        assert_eq!(after.pay_status, before.pay_status);
        assert_eq!(after.cc_received_total, before.cc_received_total);
        assert_eq!(after.confirmations, before.confirmations);
        assert_eq!(after.subsequent_discrepancies, 1);
    }

    #[tokio::test]
    async fn test_discrepancy_threshold_reassigns_pair() {
        let f = fixture().await;
        let now = Utc::now();
        let charge = insert_awaiting(&f.db, dec!(1), now).await;
        set_height(&f.db, H).await;

        let mut stored = load(&f.db, &charge.uid).await;
        stored.block_explorer_1 = Some("a".to_string());
        stored.block_explorer_2 = Some("b".to_string());
        stored.subsequent_discrepancies = DISCREPANCIES_THRESHOLD;
        ChargeQueries::new(&f.db).save(&mut stored).await.unwrap();

        agree(&f, vec![]);
        f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();

        let after = load(&f.db, &charge.uid).await;
        assert_eq!(after.subsequent_discrepancies, 0);
        assert!(after.block_explorer_1.is_some() && after.block_explorer_2.is_some());
    }

    #[tokio::test]
    async fn test_unpaid_past_deadline_expires() {
        let f = fixture().await;
        let activated = Utc::now() - Duration::minutes(18);
        let charge = insert_awaiting(&f.db, dec!(1), activated).await;
        set_height(&f.db, H).await;
        agree(&f, vec![]);

        f.orchestrator.refresh_at(&charge.uid, Utc::now()).await.unwrap();

        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.status, ChargeStatus::Expired);
        assert_eq!(stored.pay_status, PayStatus::Unpaid);
        assert!(stored.expired_at.is_some());
    }

    #[tokio::test]
    async fn test_draft_and_unknown_height_are_skipped() {
        let f = fixture().await;
        let draft = Charge::new_draft(dec!(5), "usd", 1000, 2000, Utc::now());
        ChargeQueries::new(&f.db).insert(&draft).await.unwrap();
        assert_eq!(
            f.orchestrator.refresh_at(&draft.uid, Utc::now()).await.unwrap(),
            RefreshOutcome::Skipped
        );
        assert_eq!(f.orchestrator.refresh_charge("nope").await, RefreshOutcome::Skipped);

        let charge = insert_awaiting(&f.db, dec!(1), Utc::now()).await;
        agree(&f, vec![Credit::unconfirmed(dec!(1))]);
        assert_eq!(
            f.orchestrator.refresh_at(&charge.uid, Utc::now()).await.unwrap(),
            RefreshOutcome::NoData
        );
        // No height yet
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.pay_status, PayStatus::Unpaid);
        assert_eq!(stored.updated_at, charge.updated_at);
    }

    #[tokio::test]
    async fn test_full_node_is_trusted_directly() {
        let f = fixture().await;
        let node = Arc::new(StubNode::new(H, Some(AddressCredits::new(scenario_credits(), 0))));
        let orchestrator = RefreshOrchestrator::new(
            Arc::new(Config::default()),
            f.db.clone(),
            f.orchestrator.quorum.clone(),
            FullNodes {
                btc: Some(node as Arc<dyn FullNodeClient>),
                xmr: None,
            },
            None,
        );
        let now = Utc::now();
        let charge = insert_awaiting(&f.db, dec!(1000), now).await;
        set_height(&f.db, H + 1).await;

        orchestrator.refresh_at(&charge.uid, now).await.unwrap();

        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.status, ChargeStatus::Completed);
        assert!(stored.block_explorer_1.is_none());
    }

    #[tokio::test]
    async fn test_xmr_charge_completes_through_wallet_rpc() {
        let f = fixture().await;
        let node = Arc::new(StubNode::new(XMR_H, Some(AddressCredits::new(vec![Credit::unconfirmed(dec!(1.5))], 0))));
        let orchestrator = RefreshOrchestrator::new(
            Arc::new(Config::default()),
            f.db.clone(),
            f.orchestrator.quorum.clone(),
            FullNodes {
                btc: None,
                xmr: Some(node.clone() as Arc<dyn FullNodeClient>),
            },
            None,
        );
        let now = Utc::now();
        let charge = insert_awaiting_xmr(&f.db, dec!(1.5), now).await;
        // BTC height alone does not unblock an XMR charge
        set_height(&f.db, H).await;
        assert_eq!(orchestrator.refresh_at(&charge.uid, now).await.unwrap(), RefreshOutcome::NoData);

        set_coin_height(&f.db, Coin::Xmr, XMR_H).await;
        assert_eq!(orchestrator.refresh_at(&charge.uid, now).await.unwrap(), RefreshOutcome::Persisted);
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.pay_status, PayStatus::Paid);
        assert_eq!(stored.status, ChargeStatus::Awaiting);

        node.set_credits(Some(AddressCredits::new(vec![Credit::confirmed(dec!(1.5), XMR_H - 1)], 0)));
        orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.confirmations, 2);
        assert_eq!(stored.cc_received_total, dec!(1.5));
        assert_eq!(stored.status, ChargeStatus::Completed);
        assert!(stored.block_explorer_1.is_none());
    }

    #[tokio::test]
    async fn test_xmr_charge_without_wallet_rpc_has_no_data() {
        let f = fixture().await;
        let now = Utc::now();
        let charge = insert_awaiting_xmr(&f.db, dec!(1), now).await;
        set_coin_height(&f.db, Coin::Xmr, XMR_H).await;

        let outcome = f.orchestrator.refresh_at(&charge.uid, now).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoData);
        let stored = load(&f.db, &charge.uid).await;
        assert_eq!(stored.pay_status, PayStatus::Unpaid);
        assert_eq!(stored.status, ChargeStatus::Awaiting);
    }

    #[tokio::test]
    async fn test_expired_lightning_charge_is_not_fetched() {
        let f = fixture().await;
        let activated = Utc::now() - Duration::minutes(30);
        let mut charge = insert_awaiting(&f.db, dec!(0.001), activated).await;
        charge.cc_address = None;
        charge.cc_lightning_payment_request = Some("lnbc10u1invalid".to_string());
        ChargeQueries::new(&f.db).save(&mut charge).await.unwrap();

        let outcome = f.orchestrator.refresh_at(&charge.uid, Utc::now()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Persisted);
        assert_eq!(load(&f.db, &charge.uid).await.status, ChargeStatus::Expired);

        // Expired already and no longer past a payable deadline check
        let mut stored = load(&f.db, &charge.uid).await;
        stored.pay_status = PayStatus::Paid;
        ChargeQueries::new(&f.db).save(&mut stored).await.unwrap();
        assert_eq!(
            f.orchestrator.refresh_at(&charge.uid, Utc::now()).await.unwrap(),
            RefreshOutcome::Skipped
        );
    }

    #[test]
    fn test_lightning_credits() {
        let settled = LightningInvoice {
            is_settled: true,
            amount_paid_msat: 100_000_000,
        };
        let credits = lightning_credits(&settled, H);
        assert_eq!(AddressCredits::total(&credits.confirmed_n(2)), dec!(0.001));

        // Still deep enough before the height is known
        let credits = lightning_credits(&settled, 0);
        assert_eq!(credits.confirmed_n(2).len(), 1);

        let open = LightningInvoice::default();
        assert!(lightning_credits(&open, H).any().is_empty());
    }
}
