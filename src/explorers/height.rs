//! Blockchain height tracking

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::ExplorerRegistry;
use crate::config::Config;
use crate::db::{CoinQueries, Database};
use crate::models::Coin;
use crate::node::FullNodes;
use crate::PayResult;

/// Lower median of the reported heights
///
/// For an even count this picks the lower of the two middle values, so a
/// single explorer lying high cannot push the height up.
pub fn lower_median(mut heights: Vec<u64>) -> Option<u64> {
    if heights.is_empty() {
        return None;
    }
    heights.sort_unstable();
    Some(heights[(heights.len() - 1) / 2])
}

/// Keeps the stored per-coin blockchain height current
pub struct HeightTracker {
    config: Arc<Config>,
    db: Arc<Database>,
    registry: Arc<ExplorerRegistry>,
    full_nodes: FullNodes,
}

impl HeightTracker {
    /// Create a tracker
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        registry: Arc<ExplorerRegistry>,
        full_nodes: FullNodes,
    ) -> Self {
        Self {
            config,
            db,
            registry,
            full_nodes,
        }
    }

    /// Refresh the height of every coin with a height source
    ///
    /// BTC comes from the full node or the explorers, XMR only from
    /// monero-wallet-rpc and is skipped without one.
    pub async fn refresh_all(&self) -> PayResult<()> {
        for coin in Coin::ALL {
            if coin == Coin::Xmr && self.full_nodes.xmr.is_none() {
                continue;
            }
            match self.fetch_height(coin).await {
                Some(height) => {
                    let network = self.config.cc_network(coin);
                    let queries = CoinQueries::new(&self.db);
                    let previous = queries.get_blockchain_height(coin, network).await?;
                    if height != previous {
                        info!("New {} {} blockchain height {}", network, coin, height);
                    }
                    queries.update_blockchain_height(coin, network, height).await?;
                }
                None => warn!("Could not determine {} blockchain height: no source answered", coin),
            }
        }
        Ok(())
    }

    async fn fetch_height(&self, coin: Coin) -> Option<u64> {
        if let Some(node) = self.full_nodes.for_coin(coin) {
            return match node.get_height().await {
                Ok(height) => Some(height),
                Err(e) => {
                    warn!("{} node height query failed: {}", coin, e);
                    None
                }
            };
        }
        if coin != Coin::Btc {
            return None;
        }

        let mut tasks = JoinSet::new();
        for explorer in self.registry.all() {
            let explorer = explorer.clone();
            tasks.spawn(async move { (explorer.tag().to_string(), explorer.get_height().await) });
        }

        let mut heights = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((tag, Some(height))) => {
                    debug!("{} reports height {}", tag, height);
                    heights.push(height);
                }
                Ok((tag, None)) => debug!("{} did not report height", tag),
                Err(e) => warn!("Height task failed: {}", e),
            }
        }

        lower_median(heights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorers::testing::StubExplorer;
    use crate::explorers::BlockExplorer;
    use crate::node::testing::StubNode;
    use crate::node::FullNodeClient;

    #[test]
    fn test_lower_median() {
        assert_eq!(lower_median(vec![]), None);
        assert_eq!(lower_median(vec![7]), Some(7));
        assert_eq!(lower_median(vec![100, 99]), Some(99));
        assert_eq!(lower_median(vec![100, 101, 99]), Some(100));
        assert_eq!(lower_median(vec![5, 100, 101, 99]), Some(99));
        assert_eq!(lower_median(vec![1_000_000, 100, 100]), Some(100));
    }

    fn tracker(db: Arc<Database>, heights: Vec<Option<u64>>) -> HeightTracker {
        let explorers = heights
            .into_iter()
            .enumerate()
            .map(|(i, h)| Arc::new(StubExplorer::with_height(&format!("e{}", i), h)) as Arc<dyn BlockExplorer>)
            .collect();
        HeightTracker::new(
            Arc::new(Config::default()),
            db,
            Arc::new(ExplorerRegistry::with_explorers(explorers)),
            FullNodes::default(),
        )
    }

    #[tokio::test]
    async fn test_refresh_stores_lower_median_of_answers() {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let tracker = tracker(db.clone(), vec![Some(700_002), None, Some(700_000), Some(700_001), Some(699_999)]);

        tracker.refresh_all().await.unwrap();

        let stored = CoinQueries::new(&db)
            .get_blockchain_height(Coin::Btc, "mainnet")
            .await
            .unwrap();
        assert_eq!(stored, 700_000);
    }

    #[tokio::test]
    async fn test_refresh_without_answers_keeps_height() {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        CoinQueries::new(&db)
            .update_blockchain_height(Coin::Btc, "mainnet", 123)
            .await
            .unwrap();

        tracker(db.clone(), vec![None, None]).refresh_all().await.unwrap();

        let stored = CoinQueries::new(&db)
            .get_blockchain_height(Coin::Btc, "mainnet")
            .await
            .unwrap();
        assert_eq!(stored, 123);
    }

    #[tokio::test]
    async fn test_xmr_height_comes_from_wallet_rpc() {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let nodes = FullNodes {
            btc: None,
            xmr: Some(Arc::new(StubNode::new(3_100_000, None)) as Arc<dyn FullNodeClient>),
        };
        let xmr_tracker = HeightTracker::new(
            Arc::new(Config::default()),
            db.clone(),
            Arc::new(ExplorerRegistry::with_explorers(vec![
                Arc::new(StubExplorer::with_height("e0", Some(700_000))) as Arc<dyn BlockExplorer>,
            ])),
            nodes,
        );

        xmr_tracker.refresh_all().await.unwrap();

        let queries = CoinQueries::new(&db);
        assert_eq!(queries.get_blockchain_height(Coin::Xmr, "mainnet").await.unwrap(), 3_100_000);
        assert_eq!(queries.get_blockchain_height(Coin::Btc, "mainnet").await.unwrap(), 700_000);

        // Without a wallet-rpc the XMR height is left alone
        tracker(db.clone(), vec![Some(700_001)]).refresh_all().await.unwrap();
        assert_eq!(queries.get_blockchain_height(Coin::Xmr, "mainnet").await.unwrap(), 3_100_000);
        assert_eq!(queries.get_blockchain_height(Coin::Btc, "mainnet").await.unwrap(), 700_001);
    }
}
