//! Full-time background jobs

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::Job;
use crate::explorers::HeightTracker;
use crate::prices::PriceTickers;

/// Refreshes the price tickers
pub struct PriceRefreshJob {
    prices: Arc<PriceTickers>,
}

impl PriceRefreshJob {
    /// Create the job
    pub fn new(prices: Arc<PriceTickers>) -> Self {
        Self { prices }
    }
}

#[async_trait]
impl Job for PriceRefreshJob {
    async fn run(&self) {
        if let Err(e) = self.prices.refresh().await {
            warn!("Price refresh failed: {}", e);
        }
    }
}

/// Refreshes the stored blockchain heights
pub struct HeightRefreshJob {
    heights: Arc<HeightTracker>,
}

impl HeightRefreshJob {
    /// Create the job
    pub fn new(heights: Arc<HeightTracker>) -> Self {
        Self { heights }
    }
}

#[async_trait]
impl Job for HeightRefreshJob {
    async fn run(&self) {
        if let Err(e) = self.heights.refresh_all().await {
            warn!("Blockchain height refresh failed: {}", e);
        }
    }
}
