//! One polling job per recently activated charge
//!
//! [`UpdateChargeJobs`] runs on a short fixed tick. It keeps a
//! `refresh_charge_<short uid>` job for every charge activated within
//! [`RECENT_WINDOW_DAYS`], tunes its interval to the charge's phase, and drops
//! jobs whose charge fell out of the window.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{Job, JobScheduler};
use crate::charges::RefreshOrchestrator;
use crate::db::{ChargeQueries, Database};
use crate::models::{Charge, PayStatus};
use crate::PayResult;

/// Charges activated longer ago than this are not polled
pub const RECENT_WINDOW_DAYS: i64 = 7;

const JOB_PREFIX: &str = "refresh_charge_";

/// Polling interval for a charge in its current phase
///
/// | phase | interval |
/// |---|---|
/// | completed, expired, cancelled | 30 min |
/// | paid or confirmed, paid less than 1h ago | 15 s |
/// | paid or confirmed, paid 1h to 12h ago | 3 min |
/// | paid or confirmed, paid earlier | 15 min |
/// | awaiting payment | 2 s |
pub fn interval_for_charge(charge: &Charge, now: DateTime<Utc>) -> Duration {
    if charge.has_final_status() {
        return Duration::from_secs(30 * 60);
    }
    if matches!(charge.pay_status, PayStatus::Paid | PayStatus::Confirmed) {
        let since_paid = charge.paid_at.map(|at| now - at).unwrap_or_else(ChronoDuration::zero);
        return if since_paid < ChronoDuration::hours(1) {
            Duration::from_secs(15)
        } else if since_paid < ChronoDuration::hours(12) {
            Duration::from_secs(3 * 60)
        } else {
            Duration::from_secs(15 * 60)
        };
    }
    Duration::from_secs(2)
}

/// Reconciles one charge
pub struct RefreshChargeJob {
    uid: String,
    refresher: Arc<RefreshOrchestrator>,
}

impl RefreshChargeJob {
    /// Job for the charge `uid`
    pub fn new(uid: String, refresher: Arc<RefreshOrchestrator>) -> Self {
        Self { uid, refresher }
    }
}

#[async_trait]
impl Job for RefreshChargeJob {
    async fn run(&self) {
        let outcome = self.refresher.refresh_charge(&self.uid).await;
        debug!("Refreshed charge {}: {:?}", self.uid, outcome);
    }
}

/// Keeps the set of per-charge jobs in line with the store
pub struct UpdateChargeJobs {
    scheduler: JobScheduler,
    db: Arc<Database>,
    refresher: Arc<RefreshOrchestrator>,
}

impl UpdateChargeJobs {
    /// Create the job
    pub fn new(scheduler: JobScheduler, db: Arc<Database>, refresher: Arc<RefreshOrchestrator>) -> Self {
        Self {
            scheduler,
            db,
            refresher,
        }
    }

    /// One pass over the recent charges
    pub async fn update(&self) -> PayResult<()> {
        self.update_at(Utc::now()).await
    }

    pub(crate) async fn update_at(&self, now: DateTime<Utc>) -> PayResult<()> {
        let since = now - ChronoDuration::days(RECENT_WINDOW_DAYS);
        let charges = ChargeQueries::new(&self.db).list_recently_activated(since).await?;

        let wanted: HashMap<String, (&Charge, Duration)> = charges
            .iter()
            .map(|charge| (charge.refresh_job_id(), (charge, interval_for_charge(charge, now))))
            .collect();

        for id in self.scheduler.job_ids() {
            if id.starts_with(JOB_PREFIX) && !wanted.contains_key(&id) {
                self.scheduler.remove_job(&id);
                info!("Removed job {}", id);
            }
        }

        for (id, (charge, interval)) in wanted {
            match self.scheduler.interval_of(&id) {
                None => {
                    // Spread first runs so a restart does not hit every source at once
                    let first_delay = Duration::from_millis(rand::thread_rng().gen_range(1_000..=6_000));
                    let job = RefreshChargeJob::new(charge.uid.clone(), self.refresher.clone());
                    self.scheduler.add_job(&id, interval, first_delay, Arc::new(job));
                    info!("Added job {} every {:?}", id, interval);
                }
                Some(current) if current != interval => {
                    self.scheduler.reschedule(&id, interval);
                    info!("Rescheduled job {} from {:?} to {:?}", id, current, interval);
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for UpdateChargeJobs {
    async fn run(&self) {
        if let Err(e) = self.update().await {
            error!("Updating charge jobs failed: {}", e);
        }
    }
}
