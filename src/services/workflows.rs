//! The recurring workflows driven by the job coordinator.

use crate::error::{AppError, Result};
use crate::services::batch::PacedBatch;
use crate::services::collaborators::{BarSource, StorageBackend};
use crate::services::jobs::Job;
use crate::services::monitor::InterestRegistry;
use crate::services::price_cache::PriceCache;
use crate::services::screening::ScreeningEngine;
use crate::sources::SubscriptionManager;
use crate::types::{FundamentalMetrics, ValuationRatios};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SCREENING_JOB: &str = "screening";
pub const PRICE_REFRESH_JOB: &str = "price_refresh";
pub const VALUATION_REFRESH_JOB: &str = "valuation_refresh";

/// Instruments the process currently cares about: the screened set and
/// client interests. Anything else held in the cache is on its way out.
async fn tracked_ids(
    storage: &dyn StorageBackend,
    interests: &InterestRegistry,
) -> Result<Vec<String>> {
    let mut ids: BTreeSet<String> = storage
        .read_screened_set()
        .await?
        .into_iter()
        .map(|s| s.instrument_id)
        .collect();
    ids.extend(interests.ids());
    Ok(ids.into_iter().collect())
}

/// Re-screen the universe, point realtime subscriptions at the result and
/// release cached series nobody tracks any more.
pub struct ScreeningJob {
    engine: ScreeningEngine,
    cache: Arc<PriceCache>,
    feed: Arc<dyn SubscriptionManager>,
    interests: Arc<InterestRegistry>,
}

impl ScreeningJob {
    pub fn new(
        engine: ScreeningEngine,
        cache: Arc<PriceCache>,
        feed: Arc<dyn SubscriptionManager>,
        interests: Arc<InterestRegistry>,
    ) -> Self {
        Self {
            engine,
            cache,
            feed,
            interests,
        }
    }
}

#[async_trait]
impl Job for ScreeningJob {
    fn name(&self) -> &str {
        SCREENING_JOB
    }

    async fn run(&self) -> Result<()> {
        let set = self.engine.run().await?;

        // Client interests first so they keep their slot under the venue cap.
        let mut desired = self.interests.ids();
        desired.extend(set.iter().map(|s| s.instrument_id.clone()));

        let missing: Vec<String> = desired
            .iter()
            .filter(|id| self.cache.get_series(id).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.cache.hydrate(&missing).await;
        }

        let report = self.feed.reconcile(&desired).await;
        if !report.skipped.is_empty() {
            warn!(
                "Screening left {} instruments unsubscribed: {:?}",
                report.skipped.len(),
                report.skipped
            );
        }

        let keep: HashSet<&String> = desired.iter().collect();
        let dropped: Vec<String> = self
            .cache
            .instrument_ids()
            .into_iter()
            .filter(|id| !keep.contains(id) && !self.interests.contains(id))
            .collect();
        if !dropped.is_empty() {
            self.cache.evict(&dropped);
        }
        Ok(())
    }
}

/// Pull fresh daily bars for every tracked instrument, store them and roll
/// the cache forward.
pub struct PriceRefreshJob {
    source: Arc<dyn BarSource>,
    storage: Arc<dyn StorageBackend>,
    cache: Arc<PriceCache>,
    interests: Arc<InterestRegistry>,
    batch: PacedBatch,
}

impl PriceRefreshJob {
    pub fn new(
        source: Arc<dyn BarSource>,
        storage: Arc<dyn StorageBackend>,
        cache: Arc<PriceCache>,
        interests: Arc<InterestRegistry>,
        batch: PacedBatch,
    ) -> Self {
        Self {
            source,
            storage,
            cache,
            interests,
            batch,
        }
    }
}

#[async_trait]
impl Job for PriceRefreshJob {
    fn name(&self) -> &str {
        PRICE_REFRESH_JOB
    }

    async fn run(&self) -> Result<()> {
        let ids = tracked_ids(self.storage.as_ref(), &self.interests).await?;
        if ids.is_empty() {
            info!("No tracked instruments, nothing to refresh");
            return Ok(());
        }

        let source = Arc::clone(&self.source);
        let storage = Arc::clone(&self.storage);
        let report = self
            .batch
            .run("price refresh", &ids, move |id| {
                let source = Arc::clone(&source);
                let storage = Arc::clone(&storage);
                async move {
                    let bars = source.fetch_daily_bars(&id).await?;
                    if bars.is_empty() {
                        return Err(AppError::ExternalApi(format!("no bars returned for {}", id)));
                    }
                    storage.replace_price_history(&id, &bars).await
                }
            })
            .await;

        self.cache.refresh(&report.succeeded).await;

        if report.succeeded.is_empty() {
            return Err(AppError::Job {
                job: PRICE_REFRESH_JOB.to_string(),
                reason: format!("all {} fetches failed", report.failed.len()),
            });
        }
        Ok(())
    }
}

/// PER / PBR from an instrument's latest price and stored per-share figures.
/// `None` when neither ratio can be formed.
pub fn compute_valuation(metrics: &FundamentalMetrics, price: f64) -> Option<ValuationRatios> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let ratio = |per_share: Option<f64>| {
        per_share
            .filter(|v| v.is_finite() && *v != 0.0)
            .map(|v| price / v)
    };
    let per = ratio(metrics.eps);
    let pbr = ratio(metrics.bps);
    if per.is_none() && pbr.is_none() {
        return None;
    }
    Some(ValuationRatios {
        instrument_id: metrics.instrument_id.clone(),
        per,
        pbr,
        price,
    })
}

/// Recompute valuation ratios for tracked instruments from cached prices.
pub struct ValuationRefreshJob {
    storage: Arc<dyn StorageBackend>,
    cache: Arc<PriceCache>,
    interests: Arc<InterestRegistry>,
}

impl ValuationRefreshJob {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cache: Arc<PriceCache>,
        interests: Arc<InterestRegistry>,
    ) -> Self {
        Self {
            storage,
            cache,
            interests,
        }
    }
}

#[async_trait]
impl Job for ValuationRefreshJob {
    fn name(&self) -> &str {
        VALUATION_REFRESH_JOB
    }

    async fn run(&self) -> Result<()> {
        let ids = tracked_ids(self.storage.as_ref(), &self.interests).await?;
        let mut written = 0usize;

        for id in &ids {
            let Some(price) = self.cache.latest_price(id) else {
                debug!("No price for {}, skipping valuation", id);
                continue;
            };
            let metrics = match self.storage.read_latest_fundamentals(id).await {
                Ok(Some(metrics)) => metrics,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read fundamentals for {}: {}", id, e);
                    continue;
                }
            };
            let Some(ratios) = compute_valuation(&metrics, price) else {
                continue;
            };
            match self.storage.write_valuation(&ratios).await {
                Ok(()) => written += 1,
                Err(e) => warn!("Failed to write valuation for {}: {}", id, e),
            }
        }

        info!("Updated valuation for {} of {} instruments", written, ids.len());
        Ok(())
    }
}
