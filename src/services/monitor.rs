//! Capabilities exposed to the UI/API layer.

use crate::error::Result;
use crate::services::collaborators::StorageBackend;
use crate::services::jobs::{JobCoordinator, JobOutcome};
use crate::services::price_cache::PriceCache;
use crate::sources::{ConnectionState, ReconcileReport, SubscriptionManager, SubscriptionOutcome};
use crate::types::{PriceTick, ScreenedInstrument};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Reference-counted client interests. Screening reconciliation keeps these
/// subscribed even when they fall out of the screened set.
#[derive(Default)]
pub struct InterestRegistry {
    counts: DashMap<String, usize>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more interest. Returns true if this is the first.
    pub fn add(&self, instrument_id: &str) -> bool {
        let mut count = self.counts.entry(instrument_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one interest and return how many remain, or `None` if nobody
    /// held one.
    pub fn remove(&self, instrument_id: &str) -> Option<usize> {
        let remaining = {
            let mut count = self.counts.get_mut(instrument_id)?;
            *count = count.saturating_sub(1);
            *count
        };
        if remaining == 0 {
            self.counts.remove_if(instrument_id, |_, count| *count == 0);
        }
        Some(remaining)
    }

    pub fn contains(&self, instrument_id: &str) -> bool {
        self.counts.contains_key(instrument_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.counts.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Facade over the cache, realtime feed, storage and job coordinator.
pub struct Monitor {
    cache: Arc<PriceCache>,
    storage: Arc<dyn StorageBackend>,
    feed: Arc<dyn SubscriptionManager>,
    interests: Arc<InterestRegistry>,
    jobs: Arc<JobCoordinator>,
}

impl Monitor {
    pub fn new(
        cache: Arc<PriceCache>,
        storage: Arc<dyn StorageBackend>,
        feed: Arc<dyn SubscriptionManager>,
        interests: Arc<InterestRegistry>,
        jobs: Arc<JobCoordinator>,
    ) -> Self {
        Self {
            cache,
            storage,
            feed,
            interests,
            jobs,
        }
    }

    /// Latest realtime trade, if any has arrived.
    pub fn get_current_price(&self, instrument_id: &str) -> Option<PriceTick> {
        self.cache.get_current_price(instrument_id)
    }

    /// Register a client's interest in realtime updates for an instrument.
    ///
    /// The feed is asked every time, so an interest recorded while the
    /// connection was down gets registered by the next caller.
    pub async fn subscribe_client_interest(&self, instrument_id: &str) -> SubscriptionOutcome {
        if !self.interests.add(instrument_id) {
            debug!("Additional client interest in {}", instrument_id);
        }

        if self.cache.get_series(instrument_id).is_none() {
            self.cache.hydrate(&[instrument_id.to_string()]).await;
        }
        let outcome = self.feed.subscribe(instrument_id).await;
        info!("Client interest in {}: {:?}", instrument_id, outcome);
        outcome
    }

    /// Drop a client's interest. The realtime registration is released only
    /// when no client wants it and it is not part of the screened set.
    pub async fn unsubscribe_client_interest(&self, instrument_id: &str) -> SubscriptionOutcome {
        match self.interests.remove(instrument_id) {
            None => return SubscriptionOutcome::NotSubscribed,
            Some(remaining) if remaining > 0 => {
                debug!("{} still wanted by {} clients", instrument_id, remaining);
                return SubscriptionOutcome::AlreadySubscribed;
            }
            Some(_) => {}
        }

        match self.storage.read_screened_set().await {
            Ok(set) if set.iter().any(|s| s.instrument_id == instrument_id) => {
                debug!("{} stays subscribed: in screened set", instrument_id);
                SubscriptionOutcome::AlreadySubscribed
            }
            Ok(_) => {
                let outcome = self.feed.unsubscribe(instrument_id).await;
                // A new interest may have raced in while the feed was busy.
                if !self.interests.contains(instrument_id) {
                    self.cache.evict(&[instrument_id.to_string()]);
                }
                outcome
            }
            Err(e) => {
                warn!(
                    "Keeping {} subscribed, screened set unavailable: {}",
                    instrument_id, e
                );
                SubscriptionOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn get_screened_set(&self) -> Result<Vec<ScreenedInstrument>> {
        self.storage.read_screened_set().await
    }

    /// Everything that should be registered with the venue: client interests
    /// first, then the persisted screened set.
    pub async fn desired_subscriptions(&self) -> Result<Vec<String>> {
        let mut desired = self.interests.ids();
        desired.extend(
            self.storage
                .read_screened_set()
                .await?
                .into_iter()
                .map(|s| s.instrument_id),
        );
        Ok(desired)
    }

    /// Reconcile the feed against [`Monitor::desired_subscriptions`].
    /// Leaves the feed untouched when the screened set cannot be read.
    pub async fn resync_subscriptions(&self) -> Option<ReconcileReport> {
        let desired = match self.desired_subscriptions().await {
            Ok(desired) => desired,
            Err(e) => {
                warn!("Skipping subscription resync, screened set unavailable: {}", e);
                return None;
            }
        };

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
                "Resync left {} instruments unsubscribed: {:?}",
                report.skipped.len(),
                report.skipped
            );
        }
        Some(report)
    }

    /// Resync subscriptions each time the feed reaches `Connected`, until
    /// shutdown. Registrations refused while disconnected are picked up here.
    pub async fn run_subscription_sync(
        self: Arc<Self>,
        mut state: watch::Receiver<ConnectionState>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Subscription sync started");
        loop {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if connected {
                self.resync_subscriptions().await;
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        debug!("Connection state channel closed");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Subscription sync stopping");
                    break;
                }
            }
        }
    }

    /// Run a named job now, outside its schedule.
    pub async fn trigger_job(&self, name: &str) -> JobOutcome {
        info!("Manual trigger for job {}", name);
        self.jobs.trigger(name).await
    }
}
