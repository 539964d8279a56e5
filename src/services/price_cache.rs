use crate::config::CacheConfig;
use crate::services::collaborators::StorageBackend;
use crate::types::{PriceSeries, PriceTick};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// What happened to an applied tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Overlaid on the instrument's series.
    Applied,
    /// No series yet; held until the next hydration.
    Buffered,
    /// The tick's session is not later than the last bar.
    Stale,
}

/// Result of a hydration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationReport {
    pub loaded: Vec<String>,
    /// Instruments whose load failed, with the reason. Prior series are kept.
    pub failed: Vec<(String, String)>,
}

impl HydrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-instrument price series: stored daily bars plus the live overlay.
///
/// All mutation happens here; readers get cloned snapshots.
pub struct PriceCache {
    series: DashMap<String, PriceSeries>,
    /// Ticks that arrived before their instrument was hydrated. Last one wins.
    pending: DashMap<String, PriceTick>,
    storage: Arc<dyn StorageBackend>,
    config: CacheConfig,
    /// Broadcast of instrument ids whose series changed or was evicted.
    tx: broadcast::Sender<String>,
}

impl PriceCache {
    /// Create a new price cache.
    pub fn new(storage: Arc<dyn StorageBackend>, config: CacheConfig) -> Arc<Self> {
        let (tx, _) = broadcast::channel(config.tick_channel_capacity.max(16));
        Arc::new(Self {
            series: DashMap::new(),
            pending: DashMap::new(),
            storage,
            config,
            tx,
        })
    }

    /// Subscribe to "series updated" notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Load bars from storage for each id, replacing any prior series.
    ///
    /// A failure for one instrument leaves its prior series in place and does
    /// not stop the others.
    pub async fn hydrate(&self, instrument_ids: &[String]) -> HydrationReport {
        let mut report = HydrationReport::default();

        for id in instrument_ids {
            match self.storage.read_price_history(id).await {
                Ok(bars) => {
                    let fresh = PriceSeries::from_bars(id, bars, self.config.history_window);
                    let has_overlay = self.install(id, fresh);
                    report.loaded.push(id.clone());
                    if has_overlay {
                        let _ = self.tx.send(id.clone());
                    }
                }
                Err(e) => {
                    warn!("Failed to hydrate {}: {}", id, e);
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        debug!(
            "Hydrated {} instruments ({} failed)",
            report.loaded.len(),
            report.failed.len()
        );
        report
    }

    /// Swap in a freshly loaded series, carrying over an overlay or buffered
    /// tick that is still later than the new last bar. Returns whether the
    /// installed series has an overlay.
    fn install(&self, id: &str, mut fresh: PriceSeries) -> bool {
        let buffered = self.pending.remove(id).map(|(_, tick)| tick);
        let mut entry = self.series.entry(id.to_string()).or_insert_with(|| {
            PriceSeries {
                instrument_id: id.to_string(),
                bars: Vec::new(),
                overlay: None,
            }
        });

        // Live overlay arrived after the buffered tick, so prefer it.
        let carried = entry.overlay.take().or(buffered);
        fresh.overlay = carried.filter(|tick| fresh.accepts_session(tick.session_date));
        let has_overlay = fresh.overlay.is_some();
        *entry = fresh;
        has_overlay
    }

    /// Overlay a tick on its instrument's series.
    ///
    /// The previous overlay is replaced wholesale, so readers never observe a
    /// mix of two ticks.
    pub fn apply_tick(&self, tick: PriceTick) -> TickOutcome {
        let id = tick.instrument_id.clone();

        let outcome = match self.series.get_mut(&id) {
            Some(mut series) => {
                if series.accepts_session(tick.session_date) {
                    series.overlay = Some(tick);
                    TickOutcome::Applied
                } else {
                    TickOutcome::Stale
                }
            }
            None => {
                self.pending.insert(id.clone(), tick);
                TickOutcome::Buffered
            }
        };

        match outcome {
            TickOutcome::Applied => {
                // No receivers is fine: nobody is evaluating signals yet.
                let _ = self.tx.send(id);
            }
            TickOutcome::Stale => debug!("Ignoring tick for {} from a closed session", id),
            TickOutcome::Buffered => debug!("Buffered tick for unhydrated {}", id),
        }
        outcome
    }

    /// Consistent snapshot of an instrument's series.
    pub fn get_series(&self, instrument_id: &str) -> Option<PriceSeries> {
        self.series.get(instrument_id).map(|s| s.value().clone())
    }

    /// The latest live tick for an instrument, hydrated or not.
    pub fn get_current_price(&self, instrument_id: &str) -> Option<PriceTick> {
        self.series
            .get(instrument_id)
            .and_then(|s| s.overlay.clone())
            .or_else(|| self.pending.get(instrument_id).map(|t| t.value().clone()))
    }

    /// Latest price: the live overlay, else the last stored close.
    pub fn latest_price(&self, instrument_id: &str) -> Option<f64> {
        self.series
            .get(instrument_id)
            .and_then(|s| s.latest_price())
            .or_else(|| self.pending.get(instrument_id).map(|t| t.price))
    }

    /// Ids with a hydrated series.
    pub fn instrument_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drop the series and any buffered tick for each id. Evicted ids are
    /// announced on the update channel so subscribers can release their
    /// own per-instrument state. Returns how many ids were held.
    pub fn evict(&self, instrument_ids: &[String]) -> usize {
        let mut evicted = 0;
        for id in instrument_ids {
            let had_series = self.series.remove(id).is_some();
            let had_pending = self.pending.remove(id).is_some();
            if had_series || had_pending {
                evicted += 1;
                let _ = self.tx.send(id.clone());
            }
        }
        if evicted > 0 {
            info!("Evicted {} instruments from the price cache", evicted);
        }
        evicted
    }

    /// Re-hydrate after stored history has rolled forward. Overlays from the
    /// session that just became a bar are dropped by the hydration itself.
    pub async fn refresh(&self, instrument_ids: &[String]) -> HydrationReport {
        info!("Refreshing price series for {} instruments", instrument_ids.len());
        let report = self.hydrate(instrument_ids).await;
        if !report.is_complete() {
            warn!(
                "Refresh kept stale series for {} instruments",
                report.failed.len()
            );
        }
        report
    }

    /// Drain ticks from the realtime client until the channel closes or
    /// shutdown fires. Ticks are applied in arrival order.
    pub async fn run_tick_pump(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<PriceTick>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Price cache tick pump started");
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    match tick {
                        Some(tick) => {
                            self.apply_tick(tick);
                        }
                        None => {
                            info!("Tick channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Price cache tick pump stopping");
                    break;
                }
            }
        }
    }
}
