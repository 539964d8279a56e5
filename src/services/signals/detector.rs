//! Edge-triggered signal detection over the price cache.

use super::indicators::IndicatorSet;
use crate::config::{IndicatorConfig, RestartPolicy};
use crate::error::{AppError, Result};
use crate::services::collaborators::{AlertSink, StorageBackend};
use crate::services::price_cache::PriceCache;
use crate::types::{
    CrossDirection, IndicatorSnapshot, PriceSeries, RsiState, SignalEvent, SignalKind,
    SignalPayload,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Re-evaluates an instrument whenever its series changes and emits a
/// [`SignalEvent`] for each condition that newly holds.
///
/// The last snapshot per instrument is the only mutable state kept here.
pub struct SignalDetector {
    cache: Arc<PriceCache>,
    storage: Arc<dyn StorageBackend>,
    sink: Arc<dyn AlertSink>,
    config: IndicatorConfig,
    restart_policy: RestartPolicy,
    snapshots: DashMap<String, IndicatorSnapshot>,
}

impl SignalDetector {
    pub fn new(
        cache: Arc<PriceCache>,
        storage: Arc<dyn StorageBackend>,
        sink: Arc<dyn AlertSink>,
        config: IndicatorConfig,
        restart_policy: RestartPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            storage,
            sink,
            config,
            restart_policy,
            snapshots: DashMap::new(),
        })
    }

    /// Last retained snapshot for an instrument.
    pub fn snapshot(&self, instrument_id: &str) -> Option<IndicatorSnapshot> {
        self.snapshots.get(instrument_id).map(|s| *s)
    }

    /// Drop retained state, so the next evaluation starts from a fresh baseline.
    pub fn forget(&self, instrument_id: &str) {
        self.snapshots.remove(instrument_id);
    }

    /// Evaluate one instrument, publish and persist any new events, and
    /// return them.
    pub async fn evaluate(&self, instrument_id: &str) -> Result<Vec<SignalEvent>> {
        let series = match self.cache.get_series(instrument_id) {
            Some(series) => series,
            None => {
                // Evicted from the cache: nothing left to compare against.
                self.forget(instrument_id);
                return Ok(Vec::new());
            }
        };

        let set = self.compute(&series)?;
        let current = snapshot_of(&set);

        let previous = match self.snapshot(instrument_id) {
            Some(prev) => prev,
            None => self.baseline(&series)?,
        };

        let kinds = transitions(&previous, &current);
        self.snapshots.insert(instrument_id.to_string(), current);

        if kinds.is_empty() {
            return Ok(Vec::new());
        }

        let payload = payload_of(&series, &set);
        let mut events = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let event = SignalEvent::new(instrument_id, kind, payload.clone());
            info!(
                "Signal {} on {} at {:.2}",
                event.kind, event.instrument_id, event.payload.price
            );

            self.sink.publish(&event);
            if let Err(e) = self.storage.write_signal_alert(&event).await {
                warn!("Failed to persist {} alert for {}: {}", kind, instrument_id, e);
            }
            events.push(event);
        }
        Ok(events)
    }

    fn compute(&self, series: &PriceSeries) -> Result<IndicatorSet> {
        let closes = series.closes();
        if closes.iter().any(|c| !c.is_finite()) {
            return Err(AppError::Indicator {
                instrument: series.instrument_id.clone(),
                reason: "non-finite close in series".to_string(),
            });
        }
        Ok(IndicatorSet::compute(&closes, &series.volumes(), &self.config))
    }

    /// Snapshot assumed for an instrument seen for the first time.
    fn baseline(&self, series: &PriceSeries) -> Result<IndicatorSnapshot> {
        match self.restart_policy {
            RestartPolicy::Rearm => Ok(IndicatorSnapshot::neutral()),
            RestartPolicy::Suppress => {
                let stored = series.without_overlay();
                Ok(snapshot_of(&self.compute(&stored)?))
            }
        }
    }

    /// Consume "series updated" notifications until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut updates: broadcast::Receiver<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Signal detector started ({:?} on first sight)", self.restart_policy);
        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Ok(instrument_id) => {
                            if let Err(e) = self.evaluate(&instrument_id).await {
                                error!("Skipping signal evaluation for {}: {}", instrument_id, e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Signal detector lagged, skipped {} updates", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Series update channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Signal detector stopping");
                    break;
                }
            }
        }
    }
}

fn snapshot_of(set: &IndicatorSet) -> IndicatorSnapshot {
    IndicatorSnapshot {
        rsi_state: set.rsi.value().map(|r| r.state),
        cross: set.crossover.direction,
        volume_spike: set.volume.is_spike,
    }
}

/// Conditions that hold in `current` but did not in `previous`.
fn transitions(previous: &IndicatorSnapshot, current: &IndicatorSnapshot) -> Vec<SignalKind> {
    let mut kinds = Vec::new();

    // Insufficient history before counts as neutral; insufficient now says nothing.
    if let Some(now) = current.rsi_state {
        let before = previous.rsi_state.unwrap_or(RsiState::Neutral);
        if before != now {
            match before {
                RsiState::Overbought => kinds.push(SignalKind::RsiExitOverbought),
                RsiState::Oversold => kinds.push(SignalKind::RsiExitOversold),
                RsiState::Neutral => {}
            }
            match now {
                RsiState::Overbought => kinds.push(SignalKind::RsiEnterOverbought),
                RsiState::Oversold => kinds.push(SignalKind::RsiEnterOversold),
                RsiState::Neutral => {}
            }
        }
    }

    if let Some(dir) = current.cross {
        if previous.cross != Some(dir) {
            kinds.push(match dir {
                CrossDirection::Golden => SignalKind::GoldenCross,
                CrossDirection::Dead => SignalKind::DeadCross,
            });
        }
    }

    if current.volume_spike && !previous.volume_spike {
        kinds.push(SignalKind::VolumeSpike);
    }

    kinds
}

fn payload_of(series: &PriceSeries, set: &IndicatorSet) -> SignalPayload {
    SignalPayload {
        price: series.latest_price().unwrap_or_default(),
        rsi: set.rsi.value().map(|r| r.value),
        fast_ma: set.crossover.fast_series.last().copied(),
        slow_ma: set.crossover.slow_series.last().copied(),
        volume_ratio: Some(set.volume.ratio),
    }
}
