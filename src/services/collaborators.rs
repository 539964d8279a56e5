//! Capabilities this subsystem consumes from the rest of the product.
//!
//! Storage, credentials, the instrument universe and alert delivery are owned
//! elsewhere; only their interfaces live here, plus the small concrete
//! implementations the binary wires up.

use crate::error::{AppError, Result};
use crate::types::{
    DailyBar, FundamentalMetrics, Instrument, ScreenedInstrument, SignalEvent, ValuationRatios,
};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

/// Which venue credential is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Key for realtime websocket registrations.
    RealtimeApproval,
    /// Bearer token for REST calls.
    AccessToken,
}

/// Produces a currently valid, opaque credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_valid_credential(&self, kind: CredentialKind) -> Result<String>;
}

/// Read/write capabilities of the durable store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read_price_history(&self, instrument_id: &str) -> Result<Vec<DailyBar>>;
    async fn replace_price_history(&self, instrument_id: &str, bars: &[DailyBar]) -> Result<()>;
    async fn read_latest_fundamentals(&self, instrument_id: &str)
        -> Result<Option<FundamentalMetrics>>;
    async fn read_valuation(&self, instrument_id: &str) -> Result<Option<ValuationRatios>>;
    async fn write_valuation(&self, ratios: &ValuationRatios) -> Result<()>;
    async fn read_screened_set(&self) -> Result<Vec<ScreenedInstrument>>;
    async fn replace_screened_set(&self, set: &[ScreenedInstrument]) -> Result<()>;
    async fn write_signal_alert(&self, event: &SignalEvent) -> Result<()>;
}

/// Lists the tradable universe of a market.
#[async_trait]
pub trait UniverseProvider: Send + Sync {
    async fn list_instruments(&self, market: &str) -> Result<Vec<Instrument>>;
}

/// Upstream source of daily bars, used to refresh stored history.
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn fetch_daily_bars(&self, instrument_id: &str) -> Result<Vec<DailyBar>>;
}

/// Downstream notification of signal events. Best effort, at most once.
pub trait AlertSink: Send + Sync {
    fn publish(&self, event: &SignalEvent);
}

/// Credentials supplied up front through configuration.
pub struct StaticCredentials {
    approval_key: String,
    access_token: String,
}

impl StaticCredentials {
    pub fn new(approval_key: String, access_token: String) -> Self {
        Self {
            approval_key,
            access_token,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_valid_credential(&self, kind: CredentialKind) -> Result<String> {
        let value = match kind {
            CredentialKind::RealtimeApproval => &self.approval_key,
            CredentialKind::AccessToken => &self.access_token,
        };
        if value.is_empty() {
            return Err(AppError::Credential(format!("{:?} is not configured", kind)));
        }
        Ok(value.clone())
    }
}

/// Fans signal events out to any connected listeners.
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<SignalEvent>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new listener.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.tx.subscribe()
    }
}

impl AlertSink for BroadcastAlertSink {
    fn publish(&self, event: &SignalEvent) {
        // No receivers means nobody is listening; the alert is dropped.
        if self.tx.send(event.clone()).is_err() {
            debug!(
                "No alert listeners for {} on {}",
                event.kind, event.instrument_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalKind, SignalPayload};

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new("approval".to_string(), String::new());
        assert_eq!(
            creds
                .get_valid_credential(CredentialKind::RealtimeApproval)
                .await
                .unwrap(),
            "approval"
        );
        assert!(matches!(
            creds.get_valid_credential(CredentialKind::AccessToken).await,
            Err(AppError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_listeners() {
        let sink = BroadcastAlertSink::new(8);
        let event = SignalEvent::new(
            "005930",
            SignalKind::GoldenCross,
            SignalPayload {
                price: 71_000.0,
                rsi: None,
                fast_ma: Some(70_500.0),
                slow_ma: Some(70_200.0),
                volume_ratio: None,
            },
        );

        // Publishing without listeners must not fail
        sink.publish(&event);

        let mut rx = sink.subscribe();
        sink.publish(&event);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, event.id);
    }
}
