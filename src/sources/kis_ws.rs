//! KIS realtime WebSocket client.
//!
//! Holds one persistent connection, tracks which instruments are registered,
//! and forwards parsed trades to the price cache over a channel. The venue
//! forgets registrations when the socket drops, so every reconnect replays
//! the whole subscription set.

use super::kis_frame::{build_request, parse_frame, Frame, RequestKind};
use crate::config::VenueConfig;
use crate::error::{AppError, Result};
use crate::services::collaborators::{CredentialKind, CredentialProvider};
use crate::types::PriceTick;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// How long `connect` waits for the first session before returning.
const CONNECT_WAIT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of a single subscribe or unsubscribe call. Never an error: callers
/// race with reconnects and must not fail because of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Subscribed,
    Unsubscribed,
    AlreadySubscribed,
    NotSubscribed,
    NotConnected,
    /// The venue's per-session registration limit is reached.
    CapacityReached,
    Failed(String),
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    /// Ids that could not be brought in line, with the reason.
    pub skipped: Vec<(String, SubscriptionOutcome)>,
}

/// Realtime registration operations, as seen by screening and client
/// interest handling.
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    async fn subscribe(&self, instrument_id: &str) -> SubscriptionOutcome;
    async fn unsubscribe(&self, instrument_id: &str) -> SubscriptionOutcome;
    async fn reconcile(&self, desired: &[String]) -> ReconcileReport;
}

/// Reconnect delay: doubles from `min` up to `max`, plus a little jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
        (base + Duration::from_millis(jitter_ms)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// How a single connection ended.
enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Realtime trade client for the KIS venue.
pub struct KisRealtimeClient {
    config: VenueConfig,
    credentials: Arc<dyn CredentialProvider>,
    ticks: mpsc::Sender<PriceTick>,
    state: watch::Sender<ConnectionState>,
    subscriptions: RwLock<BTreeSet<String>>,
    /// Writer queue of the live connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    approval_key: RwLock<Option<String>>,
    shutdown: broadcast::Sender<()>,
}

impl KisRealtimeClient {
    pub fn new(
        config: VenueConfig,
        credentials: Arc<dyn CredentialProvider>,
        ticks: mpsc::Sender<PriceTick>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            credentials,
            ticks,
            state,
            subscriptions: RwLock::new(BTreeSet::new()),
            outbound: Mutex::new(None),
            approval_key: RwLock::new(None),
            shutdown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Snapshot of the registered instruments.
    pub async fn subscribed(&self) -> BTreeSet<String> {
        self.subscriptions.read().await.clone()
    }

    /// Start the connection loop.
    ///
    /// Fails immediately if no approval key is available. Otherwise waits a
    /// bounded time for the first session; if that does not come up, the
    /// loop keeps retrying in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let key = self
            .credentials
            .get_valid_credential(CredentialKind::RealtimeApproval)
            .await?;
        *self.approval_key.write().await = Some(key);

        let mut state_rx = self.watch_state();
        let client = Arc::clone(self);
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move { client.run(shutdown_rx).await });

        let connected = tokio::time::timeout(CONNECT_WAIT, async {
            while *state_rx.borrow_and_update() != ConnectionState::Connected {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if connected.is_err() {
            warn!("KIS realtime not connected yet, retrying in background");
        }
        Ok(())
    }

    /// Stop the connection loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let result = self.run_connection(&mut shutdown).await;
            let was_connected = self.state() == ConnectionState::Connected;

            *self.outbound.lock().await = None;
            self.state.send_replace(ConnectionState::Disconnected);

            match result {
                Ok(SessionEnd::Shutdown) => {
                    info!("KIS realtime client stopped");
                    return;
                }
                Ok(SessionEnd::Dropped) => warn!("KIS WebSocket disconnected"),
                Err(e) => error!("KIS WebSocket error: {}", e),
            }

            if was_connected {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            info!("Reconnecting to KIS in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("KIS realtime client stopped");
                    return;
                }
            }
        }
    }

    async fn run_connection(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<SessionEnd> {
        let key = self
            .approval_key
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::Credential("approval key not loaded".to_string()))?;

        info!("Connecting to KIS WebSocket at {}", self.config.ws_url);
        let (ws_stream, _) = connect_async(self.config.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // Replay under the read lock so subscribe() waits for Connected.
        {
            let subs = self.subscriptions.read().await;
            for id in subs.iter() {
                let request =
                    build_request(&key, &self.config.customer_type, RequestKind::Subscribe, id)?;
                write.send(Message::Text(request)).await?;
            }
            *self.outbound.lock().await = Some(out_tx);
            self.state.send_replace(ConnectionState::Connected);
            info!("Connected to KIS WebSocket, re-registered {} instruments", subs.len());
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_message(&text).await {
                                write.send(reply).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("KIS WebSocket closed by venue");
                            return Ok(SessionEnd::Dropped);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Dropped),
                        _ => {}
                    }
                }
                out = out_rx.recv() => {
                    if let Some(msg) = out {
                        write.send(msg).await?;
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                _ = shutdown.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Handle one text frame; returns a message to send back, if any.
    async fn handle_message(&self, text: &str) -> Option<Message> {
        match parse_frame(text, self.config.utc_offset) {
            Ok(Frame::Tick(tick)) => {
                debug!(
                    "KIS trade: {} = {} ({}, vol {})",
                    tick.instrument_id, tick.price, tick.sign, tick.cumulative_volume
                );
                if self.ticks.send(tick).await.is_err() {
                    warn!("Tick receiver dropped; discarding trade");
                }
                None
            }
            Ok(Frame::PingPong) => Some(Message::Text(text.to_string())),
            Ok(Frame::Ack {
                tr_id,
                tr_key,
                success,
                message,
            }) => {
                if success {
                    debug!("KIS ack {} {:?}: {}", tr_id, tr_key, message);
                } else {
                    warn!("KIS rejected {} {:?}: {}", tr_id, tr_key, message);
                }
                None
            }
            Ok(Frame::Ignored(reason)) => {
                debug!("Ignoring KIS frame: {}", reason);
                None
            }
            Err(e) => {
                warn!("Dropping malformed KIS frame: {}", e);
                None
            }
        }
    }

    async fn send_request(&self, kind: RequestKind, instrument_id: &str) -> SubscriptionOutcome {
        let key = match self.approval_key.read().await.clone() {
            Some(key) => key,
            None => return SubscriptionOutcome::NotConnected,
        };
        let request =
            match build_request(&key, &self.config.customer_type, kind, instrument_id) {
                Ok(request) => request,
                Err(e) => return SubscriptionOutcome::Failed(e.to_string()),
            };

        match self.outbound.lock().await.as_ref() {
            Some(tx) if tx.send(Message::Text(request)).is_ok() => match kind {
                RequestKind::Subscribe => SubscriptionOutcome::Subscribed,
                RequestKind::Unsubscribe => SubscriptionOutcome::Unsubscribed,
            },
            _ => SubscriptionOutcome::NotConnected,
        }
    }

    /// Register an instrument for realtime trades.
    pub async fn subscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        let mut subs = self.subscriptions.write().await;
        if self.state() != ConnectionState::Connected {
            warn!("Cannot subscribe {} while disconnected", instrument_id);
            return SubscriptionOutcome::NotConnected;
        }
        if subs.contains(instrument_id) {
            return SubscriptionOutcome::AlreadySubscribed;
        }
        if subs.len() >= self.config.max_subscriptions {
            warn!(
                "Subscription limit {} reached, not subscribing {}",
                self.config.max_subscriptions, instrument_id
            );
            return SubscriptionOutcome::CapacityReached;
        }

        let outcome = self.send_request(RequestKind::Subscribe, instrument_id).await;
        if outcome == SubscriptionOutcome::Subscribed {
            subs.insert(instrument_id.to_string());
            debug!("Subscribed {} ({} total)", instrument_id, subs.len());
        }
        outcome
    }

    /// Deregister an instrument.
    pub async fn unsubscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        let mut subs = self.subscriptions.write().await;
        if self.state() != ConnectionState::Connected {
            warn!("Cannot unsubscribe {} while disconnected", instrument_id);
            return SubscriptionOutcome::NotConnected;
        }
        if !subs.contains(instrument_id) {
            return SubscriptionOutcome::NotSubscribed;
        }

        let outcome = self.send_request(RequestKind::Unsubscribe, instrument_id).await;
        if outcome == SubscriptionOutcome::Unsubscribed {
            subs.remove(instrument_id);
            debug!("Unsubscribed {} ({} left)", instrument_id, subs.len());
        }
        outcome
    }

    /// Bring the subscription set in line with `desired` using the fewest
    /// requests. Removals go first to free capacity; additions follow in the
    /// order given, so higher-priority ids win when the limit is reached.
    pub async fn reconcile(&self, desired: &[String]) -> ReconcileReport {
        let mut seen = HashSet::new();
        let desired: Vec<&String> = desired.iter().filter(|id| seen.insert(*id)).collect();
        let current = self.subscribed().await;
        let mut report = ReconcileReport::default();

        for id in current.iter().filter(|id| !seen.contains(id)) {
            match self.unsubscribe(id).await {
                SubscriptionOutcome::Unsubscribed => report.unsubscribed.push(id.clone()),
                SubscriptionOutcome::NotSubscribed => {}
                other => report.skipped.push((id.clone(), other)),
            }
        }

        for id in desired.into_iter().filter(|id| !current.contains(*id)) {
            match self.subscribe(id).await {
                SubscriptionOutcome::Subscribed => report.subscribed.push(id.clone()),
                SubscriptionOutcome::AlreadySubscribed => {}
                other => report.skipped.push((id.clone(), other)),
            }
        }

        info!(
            "Reconciled subscriptions: +{} -{} ({} skipped)",
            report.subscribed.len(),
            report.unsubscribed.len(),
            report.skipped.len()
        );
        report
    }
}

#[async_trait]
impl SubscriptionManager for KisRealtimeClient {
    async fn subscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        KisRealtimeClient::subscribe(self, instrument_id).await
    }

    async fn unsubscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        KisRealtimeClient::unsubscribe(self, instrument_id).await
    }

    async fn reconcile(&self, desired: &[String]) -> ReconcileReport {
        KisRealtimeClient::reconcile(self, desired).await
    }
}
