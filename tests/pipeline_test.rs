//! End-to-end tick pipeline: venue ticks -> price cache -> signal detector ->
//! alert sink and storage, plus the monitor facade over it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickwatch::config::{kst, CacheConfig, IndicatorConfig, RestartPolicy};
use tickwatch::services::{
    BroadcastAlertSink, InterestRegistry, JobCoordinator, JobOutcome, Monitor, PriceCache,
    SignalDetector, SqliteStore, StorageBackend, TickOutcome,
};
use tickwatch::sources::{
    ConnectionState, ReconcileReport, SubscriptionManager, SubscriptionOutcome,
};
use tickwatch::types::{DailyBar, PriceSign, PriceTick, ScreenedInstrument, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;

const SAMSUNG: &str = "005930";

fn first_session() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
}

/// 20 sessions: six flat at 100, then +1 a day up to 114. RSI(14) is 100.
fn overbought_history(id: &str) -> Vec<DailyBar> {
    (0..20)
        .map(|i| {
            let close = if i < 6 { 100.0 } else { 100.0 + (i - 5) as f64 };
            DailyBar {
                instrument_id: id.to_string(),
                date: first_session() + ChronoDuration::days(i),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000,
            }
        })
        .collect()
}

fn live_tick(id: &str, price: f64) -> PriceTick {
    PriceTick {
        instrument_id: id.to_string(),
        session_date: first_session() + ChronoDuration::days(20),
        timestamp: Utc::now(),
        price,
        change_abs: price - 114.0,
        change_rate: (price - 114.0) / 114.0 * 100.0,
        sign: PriceSign::from_change(price - 114.0),
        cumulative_volume: 1_200,
    }
}

async fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    store
        .replace_price_history(SAMSUNG, &overbought_history(SAMSUNG))
        .await
        .unwrap();
    store
}

// =========================================================================
// Signal Pipeline Tests
// =========================================================================

#[tokio::test]
async fn test_exit_overbought_flows_end_to_end() {
    let store = seeded_store().await;
    let cache = PriceCache::new(store.clone(), CacheConfig::default());
    assert!(cache.hydrate(&[SAMSUNG.to_string()]).await.is_complete());

    let sink = Arc::new(BroadcastAlertSink::new(16));
    let mut alerts = sink.subscribe();
    let detector = SignalDetector::new(
        cache.clone(),
        store.clone(),
        sink.clone(),
        IndicatorConfig::default(),
        RestartPolicy::Suppress,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (tick_tx, tick_rx) = mpsc::channel(16);
    let detector_task = tokio::spawn(detector.clone().run(cache.subscribe(), shutdown_tx.subscribe()));
    let pump_task = tokio::spawn(cache.clone().run_tick_pump(tick_rx, shutdown_tx.subscribe()));

    tick_tx.send(live_tick(SAMSUNG, 105.0)).await.unwrap();

    let event = timeout(Duration::from_secs(2), alerts.recv())
        .await
        .expect("no alert")
        .unwrap();
    assert_eq!(event.instrument_id, SAMSUNG);
    assert_eq!(event.kind, SignalKind::RsiExitOverbought);
    assert_eq!(event.payload.price, 105.0);
    assert!(event.payload.rsi.unwrap() < 70.0);

    // Further ticks inside the neutral zone stay quiet
    tick_tx.send(live_tick(SAMSUNG, 104.0)).await.unwrap();
    tick_tx.send(live_tick(SAMSUNG, 105.0)).await.unwrap();
    let extra = timeout(Duration::from_millis(300), alerts.recv()).await;
    assert!(extra.is_err(), "unexpected alert: {:?}", extra);

    assert_eq!(store.count_signal_alerts(SAMSUNG).unwrap(), 1);
    assert_eq!(cache.latest_price(SAMSUNG), Some(105.0));

    shutdown_tx.send(()).unwrap();
    detector_task.await.unwrap();
    pump_task.await.unwrap();
}

#[tokio::test]
async fn test_stale_tick_does_not_reach_detector() {
    let store = seeded_store().await;
    let cache = PriceCache::new(store.clone(), CacheConfig::default());
    cache.hydrate(&[SAMSUNG.to_string()]).await;
    let mut updates = cache.subscribe();

    // Same session as the last stored bar
    let mut stale = live_tick(SAMSUNG, 90.0);
    stale.session_date = first_session() + ChronoDuration::days(19);
    assert_eq!(cache.apply_tick(stale), TickOutcome::Stale);

    assert!(updates.try_recv().is_err());
    assert_eq!(cache.latest_price(SAMSUNG), Some(114.0));
}

// =========================================================================
// Monitor Tests
// =========================================================================

/// Records every call it receives, in order, and tracks what is registered.
#[derive(Default)]
struct RecordingFeed {
    calls: Mutex<Vec<String>>,
    registered: Mutex<BTreeSet<String>>,
}

impl RecordingFeed {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionManager for RecordingFeed {
    async fn subscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        self.calls.lock().unwrap().push(format!("+{}", instrument_id));
        if self.registered.lock().unwrap().insert(instrument_id.to_string()) {
            SubscriptionOutcome::Subscribed
        } else {
            SubscriptionOutcome::AlreadySubscribed
        }
    }

    async fn unsubscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        self.calls.lock().unwrap().push(format!("-{}", instrument_id));
        if self.registered.lock().unwrap().remove(instrument_id) {
            SubscriptionOutcome::Unsubscribed
        } else {
            SubscriptionOutcome::NotSubscribed
        }
    }

    async fn reconcile(&self, desired: &[String]) -> ReconcileReport {
        self.calls
            .lock()
            .unwrap()
            .push(format!("reconcile:{}", desired.join(",")));
        ReconcileReport::default()
    }
}

fn screened(id: &str) -> ScreenedInstrument {
    ScreenedInstrument {
        instrument_id: id.to_string(),
        display_name: id.to_string(),
        market_cap: 1.0,
        fundamental_score: 50.0,
        technical_flags: Vec::new(),
        rank: 1,
    }
}

async fn monitor_with(store: Arc<SqliteStore>) -> (Monitor, Arc<RecordingFeed>, Arc<PriceCache>) {
    let cache = PriceCache::new(store.clone(), CacheConfig::default());
    let feed = Arc::new(RecordingFeed::default());
    let monitor = Monitor::new(
        cache.clone(),
        store,
        feed.clone(),
        Arc::new(InterestRegistry::new()),
        JobCoordinator::new(kst()),
    );
    (monitor, feed, cache)
}

#[tokio::test]
async fn test_client_interest_is_refcounted() {
    let (monitor, feed, cache) = monitor_with(seeded_store().await).await;

    assert_eq!(
        monitor.subscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::Subscribed
    );
    assert_eq!(
        monitor.subscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::AlreadySubscribed
    );
    // First interest hydrated the series
    assert!(cache.get_series(SAMSUNG).is_some());

    // Another client still holds an interest
    assert_eq!(
        monitor.unsubscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::AlreadySubscribed
    );
    assert!(cache.get_series(SAMSUNG).is_some());

    assert_eq!(
        monitor.unsubscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::Unsubscribed
    );
    assert_eq!(
        monitor.unsubscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::NotSubscribed
    );

    // Nobody tracks it any more, so its series is released
    assert!(cache.get_series(SAMSUNG).is_none());
    assert_eq!(
        feed.calls(),
        vec![
            format!("+{}", SAMSUNG),
            format!("+{}", SAMSUNG),
            format!("-{}", SAMSUNG)
        ]
    );
}

/// Refuses everything until it is switched on, like a feed whose socket is
/// still down.
#[derive(Default)]
struct OfflineFeed {
    online: AtomicBool,
    registered: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl SubscriptionManager for OfflineFeed {
    async fn subscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        if !self.online.load(Ordering::SeqCst) {
            return SubscriptionOutcome::NotConnected;
        }
        if self.registered.lock().unwrap().insert(instrument_id.to_string()) {
            SubscriptionOutcome::Subscribed
        } else {
            SubscriptionOutcome::AlreadySubscribed
        }
    }

    async fn unsubscribe(&self, instrument_id: &str) -> SubscriptionOutcome {
        if self.registered.lock().unwrap().remove(instrument_id) {
            SubscriptionOutcome::Unsubscribed
        } else {
            SubscriptionOutcome::NotSubscribed
        }
    }

    async fn reconcile(&self, desired: &[String]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for id in desired {
            if self.subscribe(id).await == SubscriptionOutcome::Subscribed {
                report.subscribed.push(id.clone());
            }
        }
        report
    }
}

#[tokio::test]
async fn test_interest_refused_while_offline_is_retried() {
    let store = seeded_store().await;
    let cache = PriceCache::new(store.clone(), CacheConfig::default());
    let feed = Arc::new(OfflineFeed::default());
    let monitor = Monitor::new(
        cache,
        store,
        feed.clone(),
        Arc::new(InterestRegistry::new()),
        JobCoordinator::new(kst()),
    );

    assert_eq!(
        monitor.subscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::NotConnected
    );

    // The second client's request reaches the feed once it is back
    feed.online.store(true, Ordering::SeqCst);
    assert_eq!(
        monitor.subscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::Subscribed
    );
    assert!(feed.registered.lock().unwrap().contains(SAMSUNG));
}

#[tokio::test]
async fn test_subscription_sync_registers_on_connect() {
    let store = seeded_store().await;
    store.replace_screened_set(&[screened("000660")]).await.unwrap();
    let cache = PriceCache::new(store.clone(), CacheConfig::default());
    let feed = Arc::new(OfflineFeed::default());
    let monitor = Arc::new(Monitor::new(
        cache.clone(),
        store,
        feed.clone(),
        Arc::new(InterestRegistry::new()),
        JobCoordinator::new(kst()),
    ));
    assert_eq!(
        monitor.subscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::NotConnected
    );

    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sync = tokio::spawn(
        monitor
            .clone()
            .run_subscription_sync(state_rx, shutdown_tx.subscribe()),
    );

    feed.online.store(true, Ordering::SeqCst);
    state_tx.send_replace(ConnectionState::Connected);

    timeout(Duration::from_secs(2), async {
        while feed.registered.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("interest and screened set never registered");
    let registered: Vec<String> = feed.registered.lock().unwrap().iter().cloned().collect();
    assert_eq!(registered, vec!["000660".to_string(), SAMSUNG.to_string()]);
    assert!(cache.get_series("000660").is_some());

    shutdown_tx.send(()).unwrap();
    sync.await.unwrap();
}

#[tokio::test]
async fn test_screened_instrument_stays_subscribed() {
    let store = seeded_store().await;
    store.replace_screened_set(&[screened(SAMSUNG)]).await.unwrap();
    let (monitor, feed, _) = monitor_with(store).await;

    monitor.subscribe_client_interest(SAMSUNG).await;
    assert_eq!(
        monitor.unsubscribe_client_interest(SAMSUNG).await,
        SubscriptionOutcome::AlreadySubscribed
    );
    assert_eq!(feed.calls(), vec![format!("+{}", SAMSUNG)]);

    let set = monitor.get_screened_set().await.unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set[0].instrument_id, SAMSUNG);
}

#[tokio::test]
async fn test_current_price_and_unknown_job() {
    let (monitor, _, cache) = monitor_with(seeded_store().await).await;
    assert!(monitor.get_current_price(SAMSUNG).is_none());

    cache.hydrate(&[SAMSUNG.to_string()]).await;
    cache.apply_tick(live_tick(SAMSUNG, 113.0));
    let tick = monitor.get_current_price(SAMSUNG).unwrap();
    assert_eq!(tick.price, 113.0);
    assert_eq!(tick.sign, PriceSign::Fall);

    assert_eq!(monitor.trigger_job("nightly").await, JobOutcome::UnknownJob);
}
