use std::sync::Arc;
use tickwatch::config::Config;
use tickwatch::services::{
    BroadcastAlertSink, CredentialProvider, InterestRegistry, JobCoordinator, Monitor,
    PacedBatch, PriceCache, PriceRefreshJob, ScreeningEngine, ScreeningJob, SignalDetector,
    SqliteStore, StaticCredentials, StorageBackend, ValuationRefreshJob,
};
use tickwatch::sources::{KisRealtimeClient, KisRestClient, SubscriptionManager};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Jobs named with `--trigger <name>` run once right after startup.
fn startup_triggers() -> Vec<String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    args.windows(2)
        .filter(|pair| pair[0] == "--trigger")
        .map(|pair| pair[1].clone())
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Missing credentials or bad settings stop the process here
    let config = Config::from_env()?;
    info!("Starting tickwatch for {}", config.screening.market);

    let store = Arc::new(SqliteStore::new(&config.database_path)?);
    let storage: Arc<dyn StorageBackend> = store.clone();
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::new(
        config.approval_key.clone(),
        config.access_token.clone(),
    ));

    // Hydrate the cache from the last screened set
    let cache = PriceCache::new(storage.clone(), config.cache.clone());
    let screened: Vec<String> = match storage.read_screened_set().await {
        Ok(set) => set.into_iter().map(|s| s.instrument_id).collect(),
        Err(e) => {
            warn!("Could not read screened set, starting empty: {}", e);
            Vec::new()
        }
    };
    let hydration = cache.hydrate(&screened).await;
    info!(
        "Hydrated {} instruments ({} failed)",
        hydration.loaded.len(),
        hydration.failed.len()
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Realtime ticks -> cache -> detector
    let (tick_tx, tick_rx) = mpsc::channel(config.cache.tick_channel_capacity);
    tokio::spawn(cache.clone().run_tick_pump(tick_rx, shutdown_tx.subscribe()));

    let alerts = Arc::new(BroadcastAlertSink::new(256));
    let detector = SignalDetector::new(
        cache.clone(),
        storage.clone(),
        alerts.clone(),
        config.indicators.clone(),
        config.signals.restart_policy,
    );
    tokio::spawn(detector.run(cache.subscribe(), shutdown_tx.subscribe()));

    // Log alerts until a real listener (push gateway) attaches
    let mut alert_rx = alerts.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = alert_rx.recv().await {
            info!(
                "ALERT {} {} price={:.2}",
                event.instrument_id, event.kind, event.payload.price
            );
        }
    });

    let client = KisRealtimeClient::new(config.venue.clone(), credentials.clone(), tick_tx);
    client.connect().await?;
    let feed: Arc<dyn SubscriptionManager> = client.clone();

    let interests = Arc::new(InterestRegistry::new());

    // Recurring jobs
    let jobs = JobCoordinator::new(config.venue.utc_offset);
    let engine = ScreeningEngine::new(
        store.clone(),
        storage.clone(),
        cache.clone(),
        config.screening.clone(),
        config.indicators.clone(),
    );
    jobs.register(
        Arc::new(ScreeningJob::new(
            engine,
            cache.clone(),
            feed.clone(),
            interests.clone(),
        )),
        &config.jobs.screening,
    );
    jobs.register(
        Arc::new(PriceRefreshJob::new(
            Arc::new(KisRestClient::new(config.venue.clone(), credentials.clone())),
            storage.clone(),
            cache.clone(),
            interests.clone(),
            PacedBatch::new(config.batch.clone()),
        )),
        &config.jobs.price_refresh,
    );
    jobs.register(
        Arc::new(ValuationRefreshJob::new(
            storage.clone(),
            cache.clone(),
            interests.clone(),
        )),
        &config.jobs.valuation_refresh,
    );
    let schedulers = jobs.start();

    // Registers the screened set now, and again after every reconnect
    let monitor = Arc::new(Monitor::new(
        cache.clone(),
        storage.clone(),
        feed,
        interests,
        jobs.clone(),
    ));
    tokio::spawn(
        monitor
            .clone()
            .run_subscription_sync(client.watch_state(), shutdown_tx.subscribe()),
    );
    for name in startup_triggers() {
        let outcome = monitor.trigger_job(&name).await;
        info!("Startup trigger {}: {:?}", name, outcome);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    jobs.shutdown();
    client.shutdown();
    let _ = shutdown_tx.send(());
    for handle in schedulers {
        if let Err(e) = handle.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }

    Ok(())
}
