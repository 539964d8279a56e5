pub mod batch;
pub mod collaborators;
pub mod jobs;
pub mod monitor;
pub mod price_cache;
pub mod screening;
pub mod signals;
pub mod sqlite_store;
pub mod workflows;

pub use batch::{BatchReport, PacedBatch};
pub use collaborators::{
    AlertSink, BarSource, BroadcastAlertSink, CredentialKind, CredentialProvider,
    StaticCredentials, StorageBackend, UniverseProvider,
};
pub use jobs::{Job, JobCoordinator, JobOutcome};
pub use monitor::{InterestRegistry, Monitor};
pub use price_cache::{HydrationReport, PriceCache, TickOutcome};
pub use screening::ScreeningEngine;
pub use signals::SignalDetector;
pub use sqlite_store::SqliteStore;
pub use workflows::{PriceRefreshJob, ScreeningJob, ValuationRefreshJob};
