pub mod kis_frame;
pub mod kis_rest;
pub mod kis_ws;

pub use kis_rest::KisRestClient;
pub use kis_ws::{
    ConnectionState, KisRealtimeClient, ReconcileReport, SubscriptionManager, SubscriptionOutcome,
};
