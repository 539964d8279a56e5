//! Tickwatch - realtime equity monitoring, signal detection and watch-list screening

pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;

pub use config::Config;
pub use error::{AppError, Result};
