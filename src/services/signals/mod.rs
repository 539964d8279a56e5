//! Technical indicators and the signal detector built on them.

pub mod detector;
pub mod indicators;

pub use detector::SignalDetector;
pub use indicators::IndicatorSet;
