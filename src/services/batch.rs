//! Paced execution of per-instrument upstream calls.

use crate::config::BatchConfig;
use crate::error::Result;
use std::future::Future;
use tracing::{debug, info, warn};

/// Outcome of a paced batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Items that failed transiently and were tried a second time.
    pub retried: Vec<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Runs one call per item with a delay between calls and a longer pause
/// between batches. A transient failure is retried once after the batch
/// pause; any other failure is recorded and the batch moves on.
#[derive(Debug, Clone)]
pub struct PacedBatch {
    config: BatchConfig,
}

impl PacedBatch {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub async fn run<F, Fut>(&self, label: &str, items: &[String], mut op: F) -> BatchReport
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let batch_size = self.config.batch_size.max(1);
        let mut report = BatchReport::default();
        info!("{}: processing {} items", label, items.len());

        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                if i % batch_size == 0 {
                    debug!("{}: pausing {:?} after {} items", label, self.config.batch_pause, i);
                    tokio::time::sleep(self.config.batch_pause).await;
                } else {
                    tokio::time::sleep(self.config.call_delay).await;
                }
            }

            let mut result = op(item.clone()).await;
            if matches!(&result, Err(e) if e.is_transient()) {
                debug!("{}: retrying {} after a transient failure", label, item);
                report.retried.push(item.clone());
                tokio::time::sleep(self.config.batch_pause).await;
                result = op(item.clone()).await;
            }

            match result {
                Ok(()) => report.succeeded.push(item.clone()),
                Err(e) => {
                    warn!("{}: {} failed: {}", label, item, e);
                    report.failed.push((item.clone(), e.to_string()));
                }
            }
        }

        info!(
            "{}: {} succeeded, {} failed",
            label,
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }
}
