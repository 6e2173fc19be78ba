use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::WorkflowEngine;
use crate::error::{Result, WorkflowError};
use crate::model::Chapter;

/// Result of processing one URL of a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub url: String,
    pub result: Result<Chapter>,
}

impl WorkflowEngine {
    /// Processes `urls` with at most `concurrency` chapters in flight.
    /// Outcomes come back in input order; one failure never stops the rest.
    pub async fn process_batch(
        self: &Arc<Self>,
        urls: Vec<String>,
        concurrency: usize,
    ) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, url) in urls.iter().cloned().enumerate() {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = engine.process(&url).await;
                (index, BatchOutcome { url, result })
            });
        }

        let mut slots: Vec<Option<BatchOutcome>> = urls.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => tracing::error!(%err, "batch task failed"),
            }
        }

        slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| BatchOutcome {
                    result: Err(WorkflowError::Storage(anyhow::anyhow!(
                        "processing task for {url} did not complete"
                    ))),
                    url,
                })
            })
            .collect()
    }
}
