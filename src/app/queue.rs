use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Runs background work on the current runtime with bounded concurrency.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::warn!("in-process queue is closed; dropping job");
                return;
            };
            fut.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let queue = InProcessQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            queue.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..6 {
            done_rx.recv().await.expect("job finished");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
