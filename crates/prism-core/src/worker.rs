use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Worker group handle.
/// - 1 本の受信ループが bounded channel から job を取り出し、
///   最大 `concurrency` 個を並行に実行する
/// - `request_shutdown()` で受付を閉じる（既にキューにある job と実行中の job は最後まで処理）
/// - `shutdown_and_join()` で全 job の終了を待てる
pub struct WorkerGroup {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerGroup {
    /// Spawn a receive loop running `handler` for every job taken from `rx`.
    pub fn spawn<J, H, Fut>(
        name: &'static str,
        rx: mpsc::Receiver<J>,
        concurrency: usize,
        handler: H,
    ) -> Self
    where
        J: Send + 'static,
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::new(handler);
        let join = tokio::spawn(worker_loop(name, rx, concurrency.max(1), handler, shutdown_rx));
        debug!(worker = name, concurrency, "worker group started");
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request shutdown.
    /// This does not cancel in-flight jobs; it closes the queue so senders
    /// see it as closed, then drains what was already queued.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the loop and every job it started.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "worker loop panicked");
        }
    }
}

async fn worker_loop<J, H, Fut>(
    name: &'static str,
    mut rx: mpsc::Receiver<J>,
    concurrency: usize,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    J: Send + 'static,
    H: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut jobs = JoinSet::new();
    let mut closing = false;

    loop {
        let next = if closing {
            rx.recv().await
        } else {
            // recv は「待つ」ので select で shutdown と競合させる
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender が drop された場合も shutdown 扱い
                    if changed.is_err() || *shutdown_rx.borrow() {
                        rx.close();
                        closing = true;
                        debug!(worker = name, "queue closed, draining");
                    }
                    continue;
                }
                job = rx.recv() => job,
            }
        };

        let Some(job) = next else {
            break;
        };

        // permit は job と一緒に task へ move し、終了時に返却される
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(&handler);
        jobs.spawn(async move {
            let _permit = permit;
            handler(job).await;
        });

        while let Some(done) = jobs.try_join_next() {
            if let Err(e) = done {
                warn!(worker = name, error = %e, "job panicked");
            }
        }
    }

    while let Some(done) = jobs.join_next().await {
        if let Err(e) = done {
            warn!(worker = name, error = %e, "job panicked");
        }
    }
    debug!(worker = name, "worker group stopped");
}
