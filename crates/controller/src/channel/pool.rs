//! Bounded worker pool for outbound router RPCs.
//!
//! One pool per controller. Enqueue blocks up to the caller's deadline
//! and then fails with `Overloaded`; nothing is dropped silently. A
//! panicking job is caught and logged, and the worker keeps serving.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use trellis_domain::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct SendPool {
    tx: mpsc::Sender<Job>,
    queued: Arc<AtomicUsize>,
    busy_workers: Arc<AtomicUsize>,
}

impl SendPool {
    pub fn new(queue_size: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));
        let busy_workers = Arc::new(AtomicUsize::new(0));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let queued = queued.clone();
            let busy = busy_workers.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { return };
                    queued.fetch_sub(1, Ordering::Relaxed);
                    busy.fetch_add(1, Ordering::Relaxed);

                    if let Err(panic) = std::panic::AssertUnwindSafe(job).catch_unwind().await {
                        let backtrace = std::backtrace::Backtrace::force_capture();
                        tracing::error!(
                            worker,
                            panic = ?panic,
                            %backtrace,
                            "panic during message send to router"
                        );
                    }
                    busy.fetch_sub(1, Ordering::Relaxed);
                }
            });
        }

        Self {
            tx,
            queued,
            busy_workers,
        }
    }

    /// Queue a job, waiting up to `deadline` for space.
    pub async fn queue(
        &self,
        deadline: Duration,
        job: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        match self.tx.send_timeout(Box::pin(job), deadline).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                Err(Error::Overloaded(format!(
                    "router messaging pool full ({} jobs queued)",
                    self.queued.load(Ordering::Relaxed)
                )))
            }
        }
    }

    /// Jobs waiting for a worker. Observable as a saturation metric.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_run_to_completion() {
        let pool = SendPool::new(16, 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.queue(Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn full_queue_times_out_with_overloaded() {
        // One worker, stuck forever; queue of one.
        let pool = SendPool::new(1, 1);
        pool.queue(Duration::from_millis(10), async {
            std::future::pending::<()>().await;
        })
        .await
        .unwrap();
        // Fill the queue slot.
        pool.queue(Duration::from_millis(10), async {}).await.unwrap();

        let err = pool
            .queue(Duration::from_millis(10), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_pool() {
        let pool = SendPool::new(4, 1);
        pool.queue(Duration::from_secs(1), async {
            panic!("boom");
        })
        .await
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.queue(Duration::from_secs(1), async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
