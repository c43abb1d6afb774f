//! Fixed-size worker pool over tokio tasks.
//!
//! Workers consume from a shared bounded channel owned by the caller; closing
//! that channel is the only shutdown signal. [`Pool::done`] is the join
//! barrier.

use tracing::{debug, Instrument};

/// A named pool of `num` concurrent executors.
pub struct Pool {
    num: usize,
    name: &'static str,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pool {
    pub fn new(num: usize, name: &'static str) -> Self {
        Self {
            num,
            name,
            handles: Vec::with_capacity(num),
        }
    }

    /// Spawn `num` executors, each running the future produced by
    /// `work(index)`. Every executor carries its stable index in its span.
    pub fn start<F, Fut>(&mut self, work: F)
    where
        F: Fn(usize) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        for idx in 0..self.num {
            let span = tracing::debug_span!("worker", pool = self.name, w = idx);
            let name = self.name;
            let fut = work(idx);
            self.handles.push(tokio::spawn(
                async move {
                    debug!("starting {}", name);
                    fut.await;
                    debug!("{} finished", name);
                }
                .instrument(span),
            ));
        }
    }

    /// Join barrier: returns once every executor has returned.
    pub async fn done(self) {
        for handle in self.handles {
            // a panicked worker is already reported by the runtime
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_workers_run_and_join() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new(4, "testWorkers");
        pool.start(|_idx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        pool.done().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_workers_drain_shared_channel_until_closed() {
        let (tx, rx) = async_channel::bounded::<usize>(2);
        let processed = Arc::new(AtomicUsize::new(0));

        let mut pool = Pool::new(4, "drainWorkers");
        pool.start(|_idx| {
            let rx = rx.clone();
            let processed = processed.clone();
            async move {
                while rx.recv().await.is_ok() {
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        for job in 0..37 {
            tx.send(job).await.unwrap();
        }
        drop(tx);
        pool.done().await;
        assert_eq!(processed.load(Ordering::SeqCst), 37);
    }

    #[tokio::test]
    async fn test_done_waits_for_slow_worker() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new(2, "slowWorkers");
        pool.start(|idx| {
            let finished = finished.clone();
            async move {
                if idx == 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
            }
        });
        pool.done().await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}
