//! Bounded worker pool for layer operations.
//!
//! `concurrency` workers pull items from a shared queue and report every
//! result over a channel. Workers are detached tokio tasks: dropping or
//! abandoning a [`PoolRun`] never cancels in-flight work, and the remaining
//! reports can still be drained by an observer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use dlc_core::error::{CacheError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of one pooled task together with its input.
#[derive(Debug, Clone)]
pub struct TaskReport<I, T> {
    pub item: I,
    pub output: T,
}

/// Fixed-capacity worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// Create a pool running at most `concurrency` tasks at once.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(CacheError::ConfigError(
                "Pool concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(Self { concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue `items` and start workers running `task` on each.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<I, T, F, Fut>(&self, items: Vec<I>, task: F) -> PoolRun<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let expected = items.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let task = Arc::new(task);
        let (tx, rx) = mpsc::unbounded_channel();

        let workers = self.concurrency.min(expected);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let task = Arc::clone(&task);
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some(item) = next else { break };
                    let output = task(item.clone()).await;
                    if tx.send(TaskReport { item, output }).is_err() {
                        tracing::trace!(worker, "Pool receiver gone, result discarded");
                    }
                }
            });
        }

        tracing::debug!(tasks = expected, workers, "Dispatched pool tasks");

        PoolRun {
            rx,
            expected,
            received: 0,
        }
    }
}

/// Handle to the results of one [`WorkerPool::spawn`] call.
pub struct PoolRun<I, T> {
    rx: mpsc::UnboundedReceiver<TaskReport<I, T>>,
    expected: usize,
    received: usize,
}

impl<I, T> PoolRun<I, T>
where
    I: Send + 'static,
    T: Send + 'static,
{
    /// Next finished task in completion order, `None` once all have reported.
    pub async fn next(&mut self) -> Option<TaskReport<I, T>> {
        if self.received == self.expected {
            return None;
        }
        match self.rx.recv().await {
            Some(report) => {
                self.received += 1;
                Some(report)
            }
            None => {
                self.log_lost();
                None
            }
        }
    }

    /// Tasks that have not reported yet.
    pub fn outstanding(&self) -> usize {
        self.expected - self.received
    }

    /// Wait for every task and return all reports.
    pub async fn collect(mut self) -> Vec<TaskReport<I, T>> {
        let mut reports = Vec::with_capacity(self.outstanding());
        while let Some(report) = self.next().await {
            reports.push(report);
        }
        reports
    }

    /// Stop waiting here and hand the remaining reports to `observer` in
    /// the background. The returned handle yields those reports.
    pub fn observe_rest<O>(mut self, observer: O) -> JoinHandle<Vec<TaskReport<I, T>>>
    where
        O: Fn(&TaskReport<I, T>) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reports = Vec::with_capacity(self.outstanding());
            while let Some(report) = self.next().await {
                observer(&report);
                reports.push(report);
            }
            reports
        })
    }

    fn log_lost(&mut self) {
        let lost = self.expected - self.received;
        tracing::error!(lost, "Pool workers exited without reporting");
        // Nothing more will arrive
        self.expected = self.received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(WorkerPool::new(0).is_err());
        assert_eq!(WorkerPool::new(3).unwrap().concurrency(), 3);
    }

    #[tokio::test]
    async fn test_collect_returns_every_result() {
        let pool = WorkerPool::new(2).unwrap();
        let run = pool.spawn((0..10).collect::<Vec<u32>>(), |n| async move { n * 2 });

        let mut outputs: Vec<u32> = run.collect().await.into_iter().map(|r| r.output).collect();
        outputs.sort();
        assert_eq!(outputs, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let pool = WorkerPool::new(4).unwrap();
        let run = pool.spawn(Vec::<u32>::new(), |n| async move { n });
        assert!(run.collect().await.is_empty());
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(3).unwrap();

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let run = pool.spawn((0..12).collect::<Vec<u32>>(), move |_| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.fetch_sub(1, Ordering::SeqCst);
            }
        });
        assert_eq!(run.collect().await.len(), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observe_rest_sees_remaining_reports() {
        let pool = WorkerPool::new(1).unwrap();
        let mut run = pool.spawn(vec![1u32, 2, 3], |n| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            n
        });

        let first = run.next().await.unwrap();
        assert_eq!(first.item, 1);
        assert_eq!(run.outstanding(), 2);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = run.observe_rest(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let rest = handle.await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_run_does_not_cancel_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::clone(&done);
        let run = pool.spawn(vec![(); 4], move |_| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(run);

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
