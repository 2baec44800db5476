//! Bucketed executor pool
//!
//! A fixed set of single-threaded workers ("buckets"). Every keyed entity is
//! owned by exactly one bucket, chosen by hashing its key with a fixed-seed
//! hasher, and is only ever touched by tasks running on that bucket. Tasks
//! submitted to a bucket run strictly in submission order, which gives
//! per-key linearizability without locks.
//!
//! Each bucket also owns a timer queue. Retransmission, will delay and
//! expiry sweeps are scheduled there as ordinary tasks, so a timer firing
//! never runs concurrently with other work on the same key.
//!
//! A panicking task is caught and logged; the bucket keeps running and the
//! other buckets never notice.

mod timer;

pub use timer::TimerQueue;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Unit of work executed on a bucket
pub type Task<S, K> = Box<dyn FnOnce(&mut Bucket<S, K>) + Send + 'static>;

// Fixed seeds keep key -> bucket assignment stable for the pool's lifetime
// and identical across pools of the same size.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Executor errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The pool has been shut down
    Stopped,
    /// The task was dropped before producing a result (it panicked or the
    /// bucket stopped while it was queued)
    TaskDropped,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "executor pool stopped"),
            Self::TaskDropped => write!(f, "task dropped before completion"),
        }
    }
}

impl std::error::Error for ExecutorError {}

enum Command<S, K> {
    Run(Task<S, K>),
    Shutdown,
}

/// State and timers owned by one worker
pub struct Bucket<S, K> {
    id: usize,
    /// Bucket-owned state
    pub state: S,
    timers: TimerQueue<S, K>,
}

impl<S, K> Bucket<S, K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(id: usize, state: S) -> Self {
        Self {
            id,
            state,
            timers: TimerQueue::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run `task` on this bucket after `delay`, replacing any timer under `key`
    pub fn schedule(&mut self, key: K, delay: Duration, task: Task<S, K>) {
        self.timers.schedule(key, Instant::now() + delay, task);
    }

    /// Cancel a pending timer
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.cancel(key)
    }

    #[cfg(test)]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn run_task(&mut self, task: Task<S, K>) {
        let id = self.id;
        if panic::catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
            error!("Task panicked on bucket {}", id);
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(task) = self.timers.pop_due(now) {
            trace!("Timer fired on bucket {}", self.id);
            self.run_task(task);
        }
    }
}

/// Fixed-size pool of single-threaded buckets
pub struct BucketPool<S, K> {
    senders: Vec<Sender<Command<S, K>>>,
    hasher: ahash::RandomState,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, K> BucketPool<S, K>
where
    S: Send + 'static,
    K: Hash + Eq + Clone + Send + 'static,
{
    /// Start `size` bucket threads, building each bucket's state with `init`
    pub fn start<F>(name: &str, size: usize, init: F) -> std::io::Result<Self>
    where
        F: Fn(usize) -> S,
    {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let (tx, rx) = crossbeam_channel::unbounded();
            let bucket = Bucket::new(id, init(id));
            let handle = thread::Builder::new()
                .name(format!("{}-bucket-{}", name, id))
                .spawn(move || Self::worker_loop(bucket, rx))?;
            senders.push(tx);
            workers.push(handle);
        }

        debug!("Started {} buckets for {}", size, name);

        Ok(Self {
            senders,
            hasher: ahash::RandomState::with_seeds(
                HASH_SEEDS.0,
                HASH_SEEDS.1,
                HASH_SEEDS.2,
                HASH_SEEDS.3,
            ),
            workers: Mutex::new(workers),
        })
    }

    fn worker_loop(mut bucket: Bucket<S, K>, rx: Receiver<Command<S, K>>) {
        loop {
            let command = match bucket.timers.next_deadline() {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Run(task)) => bucket.run_task(task),
                Some(Command::Shutdown) => break,
                None => {}
            }

            bucket.fire_due();
        }

        // Pending timers may hold handles back into shared state
        bucket.timers.clear();
        debug!("Bucket {} stopped", bucket.id);
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Bucket owning `key`
    pub fn bucket_for<H: Hash + ?Sized>(&self, key: &H) -> usize {
        (self.hasher.hash_one(key) as usize) % self.senders.len()
    }

    /// Queue a task on a bucket
    pub fn submit(&self, bucket: usize, task: Task<S, K>) -> Result<(), ExecutorError> {
        self.senders[bucket % self.senders.len()]
            .send(Command::Run(task))
            .map_err(|_| ExecutorError::Stopped)
    }

    /// Queue a task on the bucket owning `key`
    pub fn submit_keyed<H: Hash + ?Sized>(
        &self,
        key: &H,
        task: Task<S, K>,
    ) -> Result<(), ExecutorError> {
        self.submit(self.bucket_for(key), task)
    }

    /// Run `f` on a bucket and wait for its result
    pub async fn call<R, F>(&self, bucket: usize, f: F) -> Result<R, ExecutorError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Bucket<S, K>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(
            bucket,
            Box::new(move |b| {
                let _ = tx.send(f(b));
            }),
        )?;
        rx.await.map_err(|_| ExecutorError::TaskDropped)
    }

    /// Run `f` on the bucket owning `key` and wait for its result
    pub async fn call_keyed<H, R, F>(&self, key: &H, f: F) -> Result<R, ExecutorError>
    where
        H: Hash + ?Sized,
        R: Send + 'static,
        F: FnOnce(&mut Bucket<S, K>) -> R + Send + 'static,
    {
        self.call(self.bucket_for(key), f).await
    }

    /// Run `f` on every bucket; results are returned in bucket order
    pub async fn call_all<R, F>(&self, f: F) -> Result<Vec<R>, ExecutorError>
    where
        R: Send + 'static,
        F: Fn(&mut Bucket<S, K>) -> R + Clone + Send + 'static,
    {
        let mut receivers = Vec::with_capacity(self.senders.len());
        for bucket in 0..self.senders.len() {
            let (tx, rx) = oneshot::channel();
            let f = f.clone();
            self.submit(
                bucket,
                Box::new(move |b| {
                    let _ = tx.send(f(b));
                }),
            )?;
            receivers.push(rx);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(rx.await.map_err(|_| ExecutorError::TaskDropped)?);
        }
        Ok(results)
    }

    /// Ask every bucket to stop once the tasks already queued have run,
    /// without waiting for them
    pub fn stop(&self) {
        for tx in &self.senders {
            let _ = tx.send(Command::Shutdown);
        }
    }

    /// Stop all buckets after the tasks already queued have run and wait
    /// for their threads. Must not be called from a bucket thread.
    pub fn shutdown(&self) {
        self.stop();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("Bucket thread panicked during shutdown");
            }
        }
    }
}

impl<S, K> Drop for BucketPool<S, K> {
    fn drop(&mut self) {
        for tx in &self.senders {
            let _ = tx.send(Command::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestPool = BucketPool<Vec<u32>, u32>;
    type TestBucket = Bucket<Vec<u32>, u32>;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let pool: TestPool = BucketPool::start("test", 4, |_| Vec::new()).unwrap();
        for i in 0..100 {
            pool.submit(2, Box::new(move |b: &mut TestBucket| b.state.push(i))).unwrap();
        }
        let seen = pool.call(2, |b| b.state.clone()).await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_bucket_for_is_deterministic() {
        let a: TestPool = BucketPool::start("a", 8, |_| Vec::new()).unwrap();
        let b: TestPool = BucketPool::start("b", 8, |_| Vec::new()).unwrap();
        for key in ["dev-1", "dev-2", "sensors", "+", "#"] {
            assert_eq!(a.bucket_for(key), a.bucket_for(key));
            assert_eq!(a.bucket_for(key), b.bucket_for(key));
            assert!(a.bucket_for(key) < 8);
        }
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_call_all_visits_every_bucket() {
        let pool: TestPool = BucketPool::start("test", 3, |_| Vec::new()).unwrap();
        let ids = pool.call_all(|b| b.id()).await.unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_timer_fires_on_owning_bucket() {
        let pool: TestPool = BucketPool::start("test", 2, |_| Vec::new()).unwrap();
        let (tx, rx) = oneshot::channel();
        pool.submit(
            1,
            Box::new(move |b: &mut TestBucket| {
                b.schedule(
                    1,
                    Duration::from_millis(20),
                    Box::new(move |b: &mut TestBucket| {
                        let _ = tx.send(b.id());
                    }),
                );
            }),
        )
        .unwrap();

        let id = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let pool: TestPool = BucketPool::start("test", 1, |_| Vec::new()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        pool.submit(
            0,
            Box::new(move |b: &mut TestBucket| {
                b.schedule(
                    9,
                    Duration::from_millis(20),
                    Box::new(move |_: &mut TestBucket| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
                assert!(b.cancel(&9));
            }),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let pending = pool.call(0, |b| b.pending_timers()).await.unwrap();
        assert_eq!(pending, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let pool: TestPool = BucketPool::start("test", 1, |_| Vec::new()).unwrap();
        let result = pool
            .call(0, |_| -> u32 { panic!("boom") })
            .await;
        assert_eq!(result, Err(ExecutorError::TaskDropped));

        pool.submit(0, Box::new(|b: &mut TestBucket| b.state.push(1))).unwrap();
        let seen = pool.call(0, |b| b.state.clone()).await.unwrap();
        assert_eq!(seen, vec![1]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool: TestPool = BucketPool::start("test", 2, |_| Vec::new()).unwrap();
        pool.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            pool.submit(0, Box::new(|_: &mut TestBucket| {})),
            Err(ExecutorError::Stopped)
        );
    }
}
