use crate::counter::count;
use crate::source::Source;
use crate::types::{CountResult, CounterConfig, CounterError, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Stream of per-origin outcomes. Closed once every worker has exited.
pub type ResultStream = mpsc::Receiver<CountResult>;

/// What a worker does with each source it receives.
#[derive(Debug, Clone)]
pub struct CountJob {
    target: Arc<[u8]>,
    buffer_size: usize,
}

impl CountJob {
    pub fn new(target: impl Into<Vec<u8>>, buffer_size: usize) -> Result<Self> {
        let target = target.into();
        if target.is_empty() {
            return Err(CounterError::InvalidConfig("substring must not be empty".to_string()));
        }
        if buffer_size == 0 {
            return Err(CounterError::InvalidConfig("read buffer size must be above zero".to_string()));
        }

        Ok(Self {
            target: target.into(),
            buffer_size,
        })
    }

    pub fn from_config(config: &CounterConfig) -> Result<Self> {
        Self::new(config.substring.clone(), config.buffer_size)
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

struct PoolShared {
    max_workers: usize,
    idle_timeout: Duration,
    /// Live worker count. The only lock on pool state; never held across an await.
    workers: Mutex<usize>,
    /// Upper bound of tasks sitting in the queue. Raised under `workers`, lowered on
    /// dequeue without it, so a stale read can only postpone a retirement.
    queued: AtomicUsize,
    /// Shares the single-consumer receiver between workers. Held only while
    /// waiting for the next task, never while one runs.
    queue: tokio::sync::Mutex<mpsc::Receiver<Source>>,
    results: mpsc::Sender<CountResult>,
    job: CountJob,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PoolShared {
    fn lock_workers(&self) -> MutexGuard<'_, usize> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a worker if the cap allows it. `workers` must be the guard of `self.workers`.
    fn grow(self: &Arc<Self>, workers: &mut MutexGuard<'_, usize>) -> bool {
        if **workers >= self.max_workers {
            return false;
        }

        **workers += 1;
        let slot = WorkerSlot {
            shared: Arc::clone(self),
            released: false,
        };
        self.tracker.spawn(worker(slot));
        debug!("Spawned worker ({}/{})", **workers, self.max_workers);
        true
    }

    /// Spawns a replacement after an abnormal worker exit if tasks are still waiting.
    fn replace_if_backlogged(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut workers = self.lock_workers();
        if self.queued.load(Ordering::SeqCst) > 0 && self.grow(&mut workers) {
            info!("Spawned replacement worker for queued tasks");
        }
    }

    async fn next_task(&self) -> Option<Source> {
        let source = self.queue.lock().await.recv().await;
        if source.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        source
    }

    async fn emit(&self, result: CountResult) {
        let origin = result.origin.clone();
        if self.results.send(result).await.is_err() {
            warn!("Result for {} dropped: nobody is reading results", origin);
        }
    }

    async fn reject(&self, source: Source, reason: CounterError) {
        self.emit(CountResult::failure(source.origin().to_string(), reason)).await;
    }
}

/// Holds one unit of the live worker count and gives it back exactly once.
struct WorkerSlot {
    shared: Arc<PoolShared>,
    released: bool,
}

impl WorkerSlot {
    /// Gives the slot back unless a task is waiting in the queue. Checked under the
    /// worker lock so a concurrent dispatch either sees the freed slot or the worker stays.
    fn retire_if_idle(&mut self) -> bool {
        let mut workers = self.shared.lock_workers();
        if self.shared.queued.load(Ordering::SeqCst) > 0 {
            return false;
        }

        *workers = workers.saturating_sub(1);
        self.released = true;
        true
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if !self.released {
            let mut workers = self.shared.lock_workers();
            *workers = workers.saturating_sub(1);
        }
    }
}

/// Elastic pool of counting workers.
///
/// Workers are spawned on dispatch while below `max_workers` and retire after
/// `worker_idle_timeout` without a task. Every source handed to [`WorkerPool::process`]
/// produces exactly one [`CountResult`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    queue: mpsc::Sender<Source>,
}

impl WorkerPool {
    pub fn new(config: &CounterConfig, job: CountJob, cancel: CancellationToken) -> (Self, ResultStream) {
        let (queue_tx, queue_rx) = mpsc::channel(config.task_queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(config.result_queue_capacity.max(1));

        let shared = Arc::new(PoolShared {
            max_workers: config.max_workers.max(1),
            idle_timeout: config.worker_idle_timeout,
            workers: Mutex::new(0),
            queued: AtomicUsize::new(0),
            queue: tokio::sync::Mutex::new(queue_rx),
            results: results_tx,
            job,
            cancel,
            tracker: TaskTracker::new(),
        });

        (Self { shared, queue: queue_tx }, results_rx)
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    pub fn worker_count(&self) -> usize {
        *self.shared.lock_workers()
    }

    /// Dispatches one source. Blocks while the pool is saturated and the queue is
    /// full; a source that can't be queued because of cancellation is answered
    /// with a `Cancelled` result.
    pub async fn process(&self, source: Source) {
        {
            let mut workers = self.shared.lock_workers();
            self.shared.grow(&mut workers);
        }

        let permit = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            permit = self.queue.reserve() => permit.ok(),
        };

        let Some(permit) = permit else {
            self.shared.reject(source, CounterError::Cancelled).await;
            return;
        };

        // A worker may have retired while we waited for room.
        let mut workers = self.shared.lock_workers();
        if *workers == 0 {
            self.shared.grow(&mut workers);
        }
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(source);
    }

    /// Dispatches every source from `tasks` until the channel closes or the pool
    /// is cancelled, then shuts down.
    pub async fn run(self, mut tasks: mpsc::Receiver<Source>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => None,
                source = tasks.recv() => source,
            };

            match next {
                Some(source) => self.process(source).await,
                None => break,
            }
        }

        tasks.close();
        while let Ok(source) = tasks.try_recv() {
            self.shared.reject(source, CounterError::Cancelled).await;
        }

        self.shutdown().await;
    }

    /// Closes the task queue and waits for every worker to exit. Tasks left in the
    /// queue by workers that stopped on cancellation are answered with `Cancelled`.
    /// The result stream closes once this returns.
    pub async fn shutdown(self) {
        let WorkerPool { shared, queue } = self;
        drop(queue);

        shared.tracker.close();
        shared.tracker.wait().await;

        let leftovers: Vec<Source> = {
            let mut queue = shared.queue.lock().await;
            queue.close();
            let mut leftovers = Vec::new();
            while let Ok(source) = queue.try_recv() {
                leftovers.push(source);
            }
            leftovers
        };

        for source in leftovers {
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            shared.reject(source, CounterError::Cancelled).await;
        }

        debug!("Worker pool stopped");
    }
}

/// Spawns a pool fed by `tasks` and returns its result stream.
pub fn consume(
    config: &CounterConfig,
    job: CountJob,
    cancel: CancellationToken,
    tasks: mpsc::Receiver<Source>,
) -> ResultStream {
    let (pool, results) = WorkerPool::new(config, job, cancel);
    tokio::spawn(pool.run(tasks));
    results
}

enum Next {
    Task(Source),
    Idle,
    Stop,
}

async fn worker(mut slot: WorkerSlot) {
    let shared = Arc::clone(&slot.shared);
    let mut buf = vec![0u8; shared.job.buffer_size];

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Next::Stop,
            source = shared.next_task() => source.map_or(Next::Stop, Next::Task),
            _ = tokio::time::sleep(shared.idle_timeout) => Next::Idle,
        };

        match next {
            Next::Task(source) => {
                let origin = source.origin().to_string();
                let processed = AssertUnwindSafe(process_source(source, &mut buf, &shared.job, &shared.cancel))
                    .catch_unwind()
                    .await;

                match processed {
                    Ok(result) => shared.emit(result).await,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("Recovered in worker while processing {}: {}", origin, message);
                        shared
                            .emit(CountResult::failure(origin, CounterError::WorkerPanic(message)))
                            .await;
                        drop(slot);
                        shared.replace_if_backlogged();
                        return;
                    }
                }
            }
            Next::Idle => {
                if slot.retire_if_idle() {
                    debug!("Worker retired after {:?} idle", shared.idle_timeout);
                    return;
                }
            }
            Next::Stop => return,
        }
    }
}

async fn process_source(
    mut source: Source,
    buf: &mut [u8],
    job: &CountJob,
    cancel: &CancellationToken,
) -> CountResult {
    let origin = source.origin().to_string();
    let counted = match source.load(cancel).await {
        Ok(()) => count(&mut source, buf, &job.target, cancel).await,
        Err(e) => Err(e),
    };
    source.close();

    match counted {
        Ok(subtotal) => CountResult::success(origin, subtotal),
        Err(e) => CountResult::failure(origin, e),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
