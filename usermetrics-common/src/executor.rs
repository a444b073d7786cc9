//! Parallel batch execution
//!
//! Splits a list of subject records into contiguous partitions, runs each
//! partition on its own task with its own backing-store handle, and merges
//! the partial result lists in partition order.
//!
//! Per-item failures are skipped. A worker that fails as a whole (handle
//! cannot be opened, task panics, or the worker returns
//! [`Error::WorkerFailed`]) fails the entire `execute` call.

use crate::{Error, Result};
use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Opens an isolated resource handle for one worker invocation.
///
/// The handle is dropped when the invocation ends, on every exit path.
#[async_trait]
pub trait HandleSource: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn open(&self) -> Result<Self::Handle>;
}

/// Per-subject computation supplied by a metric
#[async_trait]
pub trait BatchWorker: Send + Sync + 'static {
    type Item: Send + Sync + 'static;
    type Shared: Send + Sync + 'static;
    type Handle: Send + 'static;
    type Output: Send + 'static;

    /// Compute the result for one item.
    ///
    /// * `Ok(Some(_))` - item produced a result
    /// * `Ok(None)` - item skipped
    /// * `Err(Error::WorkerFailed(_))` - whole batch fails
    /// * any other `Err` - item skipped, batch continues
    async fn process(
        &self,
        handle: &mut Self::Handle,
        item: &Self::Item,
        shared: &Self::Shared,
    ) -> Result<Option<Self::Output>>;
}

/// Counts for one `execute` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub items: usize,
    pub produced: usize,
    pub skipped: usize,
    pub partitions: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.items += other.items;
        self.produced += other.produced;
        self.skipped += other.skipped;
        self.partitions += other.partitions;
    }
}

/// Partition `len` items across `workers` by ceiling division.
///
/// Partition `i` covers `ceil(len/workers) * i .. ceil(len/workers) * (i+1)`
/// clamped to `len`, so trailing partitions may be short or empty. The
/// worker count is capped at `len` (at least one partition is returned).
pub fn partition_bounds(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.clamp(1, len.max(1));
    let size = len.div_ceil(workers);
    (0..workers)
        .map(|i| {
            let start = (size * i).min(len);
            let end = (size * (i + 1)).min(len);
            start..end
        })
        .collect()
}

/// Fan-out executor with a fixed worker count
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
    worker_count: usize,
}

impl BatchExecutor {
    /// `worker_count` of 0 or 1 runs sequentially on the calling task
    pub fn new(worker_count: usize) -> Self {
        Self { worker_count }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run `worker` over `items` and return the merged results.
    pub async fn execute<W, H>(
        &self,
        items: Vec<W::Item>,
        worker: Arc<W>,
        shared: Arc<W::Shared>,
        handles: Arc<H>,
    ) -> Result<Vec<W::Output>>
    where
        W: BatchWorker,
        H: HandleSource<Handle = W::Handle>,
    {
        Ok(self
            .execute_with_report(items, worker, shared, handles)
            .await?
            .0)
    }

    /// Same as [`execute`](Self::execute), also returning item counts
    pub async fn execute_with_report<W, H>(
        &self,
        items: Vec<W::Item>,
        worker: Arc<W>,
        shared: Arc<W::Shared>,
        handles: Arc<H>,
    ) -> Result<(Vec<W::Output>, BatchReport)>
    where
        W: BatchWorker,
        H: HandleSource<Handle = W::Handle>,
    {
        let started = Instant::now();
        let total = items.len();

        let (results, report) = if self.worker_count <= 1 {
            run_sequential(items, worker, shared, handles).await?
        } else {
            self.run_parallel(items, worker, shared, handles).await?
        };

        info!(
            "Batch completed in {:?} | Items: {} | Produced: {} | Skipped: {} | Partitions: {}",
            started.elapsed(),
            total,
            report.produced,
            report.skipped,
            report.partitions
        );

        Ok((results, report))
    }

    async fn run_parallel<W, H>(
        &self,
        items: Vec<W::Item>,
        worker: Arc<W>,
        shared: Arc<W::Shared>,
        handles: Arc<H>,
    ) -> Result<(Vec<W::Output>, BatchReport)>
    where
        W: BatchWorker,
        H: HandleSource<Handle = W::Handle>,
    {
        let bounds = partition_bounds(items.len(), self.worker_count);
        let mut remaining = items.into_iter();
        let mut join_set = JoinSet::new();

        for (index, range) in bounds.into_iter().enumerate() {
            let chunk: Vec<W::Item> = remaining.by_ref().take(range.len()).collect();
            if chunk.is_empty() {
                continue;
            }
            debug!("Dispatching partition {} ({} items)", index, chunk.len());

            let worker = Arc::clone(&worker);
            let shared = Arc::clone(&shared);
            let handles = Arc::clone(&handles);
            join_set.spawn(async move {
                (index, run_partition(index, chunk, worker, shared, handles).await)
            });
        }

        // No cancellation: every dispatched partition runs to completion,
        // the first fatal failure is reported afterwards.
        let mut finished = Vec::new();
        let mut first_failure: Option<Error> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => finished.push((index, outcome)),
                Ok((index, Err(e))) => {
                    error!("Partition {} failed: {}", index, e);
                    first_failure.get_or_insert(e);
                }
                Err(join_error) => {
                    error!("Partition task aborted: {}", join_error);
                    first_failure.get_or_insert(Error::WorkerFailed(format!(
                        "partition task aborted: {}",
                        join_error
                    )));
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }

        finished.sort_by_key(|(index, _)| *index);
        let mut results = Vec::new();
        let mut report = BatchReport::default();
        for (_, (partial, partial_report)) in finished {
            results.extend(partial);
            report.absorb(&partial_report);
        }
        Ok((results, report))
    }
}

/// The whole batch as a single partition on its own task, so a crashing
/// worker fails the call the same way it does on the parallel path
async fn run_sequential<W, H>(
    items: Vec<W::Item>,
    worker: Arc<W>,
    shared: Arc<W::Shared>,
    handles: Arc<H>,
) -> Result<(Vec<W::Output>, BatchReport)>
where
    W: BatchWorker,
    H: HandleSource<Handle = W::Handle>,
{
    tokio::spawn(run_partition(0, items, worker, shared, handles))
        .await
        .map_err(|join_error| {
            error!("Worker task aborted: {}", join_error);
            Error::WorkerFailed(format!("worker task aborted: {}", join_error))
        })?
}

/// One worker invocation over one partition
async fn run_partition<W, H>(
    index: usize,
    chunk: Vec<W::Item>,
    worker: Arc<W>,
    shared: Arc<W::Shared>,
    handles: Arc<H>,
) -> Result<(Vec<W::Output>, BatchReport)>
where
    W: BatchWorker,
    H: HandleSource<Handle = W::Handle>,
{
    if chunk.is_empty() {
        return Ok((Vec::new(), BatchReport::default()));
    }

    let mut handle = handles.open().await.map_err(|e| {
        Error::WorkerFailed(format!("partition {}: failed to open handle: {}", index, e))
    })?;

    let mut results = Vec::with_capacity(chunk.len());
    let mut report = BatchReport {
        items: chunk.len(),
        partitions: 1,
        ..BatchReport::default()
    };

    for (position, item) in chunk.iter().enumerate() {
        match worker.process(&mut handle, item, &shared).await {
            Ok(Some(output)) => {
                results.push(output);
                report.produced += 1;
            }
            Ok(None) => report.skipped += 1,
            Err(e) if e.is_fatal_for_batch() => {
                drop(handle);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Partition {}: skipping item {} after error: {}",
                    index, position, e
                );
                report.skipped += 1;
            }
        }
    }

    drop(handle);
    debug!(
        "Partition {} done: {} produced, {} skipped",
        index, report.produced, report.skipped
    );
    Ok((results, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handle that records its release
    struct CountingHandle {
        released: Arc<AtomicUsize>,
    }

    impl Drop for CountingHandle {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingSource {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        fail_open: bool,
    }

    #[async_trait]
    impl HandleSource for CountingSource {
        type Handle = CountingHandle;

        async fn open(&self) -> Result<CountingHandle> {
            if self.fail_open {
                return Err(Error::Internal("connection refused".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CountingHandle {
                released: Arc::clone(&self.released),
            })
        }
    }

    /// Multiplies each item by `factor`; skips, errors or fails on marked items
    struct TimesWorker {
        skip: Option<u32>,
        error_on: Option<u32>,
        fatal_on: Option<u32>,
        panic_on: Option<u32>,
    }

    impl TimesWorker {
        fn plain() -> Self {
            Self {
                skip: None,
                error_on: None,
                fatal_on: None,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl BatchWorker for TimesWorker {
        type Item = u32;
        type Shared = u32;
        type Handle = CountingHandle;
        type Output = u32;

        async fn process(
            &self,
            _handle: &mut CountingHandle,
            item: &u32,
            factor: &u32,
        ) -> Result<Option<u32>> {
            if self.panic_on == Some(*item) {
                panic!("worker crashed on {}", item);
            }
            if self.fatal_on == Some(*item) {
                return Err(Error::WorkerFailed(format!("fatal on {}", item)));
            }
            if self.error_on == Some(*item) {
                return Err(Error::InvalidInput(format!("bad item {}", item)));
            }
            if self.skip == Some(*item) {
                return Ok(None);
            }
            Ok(Some(item * factor))
        }
    }

    async fn run(
        worker_count: usize,
        items: Vec<u32>,
        worker: TimesWorker,
        source: Arc<CountingSource>,
    ) -> Result<(Vec<u32>, BatchReport)> {
        BatchExecutor::new(worker_count)
            .execute_with_report(items, Arc::new(worker), Arc::new(10), source)
            .await
    }

    #[test]
    fn test_partition_bounds_ceiling_division() {
        assert_eq!(partition_bounds(10, 3), vec![0..4, 4..8, 8..10]);
        assert_eq!(partition_bounds(10, 4), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(partition_bounds(7, 1), vec![0..7]);
    }

    #[test]
    fn test_partition_bounds_more_workers_than_items() {
        assert_eq!(partition_bounds(2, 4), vec![0..1, 1..2]);
        assert_eq!(partition_bounds(3, usize::MAX), vec![0..1, 1..2, 2..3]);
        // Capping the worker count can still leave a trailing empty partition
        let bounds = partition_bounds(5, 4);
        assert_eq!(bounds, vec![0..2, 2..4, 4..5, 5..5]);
        assert_eq!(bounds.iter().map(|r| r.len()).sum::<usize>(), 5);
    }

    #[test]
    fn test_partition_bounds_empty_input() {
        assert_eq!(partition_bounds(0, 3), vec![0..0]);
        assert_eq!(partition_bounds(0, 0), vec![0..0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_results_cover_all_items() {
        let source = Arc::new(CountingSource::default());
        let items: Vec<u32> = (1..=10).collect();
        let (results, report) = run(3, items, TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();

        let mut sorted = results.clone();
        sorted.sort();
        assert_eq!(sorted, (1..=10).map(|x| x * 10).collect::<Vec<_>>());
        // Partitions are merged in partition order
        assert_eq!(results, (1..=10).map(|x| x * 10).collect::<Vec<_>>());
        assert_eq!(report.partitions, 3);
        assert_eq!(report.produced, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_and_parallel_agree() {
        let items: Vec<u32> = (0..37).collect();
        let sequential = run(1, items.clone(), TimesWorker::plain(), Arc::default())
            .await
            .unwrap()
            .0;
        let parallel = run(4, items, TimesWorker::plain(), Arc::default())
            .await
            .unwrap()
            .0;

        let a: BTreeSet<_> = sequential.into_iter().collect();
        let b: BTreeSet<_> = parallel.into_iter().collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_sequential_opens_one_handle() {
        let source = Arc::new(CountingSource::default());
        let (results, report) = run(0, vec![1, 2, 3], TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();
        assert_eq!(results, vec![10, 20, 30]);
        assert_eq!(report.partitions, 1);
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_partition_gets_own_handle_and_releases_it() {
        let source = Arc::new(CountingSource::default());
        run(3, (1..=10).collect(), TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();
        assert_eq!(source.opened.load(Ordering::SeqCst), 3);
        assert_eq!(source.released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_partitions_do_not_open_handles() {
        let source = Arc::new(CountingSource::default());
        let (results, report) = run(5, vec![1, 2], TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();
        assert_eq!(results, vec![10, 20]);
        assert_eq!(report.partitions, 2);
        assert_eq!(source.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_input_returns_empty() {
        let source = Arc::new(CountingSource::default());
        let (results, _) = run(1, Vec::new(), TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_item_is_skipped() {
        let worker = TimesWorker {
            skip: Some(2),
            error_on: Some(7),
            ..TimesWorker::plain()
        };
        let (results, report) = run(3, (1..=10).collect(), worker, Arc::default())
            .await
            .unwrap();
        assert!(!results.contains(&20));
        assert!(!results.contains(&70));
        assert_eq!(results.len(), 8);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.items, 10);
    }

    #[tokio::test]
    async fn test_fatal_worker_error_fails_batch_and_releases_handles() {
        let source = Arc::new(CountingSource::default());
        let worker = TimesWorker {
            fatal_on: Some(9),
            ..TimesWorker::plain()
        };
        let result = run(3, (1..=10).collect(), worker, Arc::clone(&source)).await;
        assert!(matches!(result, Err(Error::WorkerFailed(_))));
        assert_eq!(
            source.opened.load(Ordering::SeqCst),
            source.released.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_batch() {
        let source = Arc::new(CountingSource::default());
        let worker = TimesWorker {
            panic_on: Some(5),
            ..TimesWorker::plain()
        };
        let result = run(2, (1..=10).collect(), worker, Arc::clone(&source)).await;
        assert!(matches!(result, Err(Error::WorkerFailed(_))));
        // Unwinding drops the handle of the crashed partition too
        assert_eq!(source.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_sequential_batch() {
        for worker_count in [0, 1] {
            let source = Arc::new(CountingSource::default());
            let worker = TimesWorker {
                panic_on: Some(2),
                ..TimesWorker::plain()
            };
            let result = run(worker_count, vec![1, 2, 3], worker, Arc::clone(&source)).await;
            assert!(matches!(result, Err(Error::WorkerFailed(_))));
            assert_eq!(source.opened.load(Ordering::SeqCst), 1);
            assert_eq!(source.released.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_huge_worker_count_dispatches_one_partition_per_item() {
        let source = Arc::new(CountingSource::default());
        let (results, report) = run(usize::MAX, vec![1, 2, 3], TimesWorker::plain(), Arc::clone(&source))
            .await
            .unwrap();
        assert_eq!(results, vec![10, 20, 30]);
        assert_eq!(report.partitions, 3);
        assert_eq!(source.released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handle_open_failure_is_fatal() {
        let source = Arc::new(CountingSource {
            fail_open: true,
            ..CountingSource::default()
        });
        let result = run(2, vec![1, 2, 3], TimesWorker::plain(), source).await;
        assert!(matches!(result, Err(Error::WorkerFailed(_))));
    }
}
