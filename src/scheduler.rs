//! Incremental merge scheduler.
//!
//! Sorted runs are collected in a shared run pool. As soon as the pool holds two runs, both are
//! removed and a merge task is submitted to the worker pool; the merged run is fed back into the
//! run pool. Chunk sorting and merging overlap in time and the merges form an approximately
//! balanced binary merge tree.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log;

use crate::chunk::ChunkSorter;
use crate::codec::RecordCodec;
use crate::error::SortError;
use crate::merger::{OpenPolicy, RunMerger};
use crate::pool::{PoolError, WorkerPool};
use crate::run::SortedRun;

/// Scheduler settings.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of merge tasks in flight.
    pub merge_concurrency: usize,
    /// Merge runs pairwise as soon as two are available. When disabled, runs are only collected.
    pub pairwise_merge: bool,
    /// Skip partitions that fail to sort instead of halting the scheduler.
    pub skip_failed_partitions: bool,
    /// Sort chunks with rayon's parallel sort.
    pub parallel_sort: bool,
    /// File read/write buffer size.
    pub rw_buf_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            merge_concurrency: usize::MAX,
            pairwise_merge: true,
            skip_failed_partitions: false,
            parallel_sort: false,
            rw_buf_size: None,
        }
    }
}

/// Scheduler state once every scheduled task has finished.
#[derive(Debug)]
pub struct Settled {
    /// Unconsumed runs, oldest first. Holds at most one run when pairwise merge is enabled.
    pub runs: Vec<SortedRun>,
    pub chunks_sorted: usize,
    pub chunks_skipped: usize,
    pub merges_completed: usize,
}

#[derive(Clone, Copy)]
enum Origin {
    External,
    Chunk,
    Merge,
}

struct MergeJob {
    id: usize,
    first: SortedRun,
    second: SortedRun,
}

/// Runs not consumed by a merge yet, plus the task bookkeeping guarded by the same lock.
#[derive(Default)]
struct RunPool {
    runs: VecDeque<SortedRun>,
    chunks_pending: usize,
    chunks_sorted: usize,
    chunks_skipped: usize,
    merges_in_flight: usize,
    merges_completed: usize,
    runs_added: usize,
    runs_produced: usize,
    next_chunk_id: usize,
    next_merge_id: usize,
    halted: bool,
    failed: bool,
    failure: Option<SortError>,
}

impl RunPool {
    fn produce(&mut self, run: SortedRun, origin: Origin) {
        match origin {
            Origin::External => self.runs_added += 1,
            Origin::Chunk => {
                self.chunks_pending -= 1;
                self.chunks_sorted += 1;
            }
            Origin::Merge => {
                self.merges_in_flight -= 1;
                self.merges_completed += 1;
            }
        }
        self.runs_produced += 1;
        self.runs.push_back(run);
    }

    /// Removes the two oldest runs if a merge may start now. Checking and removing happen under
    /// one lock so a run is never handed to two merges.
    fn take_pair(&mut self, merge_concurrency: usize) -> Option<MergeJob> {
        if self.halted || self.runs.len() < 2 || self.merges_in_flight >= merge_concurrency {
            return None;
        }

        let first = self.runs.pop_front()?;
        let second = self.runs.pop_front()?;
        self.merges_in_flight += 1;
        self.next_merge_id += 1;

        return Some(MergeJob {
            id: self.next_merge_id - 1,
            first,
            second,
        });
    }

    fn is_settled(&self) -> bool {
        self.chunks_pending == 0 && self.merges_in_flight == 0
    }
}

struct Inner<C: RecordCodec> {
    pool: Arc<WorkerPool>,
    run_dir: PathBuf,
    sorter: ChunkSorter<C>,
    merger: RunMerger<C>,
    config: SchedulerConfig,
    state: Mutex<RunPool>,
    settled: Condvar,
}

impl<C: RecordCodec> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, RunPool> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn produce(self: &Arc<Self>, run: SortedRun, origin: Origin) {
        let jobs = {
            let mut state = self.lock();
            state.produce(run, origin);

            let mut jobs = Vec::new();
            if self.config.pairwise_merge {
                while let Some(job) = state.take_pair(self.config.merge_concurrency) {
                    jobs.push(job);
                }
            }
            jobs
        };
        self.settled.notify_all();

        for job in jobs {
            self.submit_merge(job);
        }
    }

    fn fail(&self, origin: Origin, err: SortError) {
        {
            let mut state = self.lock();
            match origin {
                Origin::External => {}
                Origin::Chunk => state.chunks_pending -= 1,
                Origin::Merge => state.merges_in_flight -= 1,
            }
            state.halted = true;
            state.failed = true;
            if state.failure.is_none() {
                state.failure = Some(err);
            } else {
                log::debug!("subsequent failure ignored: {}", err);
            }
        }
        self.settled.notify_all();
    }

    fn sort_chunk(self: &Arc<Self>, id: usize, partition: &Path) {
        let output = self.run_dir.join(format!("chunk-{:06}.run", id));

        match self.sorter.sort_partition(partition, &output) {
            Ok(run) => {
                log::debug!("chunk {} sorted into {}", partition.display(), output.display());
                self.produce(run, Origin::Chunk);
            }
            Err(err) if self.config.skip_failed_partitions => {
                log::warn!("skipping partition {}: {}", partition.display(), err);
                let _ = fs::remove_file(&output);
                {
                    let mut state = self.lock();
                    state.chunks_pending -= 1;
                    state.chunks_skipped += 1;
                }
                self.settled.notify_all();
            }
            Err(err) => {
                log::error!("partition {} not sorted: {}", partition.display(), err);
                let _ = fs::remove_file(&output);
                self.fail(Origin::Chunk, err);
            }
        }
    }

    fn submit_merge(self: &Arc<Self>, job: MergeJob) {
        log::debug!(
            "merge {} scheduled: {} + {}",
            job.id,
            job.first.path().display(),
            job.second.path().display()
        );
        let inputs = vec![job.first.path().to_path_buf(), job.second.path().to_path_buf()];
        let task_inputs = inputs.clone();

        let inner = Arc::clone(self);
        let submitted = self.pool.submit(move || {
            let guard = UnwindGuard::merge(&*inner, task_inputs);
            inner.merge(job);
            guard.disarm();
        });

        if let Err(err) = submitted {
            self.fail(
                Origin::Merge,
                SortError::MergeFailed {
                    inputs,
                    source: Box::new(SortError::Pool(err)),
                },
            );
        }
    }

    fn merge(self: &Arc<Self>, job: MergeJob) {
        let output = self.run_dir.join(format!("merge-{:06}.run", job.id));
        let expected_records = job.first.records() + job.second.records();
        let inputs = [job.first.into_path(), job.second.into_path()];

        match self.merger.merge(&inputs, &output) {
            Ok(outcome) => {
                if outcome.run.records() != expected_records {
                    log::warn!(
                        "merge {} wrote {} records, its inputs were reported to hold {}",
                        job.id,
                        outcome.run.records(),
                        expected_records
                    );
                }
                log::debug!("merge {} completed ({} records)", job.id, outcome.run.records());

                for input in &inputs {
                    if let Err(err) = fs::remove_file(input) {
                        log::warn!("consumed run {} not removed: {}", input.display(), err);
                    }
                }
                self.produce(outcome.run, Origin::Merge);
            }
            Err(err) => {
                log::error!("merge {} failed: {}", job.id, err);
                let _ = fs::remove_file(&output);
                self.fail(
                    Origin::Merge,
                    SortError::MergeFailed {
                        inputs: inputs.to_vec(),
                        source: Box::new(err),
                    },
                );
            }
        }
    }
}

/// Settles the bookkeeping of a task that unwound before reporting its outcome, so that
/// [`MergeScheduler::wait`] cannot block forever. A merge task that unwinds is reported as a
/// failed merge of its inputs.
struct UnwindGuard<'a, C: RecordCodec> {
    inner: &'a Inner<C>,
    origin: Origin,
    inputs: Vec<PathBuf>,
    armed: bool,
}

impl<'a, C: RecordCodec> UnwindGuard<'a, C> {
    fn chunk(inner: &'a Inner<C>) -> Self {
        UnwindGuard {
            inner,
            origin: Origin::Chunk,
            inputs: Vec::new(),
            armed: true,
        }
    }

    fn merge(inner: &'a Inner<C>, inputs: Vec<PathBuf>) -> Self {
        UnwindGuard {
            inner,
            origin: Origin::Merge,
            inputs,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<'a, C: RecordCodec> Drop for UnwindGuard<'a, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let err = SortError::Pool(PoolError::TaskPanicked);
        let err = match self.origin {
            Origin::Merge => SortError::MergeFailed {
                inputs: std::mem::take(&mut self.inputs),
                source: Box::new(err),
            },
            Origin::Chunk | Origin::External => err,
        };
        self.inner.fail(self.origin, err);
    }
}

/// Incremental merge scheduler.
///
/// Cloning yields another handle to the same run pool.
pub struct MergeScheduler<C: RecordCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: RecordCodec> Clone for MergeScheduler<C> {
    fn clone(&self) -> Self {
        MergeScheduler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RecordCodec> MergeScheduler<C> {
    /// Creates a scheduler submitting its tasks to `pool`.
    ///
    /// # Arguments
    /// * `pool` - Worker pool running chunk sort and merge tasks
    /// * `run_dir` - Directory sorted runs are written to
    /// * `codec` - Partition and run encoding
    /// * `config` - Scheduler settings
    pub fn new(pool: Arc<WorkerPool>, run_dir: &Path, codec: C, config: SchedulerConfig) -> Self {
        let sorter = ChunkSorter::new(codec, config.rw_buf_size).with_parallel_sort(config.parallel_sort);
        let merger = RunMerger::new(codec, config.rw_buf_size, OpenPolicy::Strict);

        MergeScheduler {
            inner: Arc::new(Inner {
                pool,
                run_dir: run_dir.to_path_buf(),
                sorter,
                merger,
                config: SchedulerConfig {
                    merge_concurrency: config.merge_concurrency.max(1),
                    ..config
                },
                state: Mutex::new(RunPool::default()),
                settled: Condvar::new(),
            }),
        }
    }

    /// Submits a chunk sort task for `partition`. The sorted run is fed into the run pool once
    /// the task completes.
    ///
    /// Fails if the worker pool no longer accepts tasks. Does nothing once the scheduler halted.
    pub fn schedule_partition(&self, partition: PathBuf) -> Result<(), SortError> {
        let id = {
            let mut state = self.inner.lock();
            if state.halted {
                log::debug!("scheduler halted, partition {} ignored", partition.display());
                return Ok(());
            }
            state.chunks_pending += 1;
            state.next_chunk_id += 1;
            state.next_chunk_id - 1
        };

        let inner = Arc::clone(&self.inner);
        let submitted = self.inner.pool.submit(move || {
            let guard = UnwindGuard::chunk(&*inner);
            inner.sort_chunk(id, &partition);
            guard.disarm();
        });

        if let Err(err) = submitted {
            {
                let mut state = self.inner.lock();
                state.chunks_pending -= 1;
                state.halted = true;
                state.failed = true;
            }
            self.inner.settled.notify_all();
            return Err(SortError::Pool(err));
        }

        return Ok(());
    }

    /// Adds an already sorted run to the run pool and starts a merge if two runs are available.
    pub fn on_run_produced(&self, run: SortedRun) {
        self.inner.produce(run, Origin::External);
    }

    /// Stops scheduling new merges and chunk sorts. Tasks already submitted still run.
    pub fn halt(&self) {
        self.inner.lock().halted = true;
    }

    /// Blocks until no chunk sort or merge task is outstanding.
    ///
    /// Returns the unconsumed runs. Once any task failed, the first call returns that failure and
    /// every later call returns [`SortError::Aborted`]: the leftover runs of a failed sort are
    /// never handed out.
    pub fn wait(&self) -> Result<Settled, SortError> {
        let mut state = self.inner.lock();
        while !state.is_settled() {
            state = self.inner.settled.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        if state.failed {
            return Err(state.failure.take().unwrap_or(SortError::Aborted));
        }

        debug_assert_eq!(
            state.runs_produced,
            state.chunks_sorted + state.merges_completed + state.runs_added
        );
        debug_assert!(state.halted || !self.inner.config.pairwise_merge || state.runs.len() <= 1);

        return Ok(Settled {
            runs: state.runs.drain(..).collect(),
            chunks_sorted: state.chunks_sorted,
            chunks_skipped: state.chunks_skipped,
            merges_completed: state.merges_completed,
        });
    }
}
