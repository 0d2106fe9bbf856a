//! External sorter.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log;

use crate::codec::{RecordCodec, TextCodec};
use crate::error::SortError;
use crate::merger::{OpenPolicy, RunMerger};
use crate::pool::WorkerPool;
use crate::run::SortedRun;
use crate::scheduler::{MergeScheduler, SchedulerConfig};

/// How sorted runs are merged into the final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Runs are merged pairwise as soon as two are available, overlapping chunk sorting and
    /// merging. Any unreadable partition or run fails the sort.
    Incremental,
    /// All partitions are sorted first, then merged by a single k-way merge. Partitions that fail
    /// to sort and runs that fail to open are skipped with a warning.
    Flat,
}

/// Sort statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSummary {
    /// Partitions sorted into runs.
    pub partitions_sorted: usize,
    /// Partitions skipped because they could not be sorted.
    pub partitions_skipped: usize,
    /// Runs skipped by the final merge because they could not be opened.
    pub runs_skipped: usize,
    /// Merges performed.
    pub merges: usize,
    /// Records written to the output.
    pub records: u64,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<C: RecordCodec = TextCodec> {
    /// Number of worker threads.
    threads_number: Option<usize>,
    /// Maximum number of merge tasks in flight.
    merge_concurrency: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Partition and run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Merge strategy.
    strategy: MergeStrategy,
    /// Sort chunks with rayon's parallel sort.
    parallel_chunk_sort: bool,
    /// Record encoding.
    codec: C,
}

impl ExternalSorterBuilder<TextCodec> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<C: RecordCodec> ExternalSorterBuilder<C> {
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<C>, SortError> {
        let threads_number = self
            .threads_number
            .unwrap_or_else(|| thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
            .max(1);

        return Ok(ExternalSorter {
            threads_number,
            merge_concurrency: self.merge_concurrency.unwrap_or(threads_number).max(1),
            tmp_dir: ExternalSorter::<C>::init_tmp_directory(self.tmp_dir.as_deref())?,
            rw_buf_size: self.rw_buf_size,
            strategy: self.strategy,
            parallel_chunk_sort: self.parallel_chunk_sort,
            codec: self.codec,
        });
    }

    /// Sets number of worker threads running chunk sort and merge tasks.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets maximum number of merge tasks in flight.
    pub fn with_merge_concurrency(mut self, merge_concurrency: usize) -> ExternalSorterBuilder<C> {
        self.merge_concurrency = Some(merge_concurrency);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets partition and run read/write buffer size. Zero selects the default size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets merge strategy.
    pub fn with_strategy(mut self, strategy: MergeStrategy) -> ExternalSorterBuilder<C> {
        self.strategy = strategy;
        return self;
    }

    /// Enables rayon's parallel sort for in-memory chunk sorting.
    pub fn with_parallel_chunk_sort(mut self, parallel: bool) -> ExternalSorterBuilder<C> {
        self.parallel_chunk_sort = parallel;
        return self;
    }

    /// Sets record encoding of partitions, runs and the output.
    pub fn with_codec<D: RecordCodec>(self, codec: D) -> ExternalSorterBuilder<D> {
        ExternalSorterBuilder {
            threads_number: self.threads_number,
            merge_concurrency: self.merge_concurrency,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            strategy: self.strategy,
            parallel_chunk_sort: self.parallel_chunk_sort,
            codec,
        }
    }
}

impl<C: RecordCodec> Default for ExternalSorterBuilder<C> {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            merge_concurrency: None,
            tmp_dir: None,
            rw_buf_size: None,
            strategy: MergeStrategy::Incremental,
            parallel_chunk_sort: false,
            codec: C::default(),
        }
    }
}

/// External sorter.
pub struct ExternalSorter<C: RecordCodec = TextCodec> {
    /// Number of worker threads.
    threads_number: usize,
    /// Maximum number of merge tasks in flight.
    merge_concurrency: usize,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Partition and run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Merge strategy.
    strategy: MergeStrategy,
    /// Sort chunks with rayon's parallel sort.
    parallel_chunk_sort: bool,
    /// Record encoding.
    codec: C,
}

impl<C: RecordCodec> ExternalSorter<C> {
    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Sorts every regular file of `input_dir` (non-recursive) into `output`.
    /// Entries whose metadata cannot be read are skipped.
    pub fn sort_directory(&self, input_dir: &Path, output: &Path) -> Result<SortSummary, SortError> {
        let partitions = discover_partitions(input_dir)?;
        log::info!("{} partitions found in {}", partitions.len(), input_dir.display());

        self.sort_partitions(partitions, output)
    }

    /// Sorts all records of `partitions` into `output`.
    ///
    /// `output` is only written once the sort completed: on error it is left untouched.
    /// No partitions produce an empty output.
    ///
    /// # Arguments
    /// * `partitions` - Unsorted partition files, each small enough to be sorted in memory
    /// * `output` - Result file
    pub fn sort_partitions<I, P>(&self, partitions: I, output: &Path) -> Result<SortSummary, SortError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let run_dir = tempfile::tempdir_in(self.tmp_dir.path()).map_err(|err| SortError::TempDir(err))?;
        log::info!(
            "external sort started (strategy: {:?}, threads: {}, merge concurrency: {})",
            self.strategy,
            self.threads_number,
            self.merge_concurrency
        );

        let pool = Arc::new(WorkerPool::start(self.threads_number)?);
        let scheduler = MergeScheduler::new(
            Arc::clone(&pool),
            run_dir.path(),
            self.codec,
            SchedulerConfig {
                merge_concurrency: self.merge_concurrency,
                pairwise_merge: self.strategy == MergeStrategy::Incremental,
                skip_failed_partitions: self.strategy == MergeStrategy::Flat,
                parallel_sort: self.parallel_chunk_sort,
                rw_buf_size: self.rw_buf_size,
            },
        );

        let mut scheduled = Ok(());
        for partition in partitions {
            scheduled = scheduler.schedule_partition(partition.as_ref().to_path_buf());
            if scheduled.is_err() {
                scheduler.halt();
                break;
            }
        }

        let settled = scheduler.wait();
        pool.shutdown();
        scheduled?;
        let settled = settled?;

        let mut summary = SortSummary {
            partitions_sorted: settled.chunks_sorted,
            partitions_skipped: settled.chunks_skipped,
            runs_skipped: 0,
            merges: settled.merges_completed,
            records: 0,
        };

        let final_run = match self.strategy {
            MergeStrategy::Incremental => settled.runs.into_iter().next(),
            MergeStrategy::Flat if settled.runs.is_empty() => None,
            MergeStrategy::Flat => {
                let inputs: Vec<PathBuf> = settled.runs.into_iter().map(SortedRun::into_path).collect();
                log::debug!("merging {} runs", inputs.len());

                let outcome = RunMerger::new(self.codec, self.rw_buf_size, OpenPolicy::SkipUnreadable)
                    .merge(&inputs, &run_dir.path().join("final.run"))?;
                summary.runs_skipped = outcome.skipped.len();
                summary.merges += 1;
                Some(outcome.run)
            }
        };

        summary.records = publish(final_run.as_ref(), output)?;
        log::info!(
            "external sort done: {} records written to {}",
            summary.records,
            output.display()
        );

        return Ok(summary);
    }
}

/// Lists regular files of `dir` in name order. Entries that cannot be inspected are skipped.
pub fn discover_partitions(dir: &Path) -> Result<Vec<PathBuf>, SortError> {
    let mut partitions = Vec::new();

    for entry in fs::read_dir(dir).map_err(|err| SortError::io(dir, err))? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("skipping unreadable entry of {}: {}", dir.display(), err);
                continue;
            }
        };

        match fs::metadata(entry.path()) {
            Ok(metadata) if metadata.is_file() => partitions.push(entry.path()),
            Ok(_) => log::debug!("skipping {}: not a regular file", entry.path().display()),
            Err(err) => log::warn!("skipping {}: {}", entry.path().display(), err),
        }
    }
    partitions.sort();

    return Ok(partitions);
}

/// Moves the final run to `output`, or creates an empty `output` if there is no run.
/// Returns the number of published records.
fn publish(run: Option<&SortedRun>, output: &Path) -> Result<u64, SortError> {
    if let Some(run) = run {
        if fs::rename(run.path(), output).is_ok() {
            return Ok(run.records());
        }
    }

    // rename is not possible across file systems: stage a copy next to the output instead
    let output_dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(output_dir).map_err(|err| SortError::io(output_dir, err))?;
    let staged_path = staged.path().to_path_buf();

    let records = match run {
        Some(run) => {
            let mut source = fs::File::open(run.path()).map_err(|err| SortError::io(run.path(), err))?;
            io::copy(&mut source, staged.as_file_mut()).map_err(|err| SortError::io(&staged_path, err))?;
            run.records()
        }
        None => 0,
    };

    staged.persist(output).map_err(|err| SortError::io(output, err.error))?;

    return Ok(records);
}
