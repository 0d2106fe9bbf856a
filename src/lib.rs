//! `par-ext-sort` is a concurrent external merge sort of signed 64-bit integers.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. The input is a set of partitions, each small
//! enough to be sorted in memory. Every partition is sorted by a worker pool task into a sorted run, and runs are
//! merged pairwise as soon as two of them are available until a single run remains.
//! For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Worker pool:**
//!   a fixed set of threads draining one FIFO queue, shared by chunk sorting and merging.
//! * **Incremental merge:**
//!   sorting and merging overlap in time, runs form a balanced binary merge tree and a merge task never
//!   holds more than one record per input in memory.
//! * **Record encodings:**
//!   newline-delimited text by default, fixed-width little-endian binary or `MessagePack`.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use par_ext_sort::{ExternalSorter, ExternalSorterBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_threads_number(4)
//!         .with_tmp_dir(path::Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter
//!         .sort_directory(path::Path::new("partitions"), path::Path::new("sorted.txt"))
//!         .unwrap();
//!     println!("{} records sorted", summary.records);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod merger;
pub mod pool;
pub mod run;
pub mod scheduler;
pub mod sort;
pub mod split;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, MemoryLimitedBuffer, MemoryLimitedBufferBuilder};
pub use chunk::ChunkSorter;
pub use codec::{BinaryCodec, RecordCodec, RmpCodec, TextCodec};
pub use error::SortError;
pub use merger::{BinaryHeapMerger, MergeOutcome, OpenPolicy, RunMerger};
pub use pool::{PoolError, PoolState, TaskHandle, WorkerPool};
pub use run::{RunReader, RunWriter, SortedRun};
pub use scheduler::{MergeScheduler, SchedulerConfig, Settled};
pub use sort::{discover_partitions, ExternalSorter, ExternalSorterBuilder, MergeStrategy, SortSummary};
pub use split::split_file;
