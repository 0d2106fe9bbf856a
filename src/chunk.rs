//! Chunk sorter.

use std::path::Path;

use log;
use rayon::slice::ParallelSliceMut;

use crate::codec::{RecordCodec, TextCodec};
use crate::error::SortError;
use crate::run::{RunReader, RunWriter, SortedRun};

/// Sorts a single partition in memory and writes it out as a sorted run.
///
/// The whole partition is loaded into memory, so partitions must be sized by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSorter<C: RecordCodec = TextCodec> {
    codec: C,
    rw_buf_size: Option<usize>,
    parallel: bool,
}

impl<C: RecordCodec> ChunkSorter<C> {
    /// Creates a chunk sorter.
    ///
    /// # Arguments
    /// * `codec` - Partition and run encoding
    /// * `rw_buf_size` - File read/write buffer size
    pub fn new(codec: C, rw_buf_size: Option<usize>) -> Self {
        ChunkSorter {
            codec,
            rw_buf_size,
            parallel: false,
        }
    }

    /// Sorts each chunk with rayon's parallel sort instead of a single-threaded one.
    pub fn with_parallel_sort(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        return self;
    }

    /// Reads every record of `input`, sorts them in ascending order and writes them to `output`.
    ///
    /// `output` is fully overwritten. On error it may be left partially written and must be
    /// discarded.
    pub fn sort_partition(&self, input: &Path, output: &Path) -> Result<SortedRun, SortError> {
        let reader = RunReader::open(input, self.codec, self.rw_buf_size)?;
        let mut records = Vec::new();
        for record in reader {
            records.push(record?);
        }

        log::debug!("sorting chunk {} ({} records)", input.display(), records.len());
        if self.parallel {
            records.par_sort_unstable();
        } else {
            records.sort_unstable();
        }

        let mut writer = RunWriter::create(output, self.codec, self.rw_buf_size)?;
        for record in records {
            writer.write(record)?;
        }
        let written = writer.finish()?;

        return Ok(SortedRun::new(output.to_path_buf(), written));
    }
}
