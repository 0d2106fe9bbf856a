//! Buffered run files.
//!
//! Partitions and sorted runs are plain files of encoded records. [`RunReader`] streams records
//! out of a file, [`RunWriter`] appends records to a freshly created (truncated) file.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::codec::RecordCodec;
use crate::error::SortError;

/// Sorted run stored on file system. Records are in non-decreasing order and the file is never
/// modified once the run is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedRun {
    path: PathBuf,
    records: u64,
}

impl SortedRun {
    pub fn new(path: PathBuf, records: u64) -> Self {
        SortedRun { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

/// Streaming record reader.
pub struct RunReader<C: RecordCodec> {
    path: PathBuf,
    reader: io::BufReader<fs::File>,
    scratch: Vec<u8>,
    codec: C,
    finished: bool,
}

impl<C: RecordCodec> RunReader<C> {
    /// Opens a run file for reading.
    ///
    /// # Arguments
    /// * `path` - File to be read
    /// * `codec` - Record encoding
    /// * `buf_size` - Read buffer size. If the parameter is [`None`] or zero the default buffer size is used.
    pub fn open(path: &Path, codec: C, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = fs::File::open(path).map_err(|err| SortError::io(path, err))?;
        let reader = match buf_size {
            // a zero-capacity reader reports every file as empty
            Some(buf_size) if buf_size > 0 => io::BufReader::with_capacity(buf_size, file),
            _ => io::BufReader::new(file),
        };

        return Ok(RunReader {
            path: path.to_path_buf(),
            reader,
            scratch: Vec::new(),
            codec,
            finished: false,
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<C: RecordCodec> Iterator for RunReader<C> {
    type Item = Result<i64, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.codec.read_record(&mut self.reader, &mut self.scratch) {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(SortError::io(&self.path, err)))
            }
        }
    }
}

/// Buffered record writer. Records are guaranteed to be visible to a later reader only after
/// [`RunWriter::finish`] succeeds.
pub struct RunWriter<C: RecordCodec> {
    path: PathBuf,
    writer: io::BufWriter<fs::File>,
    codec: C,
    written: u64,
}

impl<C: RecordCodec> RunWriter<C> {
    /// Creates (or truncates) a run file for writing.
    pub fn create(path: &Path, codec: C, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = fs::File::create(path).map_err(|err| SortError::io(path, err))?;
        let writer = match buf_size {
            Some(buf_size) if buf_size > 0 => io::BufWriter::with_capacity(buf_size, file),
            _ => io::BufWriter::new(file),
        };

        return Ok(RunWriter {
            path: path.to_path_buf(),
            writer,
            codec,
            written: 0,
        });
    }

    pub fn write(&mut self, value: i64) -> Result<(), SortError> {
        self.codec
            .write_record(&mut self.writer, value)
            .map_err(|err| SortError::io(&self.path, err))?;
        self.written += 1;

        return Ok(());
    }

    pub fn flush(&mut self) -> Result<(), SortError> {
        self.writer.flush().map_err(|err| SortError::io(&self.path, err))
    }

    /// Flushes and closes the file. Returns the number of records written.
    pub fn finish(mut self) -> Result<u64, SortError> {
        self.flush()?;
        return Ok(self.written);
    }
}
