//! Sorting errors.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};

use crate::pool::PoolError;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Partition, run or output file could not be opened, read or written.
    Io { path: PathBuf, source: io::Error },
    /// Worker pool error.
    Pool(PoolError),
    /// A merge task failed. Its inputs are left unconsumed and must not be treated as valid runs.
    MergeFailed { inputs: Vec<PathBuf>, source: Box<SortError> },
    /// The sort was aborted by an earlier failure that has already been reported.
    Aborted,
}

impl SortError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SortError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::Io { source, .. } => Some(source),
            SortError::Pool(err) => Some(err),
            SortError::MergeFailed { source, .. } => Some(&**source),
            SortError::Aborted => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory not created: {}", err),
            SortError::Io { path, source } => write!(f, "I/O operation on {} failed: {}", path.display(), source),
            SortError::Pool(err) => write!(f, "worker pool error: {}", err),
            SortError::MergeFailed { inputs, source } => {
                let inputs: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
                write!(f, "merge of [{}] failed: {}", inputs.join(", "), source)
            }
            SortError::Aborted => write!(f, "sort aborted by an earlier failure"),
        }
    }
}

impl From<PoolError> for SortError {
    fn from(err: PoolError) -> Self {
        SortError::Pool(err)
    }
}
