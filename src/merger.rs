//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log;

use crate::codec::{RecordCodec, TextCodec};
use crate::error::SortError;
use crate::run::{RunReader, RunWriter, SortedRun};

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// Equal items are yielded in ascending input index order.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<(T, usize)>>,
    chunks: Vec<C::IntoIter>,
    initiated: bool,

    error_type: PhantomData<E>,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            initiated: false,
            error_type: PhantomData,
        };
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.chunks[idx].next() {
            self.items.push(Reverse((item?, idx)));
        }
        return Ok(());
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.pull(idx) {
                    return Some(Err(err));
                }
            }
        }

        let Reverse((result, idx)) = self.items.pop()?;
        if let Err(err) = self.pull(idx) {
            return Some(Err(err));
        }

        return Some(Ok(result));
    }
}

/// What to do with a merge input that cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Abort the merge with an I/O error.
    Strict,
    /// Log a warning and treat the input as empty.
    SkipUnreadable,
}

/// Result of a file merge.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Merged run.
    pub run: SortedRun,
    /// Inputs skipped because they could not be opened.
    pub skipped: Vec<PathBuf>,
}

/// Merges sorted run files into a single sorted run file.
#[derive(Debug, Clone, Copy)]
pub struct RunMerger<C: RecordCodec = TextCodec> {
    codec: C,
    rw_buf_size: Option<usize>,
    policy: OpenPolicy,
}

impl<C: RecordCodec> RunMerger<C> {
    pub fn new(codec: C, rw_buf_size: Option<usize>, policy: OpenPolicy) -> Self {
        RunMerger {
            codec,
            rw_buf_size,
            policy,
        }
    }

    pub fn policy(&self) -> OpenPolicy {
        self.policy
    }

    /// Merges `inputs` into `output`. Each input is read once, sequentially; only one record per
    /// input is held in memory.
    ///
    /// Read errors after an input was opened abort the merge regardless of the policy. On error
    /// `output` may be left partially written.
    pub fn merge<P: AsRef<Path>>(&self, inputs: &[P], output: &Path) -> Result<MergeOutcome, SortError> {
        let mut readers = Vec::with_capacity(inputs.len());
        let mut skipped = Vec::new();

        for input in inputs {
            let input = input.as_ref();
            match RunReader::open(input, self.codec, self.rw_buf_size) {
                Ok(reader) => readers.push(reader),
                Err(err) if self.policy == OpenPolicy::SkipUnreadable => {
                    log::warn!("skipping unreadable run: {}", err);
                    skipped.push(input.to_path_buf());
                }
                Err(err) => return Err(err),
            }
        }

        let mut writer = RunWriter::create(output, self.codec, self.rw_buf_size)?;
        for record in BinaryHeapMerger::new(readers) {
            writer.write(record?)?;
        }
        let written = writer.finish()?;

        return Ok(MergeOutcome {
            run: SortedRun::new(output.to_path_buf(), written),
            skipped,
        });
    }
}

#[cfg(test)]
mod test {
    use rstest::*;
    use std::cmp::Reverse;
    use std::error::Error;
    use std::fs;
    use std::io::{self, ErrorKind};
    use std::path::PathBuf;

    use super::{BinaryHeapMerger, OpenPolicy, RunMerger};
    use crate::codec::TextCodec;
    use crate::error::SortError;

    #[rstest]
    #[case(
        vec![],
        vec![],
    )]
    #[case(
        vec![
            vec![],
            vec![]
        ],
        vec![],
    )]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        vec![Ok(1), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)],
    )]
    #[case(
        vec![
            vec![Ok(-2), Ok(2), Ok(2)],
            vec![Ok(-2), Ok(2)],
        ],
        vec![Ok(-2), Ok(-2), Ok(2), Ok(2), Ok(2)],
    )]
    #[case(
        vec![
            vec![Result::Err(io::Error::new(ErrorKind::Other, "test error"))]
        ],
        vec![
            Result::Err(io::Error::new(ErrorKind::Other, "test error"))
        ],
    )]
    #[case(
        vec![
            vec![Ok(3), Result::Err(io::Error::new(ErrorKind::Other, "test error"))],
            vec![Ok(1), Ok(2)],
        ],
        vec![
            Ok(1),
            Ok(2),
            Result::Err(io::Error::new(ErrorKind::Other, "test error")),
        ],
    )]
    fn test_merger(
        #[case] chunks: Vec<Vec<Result<i64, io::Error>>>,
        #[case] expected_result: Vec<Result<i64, io::Error>>,
    ) {
        let merger = BinaryHeapMerger::new(chunks);
        let actual_result: Vec<Result<i64, io::Error>> = merger.collect();
        assert!(
            compare_vectors_of_result::<_, io::Error>(&actual_result, &expected_result),
            "actual={:?}, expected={:?}",
            actual_result,
            expected_result
        );
    }

    #[test]
    fn test_merger_tie_break() {
        let chunks: Vec<Vec<Result<i64, io::Error>>> = vec![vec![Ok(7), Ok(8)], vec![Ok(7)], vec![Ok(7)]];
        let mut merger = BinaryHeapMerger::new(chunks);

        assert_eq!(merger.next().unwrap().unwrap(), 7);
        // equal heads are taken in input order
        assert_eq!(merger.items.peek(), Some(&Reverse((7, 1))));
    }

    fn compare_vectors_of_result<T: PartialEq, E: Error + 'static>(
        actual: &Vec<Result<T, E>>,
        expected: &Vec<Result<T, E>>,
    ) -> bool {
        actual.len() == expected.len()
            && actual
                .into_iter()
                .zip(expected)
                .all(
                    |(actual_result, expected_result)| match (actual_result, expected_result) {
                        (Ok(actual_result), Ok(expected_result)) if actual_result == expected_result => true,
                        (Err(actual_err), Err(expected_err)) => actual_err.to_string() == expected_err.to_string(),
                        _ => false,
                    },
                )
    }

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_runs(dir: &tempfile::TempDir, runs: &[&str]) -> Vec<PathBuf> {
        runs.iter()
            .enumerate()
            .map(|(idx, content)| {
                let path = dir.path().join(format!("run-{}", idx));
                fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }

    #[rstest]
    fn test_run_merge(tmp_dir: tempfile::TempDir) {
        let inputs = write_runs(&tmp_dir, &["1\n3\n5\n", "-4\n3\n", "", "9\n"]);
        let output = tmp_dir.path().join("merged");

        let outcome = RunMerger::new(TextCodec, None, OpenPolicy::Strict)
            .merge(&inputs, &output)
            .unwrap();

        assert_eq!(outcome.run.records(), 6);
        assert!(outcome.skipped.is_empty());
        assert_eq!(fs::read_to_string(&output).unwrap(), "-4\n1\n3\n3\n5\n9\n");
    }

    #[rstest]
    fn test_merge_associativity(tmp_dir: tempfile::TempDir) {
        let inputs = write_runs(&tmp_dir, &["1\n4\n4\n8\n", "-3\n4\n10\n", "0\n2\n4\n12\n"]);
        let merger = RunMerger::new(TextCodec, Some(8), OpenPolicy::Strict);

        let ab = tmp_dir.path().join("ab");
        let ab_c = tmp_dir.path().join("ab_c");
        let abc = tmp_dir.path().join("abc");

        merger.merge(&inputs[..2], &ab).unwrap();
        merger.merge(&[ab.clone(), inputs[2].clone()], &ab_c).unwrap();
        merger.merge(&inputs, &abc).unwrap();

        assert_eq!(fs::read(&ab_c).unwrap(), fs::read(&abc).unwrap());
    }

    #[rstest]
    fn test_strict_merge_unreadable_input(tmp_dir: tempfile::TempDir) {
        let mut inputs = write_runs(&tmp_dir, &["1\n2\n"]);
        let missing = tmp_dir.path().join("missing");
        inputs.push(missing.clone());
        let output = tmp_dir.path().join("merged");

        let result = RunMerger::new(TextCodec, None, OpenPolicy::Strict).merge(&inputs, &output);

        match result {
            Err(SortError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected I/O error, got {:?}", other),
        }
    }

    #[rstest]
    fn test_skipping_merge_unreadable_input(tmp_dir: tempfile::TempDir) {
        let mut inputs = write_runs(&tmp_dir, &["1\n5\n", "2\n"]);
        let missing = tmp_dir.path().join("missing");
        inputs.insert(1, missing.clone());
        let output = tmp_dir.path().join("merged");

        let outcome = RunMerger::new(TextCodec, None, OpenPolicy::SkipUnreadable)
            .merge(&inputs, &output)
            .unwrap();

        assert_eq!(outcome.skipped, vec![missing]);
        assert_eq!(outcome.run.records(), 3);
        assert_eq!(fs::read_to_string(&output).unwrap(), "1\n2\n5\n");
    }

    #[rstest]
    #[case(OpenPolicy::Strict)]
    #[case(OpenPolicy::SkipUnreadable)]
    fn test_merge_corrupted_input(tmp_dir: tempfile::TempDir, #[case] policy: OpenPolicy) {
        let inputs = write_runs(&tmp_dir, &["1\n2\n", "3\nnot-a-number\n"]);
        let output = tmp_dir.path().join("merged");

        let result = RunMerger::new(TextCodec, None, policy).merge(&inputs, &output);

        assert!(matches!(result, Err(SortError::Io { .. })));
    }
}
