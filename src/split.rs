//! Input splitting.
//!
//! Cuts one large record stream into unsorted partitions small enough for the chunk sorter.

use std::fs;
use std::path::{Path, PathBuf};

use log;

use crate::buffer::{ChunkBuffer, ChunkBufferBuilder};
use crate::codec::RecordCodec;
use crate::error::SortError;
use crate::run::{RunReader, RunWriter};

/// Splits `input` into partitions named `part-NNNNNN` inside `output_dir`.
/// Returns the created partitions in input order.
///
/// # Arguments
/// * `input` - File to be split
/// * `output_dir` - Partitions directory, created if missing
/// * `codec` - Record encoding of both the input and the partitions
/// * `buffer_builder` - Builder of the buffer limiting partition size
/// * `rw_buf_size` - File read/write buffer size
pub fn split_file<C, B>(
    input: &Path,
    output_dir: &Path,
    codec: C,
    buffer_builder: &B,
    rw_buf_size: Option<usize>,
) -> Result<Vec<PathBuf>, SortError>
where
    C: RecordCodec,
    B: ChunkBufferBuilder,
{
    fs::create_dir_all(output_dir).map_err(|err| SortError::io(output_dir, err))?;

    let mut partitions = Vec::new();
    let mut chunk_buf = buffer_builder.build();

    for record in RunReader::open(input, codec, rw_buf_size)? {
        chunk_buf.push(record?);

        if chunk_buf.is_full() {
            partitions.push(dump_partition(output_dir, partitions.len(), chunk_buf, codec, rw_buf_size)?);
            chunk_buf = buffer_builder.build();
        }
    }

    if chunk_buf.len() > 0 {
        partitions.push(dump_partition(output_dir, partitions.len(), chunk_buf, codec, rw_buf_size)?);
    }

    log::info!("{} split into {} partitions", input.display(), partitions.len());

    return Ok(partitions);
}

fn dump_partition<C: RecordCodec>(
    output_dir: &Path,
    idx: usize,
    buffer: impl ChunkBuffer,
    codec: C,
    rw_buf_size: Option<usize>,
) -> Result<PathBuf, SortError> {
    let path = output_dir.join(format!("part-{:06}", idx));

    let mut writer = RunWriter::create(&path, codec, rw_buf_size)?;
    for record in buffer {
        writer.write(record)?;
    }
    let written = writer.finish()?;
    log::debug!("partition {} written ({} records)", path.display(), written);

    return Ok(path);
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::split_file;
    use crate::buffer::MemoryLimitedBufferBuilder;
    use crate::codec::TextCodec;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_split_partitions(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input");
        fs::write(&input, "5\n1\n3\n9\n2\n4\n-7\n").unwrap();
        let output_dir = tmp_dir.path().join("parts");

        let partitions = split_file(&input, &output_dir, TextCodec, &MemoryLimitedBufferBuilder::new(24), None).unwrap();

        let contents: Vec<String> = partitions.iter().map(|p| fs::read_to_string(p).unwrap()).collect();
        assert_eq!(contents, vec!["5\n1\n3\n", "9\n2\n4\n", "-7\n"]);
        assert_eq!(partitions[0], output_dir.join("part-000000"));
    }

    #[rstest]
    fn test_split_by_memory(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input");
        fs::write(&input, "1\n2\n3\n4\n").unwrap();
        let output_dir = tmp_dir.path().join("parts");

        let partitions = split_file(&input, &output_dir, TextCodec, &MemoryLimitedBufferBuilder::new(16), None).unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!(fs::read_to_string(&partitions[1]).unwrap(), "3\n4\n");
    }

    #[rstest]
    fn test_split_empty_input(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input");
        fs::write(&input, "").unwrap();

        let partitions = split_file(&input, tmp_dir.path(), TextCodec, &MemoryLimitedBufferBuilder::new(24), None).unwrap();

        assert!(partitions.is_empty());
    }
}
