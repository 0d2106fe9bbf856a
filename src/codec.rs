//! Record encodings.
//!
//! A record is a signed 64-bit integer. [`TextCodec`] is the default on-disk format: one base-10
//! integer per line, `\n` terminated, no header.

use std::io;
use std::io::prelude::*;

/// Record codec interface. Provides methods for reading and writing single records.
pub trait RecordCodec: Copy + Default + Send + Sync + 'static {
    /// Reads the next record. Returns `None` at the end of the stream.
    ///
    /// `scratch` is a reusable buffer owned by the reader.
    fn read_record<R: BufRead>(&self, reader: &mut R, scratch: &mut Vec<u8>) -> io::Result<Option<i64>>;

    /// Writes one record.
    fn write_record<W: Write>(&self, writer: &mut W, value: i64) -> io::Result<()>;
}

/// Newline-delimited base-10 text codec.
///
/// Surrounding whitespace is ignored and blank lines are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl RecordCodec for TextCodec {
    fn read_record<R: BufRead>(&self, reader: &mut R, scratch: &mut Vec<u8>) -> io::Result<Option<i64>> {
        loop {
            scratch.clear();
            if reader.read_until(b'\n', scratch)? == 0 {
                return Ok(None);
            }

            let line = std::str::from_utf8(scratch).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return line.parse::<i64>().map(Some).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid record {:?}: {}", line, err),
                )
            });
        }
    }

    fn write_record<W: Write>(&self, writer: &mut W, value: i64) -> io::Result<()> {
        writeln!(writer, "{}", value)
    }
}

/// Fixed-width binary codec: 8-byte little-endian integers, no delimiters.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl RecordCodec for BinaryCodec {
    fn read_record<R: BufRead>(&self, reader: &mut R, _scratch: &mut Vec<u8>) -> io::Result<Option<i64>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;

        return Ok(Some(i64::from_le_bytes(bytes)));
    }

    fn write_record<W: Write>(&self, writer: &mut W, value: i64) -> io::Result<()> {
        writer.write_all(&value.to_le_bytes())
    }
}

/// RMP (Rust MessagePack) codec.
/// For more information see https://msgpack.org/.
#[derive(Debug, Default, Clone, Copy)]
pub struct RmpCodec;

impl RecordCodec for RmpCodec {
    fn read_record<R: BufRead>(&self, reader: &mut R, _scratch: &mut Vec<u8>) -> io::Result<Option<i64>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        match rmp_serde::decode::from_read(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    }

    fn write_record<W: Write>(&self, writer: &mut W, value: i64) -> io::Result<()> {
        rmp_serde::encode::write(writer, &value).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
