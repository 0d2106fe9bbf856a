//! Partition buffers used when splitting an input stream.

use std::mem;

/// Buffer builder.
pub trait ChunkBufferBuilder {
    type Buffer: ChunkBuffer;

    /// Creates a new empty buffer.
    fn build(&self) -> Self::Buffer;
}

/// Records accumulated for one partition. Iterating the buffer yields them in push order.
pub trait ChunkBuffer: IntoIterator<Item = i64> {
    fn push(&mut self, record: i64);

    fn len(&self) -> usize;

    /// Checks whether the partition reached its size limit.
    fn is_full(&self) -> bool;
}

/// Builds [`MemoryLimitedBuffer`]s holding at most `limit` bytes of records.
pub struct MemoryLimitedBufferBuilder {
    limit: u64,
}

impl MemoryLimitedBufferBuilder {
    pub fn new(limit: u64) -> Self {
        MemoryLimitedBufferBuilder { limit }
    }
}

impl ChunkBufferBuilder for MemoryLimitedBufferBuilder {
    type Buffer = MemoryLimitedBuffer;

    fn build(&self) -> Self::Buffer {
        MemoryLimitedBuffer {
            limit: self.limit,
            records: Vec::new(),
        }
    }
}

/// Buffer limited by the in-memory size of its records.
pub struct MemoryLimitedBuffer {
    limit: u64,
    records: Vec<i64>,
}

impl MemoryLimitedBuffer {
    /// In-memory size of the buffered records in bytes.
    pub fn mem_size(&self) -> u64 {
        (self.records.len() * mem::size_of::<i64>()) as u64
    }
}

impl ChunkBuffer for MemoryLimitedBuffer {
    fn push(&mut self, record: i64) {
        self.records.push(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_full(&self) -> bool {
        self.mem_size() >= self.limit
    }
}

impl IntoIterator for MemoryLimitedBuffer {
    type Item = i64;
    type IntoIter = std::vec::IntoIter<i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::{ChunkBuffer, ChunkBufferBuilder, MemoryLimitedBufferBuilder};

    #[test]
    fn test_memory_limited_buffer() {
        let builder = MemoryLimitedBufferBuilder::new(20);
        let mut buffer = builder.build();

        buffer.push(-1);
        buffer.push(2);
        assert_eq!(buffer.mem_size(), 16);
        assert!(!buffer.is_full());

        buffer.push(3);
        assert_eq!(buffer.mem_size(), 24);
        assert!(buffer.is_full());

        assert_eq!(buffer.into_iter().collect::<Vec<_>>(), vec![-1, 2, 3]);
    }
}
