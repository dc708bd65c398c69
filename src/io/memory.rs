//! In-memory source and sink adapters.

use async_trait::async_trait;

use super::{DataSink, ReadAt};
use crate::error::ZipResult;

/// Random-access reader over an owned byte buffer.
pub struct MemoryReader {
    data: Vec<u8>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ReadAt for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZipResult<usize> {
        let start = (offset.min(self.data.len() as u64)) as usize;
        let end = (start + buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Appending sink that accumulates the archive in memory.
#[derive(Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write_all(&mut self, buf: &[u8]) -> ZipResult<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
