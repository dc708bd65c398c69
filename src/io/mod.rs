mod http;
mod local;
mod memory;

pub use http::HttpRangeReader;
pub use local::{FileSink, LocalFileReader};
pub use memory::{MemoryReader, MemorySink};

use async_trait::async_trait;

use crate::error::ZipResult;

/// Trait for random access reading from a data source.
///
/// Implementations must support concurrent `read_at` calls; all readers in
/// this crate do. Reads are idempotent and bounds-enforced by the caller.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// One-time setup hook; called lazily before the first read. Adapters
    /// that probe their source in the constructor leave this a no-op.
    async fn init(&self) -> ZipResult<()> {
        Ok(())
    }

    /// Read data at the specified offset into the buffer.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZipResult<usize>;

    /// Get the total size of the data source.
    fn size(&self) -> u64;
}

/// Trait for an append-only byte sink, the write-side mirror of [`ReadAt`].
#[async_trait]
pub trait DataSink: Send {
    /// One-time setup hook; called before the first write.
    async fn init(&mut self) -> ZipResult<()> {
        Ok(())
    }

    /// Append the whole buffer to the sink.
    async fn write_all(&mut self, buf: &[u8]) -> ZipResult<()>;

    /// Bytes already present in the sink. A writer appending to an
    /// existing archive starts its offset accounting here.
    fn size(&self) -> u64 {
        0
    }
}

#[async_trait]
impl<R: ReadAt + ?Sized> ReadAt for std::sync::Arc<R> {
    async fn init(&self) -> ZipResult<()> {
        (**self).init().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZipResult<usize> {
        (**self).read_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Read exactly `buf.len()` bytes at `offset`, failing on short reads.
pub(crate) async fn read_exact_at<R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
    buf: &mut [u8],
) -> ZipResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = reader
            .read_at(offset + done as u64, &mut buf[done..])
            .await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "source ended before the requested range",
            )
            .into());
        }
        done += n;
    }
    Ok(())
}
