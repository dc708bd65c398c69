use async_trait::async_trait;
use std::path::Path;

use super::{DataSink, ReadAt};
use crate::error::ZipResult;

/// Local file reader with random access support.
pub struct LocalFileReader {
    file: std::fs::File,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> ZipResult<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> ZipResult<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }

        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            Ok(file.read(buf)?)
        }
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Appending file sink for archive output.
pub struct FileSink {
    file: tokio::fs::File,
    size: u64,
}

impl FileSink {
    /// Create (or truncate) the file at `path`.
    pub async fn create(path: &Path) -> ZipResult<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self { file, size: 0 })
    }

    /// Open an existing file for appending; a writer built on top will
    /// place new entries after the current contents.
    pub async fn append(path: &Path) -> ZipResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl DataSink for FileSink {
    async fn write_all(&mut self, buf: &[u8]) -> ZipResult<()> {
        use tokio::io::AsyncWriteExt;
        self.file.write_all(buf).await?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}
