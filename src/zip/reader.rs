//! High-level archive reading and entry extraction.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::codec::{run_codec, InflatePipeline, ProgressFn, WorkerPool};
use crate::config::{default_config, Config};
use crate::error::{ZipError, ZipResult};
use crate::io::{read_exact_at, DataSink, MemorySink, ReadAt};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipEntry, LFH_SIGNATURE, LFH_SIZE};

/// Options for one extraction.
#[derive(Clone, Default)]
pub struct ExtractOptions {
    /// Password for WinZip-AES entries.
    pub password: Option<String>,
    /// Skip CRC-32 verification when false. Encrypted entries are always
    /// authenticated by their HMAC tag regardless.
    pub check_signature: Option<bool>,
    pub on_progress: Option<ProgressFn>,
}

impl ExtractOptions {
    pub fn password(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Self::default()
        }
    }

    fn verify_crc(&self) -> bool {
        self.check_signature.unwrap_or(true)
    }
}

/// Archive reader: enumerates entries and extracts their data.
///
/// Generic over the [`ReadAt`] source, so the same reader drives local
/// files, in-memory buffers and HTTP Range sources. Entries returned by
/// [`entries`](Self::entries) are plain values and stay valid for the
/// life of the reader.
pub struct ZipReader<R: ReadAt> {
    parser: ZipParser<R>,
    config: Config,
    pool: WorkerPool,
    init: OnceCell<()>,
}

impl<R: ReadAt> ZipReader<R> {
    pub fn new(reader: Arc<R>) -> ZipResult<Self> {
        Self::with_config(reader, default_config())
    }

    pub fn with_config(reader: Arc<R>, config: Config) -> ZipResult<Self> {
        config.validate()?;
        Ok(Self {
            parser: ZipParser::new(reader),
            pool: WorkerPool::new(&config),
            config,
            init: OnceCell::new(),
        })
    }

    async fn ensure_init(&self) -> ZipResult<()> {
        self.init
            .get_or_try_init(|| self.parser.reader().init())
            .await?;
        Ok(())
    }

    /// List all entries in the archive, in central directory order.
    pub async fn entries(&self) -> ZipResult<Vec<ZipEntry>> {
        self.ensure_init().await?;
        self.parser.list_entries().await
    }

    /// Extract one entry into `sink`, returning the bytes written.
    pub async fn extract<S: DataSink + ?Sized>(
        &self,
        entry: &ZipEntry,
        sink: &mut S,
        options: &ExtractOptions,
    ) -> ZipResult<u64> {
        self.ensure_init().await?;

        // The local header's name and extra field may differ in length
        // from the central directory copy; the data offset comes from
        // the local record.
        let mut lfh = [0u8; LFH_SIZE];
        read_exact_at(&**self.parser.reader(), entry.local_header_offset, &mut lfh).await?;
        if &lfh[0..4] != LFH_SIGNATURE {
            return Err(ZipError::LocalFileHeaderNotFound);
        }
        let name_length = u16::from_le_bytes([lfh[26], lfh[27]]) as u64;
        let extra_length = u16::from_le_bytes([lfh[28], lfh[29]]) as u64;
        let data_offset = entry.local_header_offset + LFH_SIZE as u64 + name_length + extra_length;

        if entry.password_protected && options.password.is_none() {
            return Err(ZipError::Encrypted);
        }

        let compressed = match entry.compression_method {
            CompressionMethod::Stored => false,
            CompressionMethod::Deflate => true,
            other => return Err(ZipError::UnsupportedCompression(other.as_u16())),
        };

        let expected_crc =
            (options.verify_crc() && !entry.password_protected).then_some(entry.crc32);
        let codec = InflatePipeline::new(compressed, options.password.as_deref(), expected_crc);

        let output = run_codec(
            Box::new(codec),
            &self.pool,
            &**self.parser.reader(),
            data_offset,
            entry.compressed_size,
            sink,
            self.config.effective_chunk_size(),
            options.on_progress.as_ref(),
        )
        .await?;
        Ok(output.length)
    }

    /// Extract one entry into memory.
    pub async fn read(&self, entry: &ZipEntry, options: &ExtractOptions) -> ZipResult<Vec<u8>> {
        let mut sink = MemorySink::new();
        self.extract(entry, &mut sink, options).await?;
        Ok(sink.into_bytes())
    }
}
