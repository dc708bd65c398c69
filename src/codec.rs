//! Streaming codec pipelines and the chunked transfer driver.
//!
//! A [`Codec`] turns one entry's byte stream into its on-disk form (write
//! side) or back (read side). Pipelines compose up to three stages:
//!
//! - read: AES decrypt -> raw-deflate decompress -> CRC-32 verify
//! - write: CRC-32 -> raw-deflate compress -> AES encrypt
//!
//! The chunked driver pulls bounded chunks from a [`ReadAt`] source,
//! pushes them through the codec (optionally on a blocking worker), and
//! appends the output to a [`DataSink`], reporting progress along the way.

use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::sync::Semaphore;

use crate::aes::{AesDecryptor, AesEncryptor};
use crate::config::Config;
use crate::crc32::Crc32;
use crate::error::{ZipError, ZipResult};
use crate::io::{read_exact_at, DataSink, ReadAt};

/// Progress callback: `(bytes_done, bytes_total)` of the input stream.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of draining a codec.
pub(crate) struct CodecFlush {
    pub data: Vec<u8>,
    /// CRC-32 of the plaintext for unencrypted entries. Encrypted entries
    /// authenticate via the HMAC tag inside `data` instead.
    pub signature: Option<u32>,
}

/// One entry's streaming transform.
pub(crate) trait Codec: Send {
    fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>>;
    fn flush(&mut self) -> ZipResult<CodecFlush>;
}

const CODEC_BUF: usize = 32 * 1024;

/// Raw-deflate compressor kept across chunks.
struct Deflater {
    compress: Compress,
}

impl Deflater {
    fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level), false),
        }
    }

    fn append(&mut self, mut input: &[u8]) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        while !input.is_empty() {
            out.reserve(CODEC_BUF);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut out, FlushCompress::None)
                .map_err(|_| ZipError::BadFormat("deflate stream error"))?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
        }
        Ok(out)
    }

    fn finish(&mut self) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            out.reserve(CODEC_BUF);
            let status = self
                .compress
                .compress_vec(&[], &mut out, FlushCompress::Finish)
                .map_err(|_| ZipError::BadFormat("deflate stream error"))?;
            if status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }
}

/// Raw-deflate decompressor kept across chunks.
struct Inflater {
    decompress: Decompress,
}

impl Inflater {
    fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
        }
    }

    fn append(&mut self, mut input: &[u8]) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        while !input.is_empty() {
            out.reserve(CODEC_BUF);
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(input, &mut out, FlushDecompress::None)
                .map_err(|_| ZipError::BadFormat("invalid deflate data"))?;
            let consumed = (self.decompress.total_in() - before) as usize;
            input = &input[consumed..];
            if status == Status::StreamEnd {
                // Trailing bytes after the deflate stream are not ours to
                // consume; the container sizes should prevent this.
                break;
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            out.reserve(CODEC_BUF);
            let status = self
                .decompress
                .decompress_vec(&[], &mut out, FlushDecompress::Finish)
                .map_err(|_| ZipError::BadFormat("invalid deflate data"))?;
            if status != Status::Ok {
                return Ok(out);
            }
        }
    }
}

/// Read-side pipeline: decrypt, then inflate, then verify.
pub(crate) struct InflatePipeline {
    decryptor: Option<AesDecryptor>,
    inflater: Option<Inflater>,
    /// Rolling CRC and the expected central-directory value. Absent for
    /// encrypted entries and when signature checking is disabled.
    verify: Option<(Crc32, u32)>,
}

impl InflatePipeline {
    pub fn new(
        compressed: bool,
        password: Option<&str>,
        expected_crc: Option<u32>,
    ) -> Self {
        Self {
            decryptor: password.map(AesDecryptor::new),
            inflater: compressed.then(Inflater::new),
            verify: expected_crc.map(|crc| (Crc32::new(), crc)),
        }
    }
}

impl Codec for InflatePipeline {
    fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        let decrypted;
        let mut data: &[u8] = match &mut self.decryptor {
            Some(decryptor) => {
                decrypted = decryptor.append(input)?;
                &decrypted
            }
            None => input,
        };

        let inflated;
        if let Some(inflater) = &mut self.inflater {
            inflated = inflater.append(data)?;
            data = &inflated;
        }

        if let Some((crc, _)) = &mut self.verify {
            crc.append(data);
        }
        Ok(data.to_vec())
    }

    fn flush(&mut self) -> ZipResult<CodecFlush> {
        let mut data = Vec::new();

        if let Some(decryptor) = &mut self.decryptor {
            let tail = decryptor.flush()?;
            if let Some(inflater) = &mut self.inflater {
                data.extend(inflater.append(&tail)?);
            } else {
                data.extend(tail);
            }
        }
        if let Some(inflater) = &mut self.inflater {
            data.extend(inflater.finish()?);
        }

        let signature = match &mut self.verify {
            Some((crc, expected)) => {
                crc.append(&data);
                let computed = crc.get();
                if computed != *expected {
                    return Err(ZipError::InvalidSignature);
                }
                Some(computed)
            }
            None => None,
        };

        Ok(CodecFlush { data, signature })
    }
}

/// Write-side pipeline: checksum, then deflate, then encrypt.
pub(crate) struct DeflatePipeline {
    crc: Option<Crc32>,
    deflater: Option<Deflater>,
    encryptor: Option<AesEncryptor>,
}

impl DeflatePipeline {
    /// `level` 0 selects STORE (no deflater stage).
    pub fn new(level: u32, password: Option<&str>) -> ZipResult<Self> {
        Ok(Self {
            crc: if password.is_none() {
                Some(Crc32::new())
            } else {
                None
            },
            deflater: (level > 0).then(|| Deflater::new(level)),
            encryptor: match password {
                Some(password) => Some(AesEncryptor::new(password)?),
                None => None,
            },
        })
    }
}

impl Codec for DeflatePipeline {
    fn append(&mut self, input: &[u8]) -> ZipResult<Vec<u8>> {
        if let Some(crc) = &mut self.crc {
            crc.append(input);
        }

        let deflated;
        let data: &[u8] = match &mut self.deflater {
            Some(deflater) => {
                deflated = deflater.append(input)?;
                &deflated
            }
            None => input,
        };

        Ok(match &mut self.encryptor {
            Some(encryptor) => encryptor.append(data),
            None => data.to_vec(),
        })
    }

    fn flush(&mut self) -> ZipResult<CodecFlush> {
        let mut data = Vec::new();

        if let Some(deflater) = &mut self.deflater {
            let tail = deflater.finish()?;
            match &mut self.encryptor {
                Some(encryptor) => data.extend(encryptor.append(&tail)),
                None => data.extend(tail),
            }
        }
        if let Some(encryptor) = &mut self.encryptor {
            data.extend(encryptor.flush());
        }

        Ok(CodecFlush {
            data,
            signature: self.crc.as_ref().map(Crc32::get),
        })
    }
}

/// Bounded pool for off-thread codec work.
///
/// Requests beyond capacity queue on the semaphore in FIFO order; with
/// workers disabled every call runs inline on the task.
pub(crate) struct WorkerPool {
    semaphore: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(config: &Config) -> Self {
        Self {
            semaphore: config
                .use_workers
                .then(|| Arc::new(Semaphore::new(config.effective_workers()))),
        }
    }

    async fn run<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match &self.semaphore {
            Some(semaphore) => {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("codec worker pool closed");
                tokio::task::spawn_blocking(f)
                    .await
                    .expect("codec worker panicked")
            }
            None => f(),
        }
    }
}

/// Outcome of streaming one entry through its codec.
pub(crate) struct DriverOutput {
    /// CRC-32 of the plaintext for unencrypted entries.
    pub signature: Option<u32>,
    /// Bytes appended to the sink.
    pub length: u64,
}

/// Pump `total` source bytes at `base_offset` through `codec` into `sink`.
///
/// Chunks are read, transformed and written strictly in input order; the
/// progress callback sees cumulative input bytes after each chunk's write
/// completes.
pub(crate) async fn run_codec<R, S>(
    codec: Box<dyn Codec>,
    pool: &WorkerPool,
    reader: &R,
    base_offset: u64,
    total: u64,
    sink: &mut S,
    chunk_size: usize,
    on_progress: Option<&ProgressFn>,
) -> ZipResult<DriverOutput>
where
    R: ReadAt + ?Sized,
    S: DataSink + ?Sized,
{
    let mut codec = codec;
    let mut done: u64 = 0;
    let mut written: u64 = 0;

    while done < total {
        let len = chunk_size.min((total - done) as usize);
        let mut chunk = vec![0u8; len];
        read_exact_at(reader, base_offset + done, &mut chunk).await?;

        let (returned, result) = pool
            .run(move || {
                let mut codec = codec;
                let out = codec.append(&chunk);
                (codec, out)
            })
            .await;
        codec = returned;
        let out = result?;

        written += out.len() as u64;
        sink.write_all(&out).await?;
        done += len as u64;
        if let Some(progress) = on_progress {
            progress(done, total);
        }
    }

    let (_, result) = pool
        .run(move || {
            let mut codec = codec;
            let out = codec.flush();
            (codec, out)
        })
        .await;
    let flushed = result?;

    written += flushed.data.len() as u64;
    sink.write_all(&flushed.data).await?;

    Ok(DriverOutput {
        signature: flushed.signature,
        length: written,
    })
}
