//! Archive writing: entry emission, central directory, Zip64 promotion,
//! and serialization of concurrent `add` calls onto an append-only sink.

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{run_codec, DeflatePipeline, ProgressFn, WorkerPool};
use crate::config::{default_config, Config, MAX_COMMENT_LENGTH};
use crate::error::{ZipError, ZipResult};
use crate::io::{DataSink, MemoryReader, MemorySink, ReadAt};

use super::structures::*;

const DEFAULT_LEVEL: u32 = 5;

/// Options for one [`ZipWriter::add`] call.
#[derive(Clone, Default)]
pub struct AddOptions {
    /// Add a directory entry; the name gains a trailing `/` and no data
    /// stream may be attached.
    pub directory: bool,
    /// Entry comment, at most 65535 bytes of UTF-8.
    pub comment: Option<String>,
    /// Modification timestamp; defaults to the DOS epoch.
    pub last_mod: Option<DosDateTime>,
    /// Enables WinZip-AES (AES-256) encryption for this entry.
    pub password: Option<String>,
    /// Deflate level 0-9; 0 selects STORE. Defaults to 5.
    pub level: Option<u32>,
    /// Force the Zip64 format for this entry.
    pub zip64: bool,
    /// Stage the whole entry in memory and only then take the sink lock,
    /// so a long entry does not stall concurrent adds.
    pub buffered_write: bool,
    /// Raw extra fields appended after the recognized ones.
    pub extra_field: IndexMap<u16, Vec<u8>>,
    /// Floor for the version-needed field.
    pub version: Option<u16>,
    pub on_progress: Option<ProgressFn>,
}

impl AddOptions {
    pub fn directory() -> Self {
        Self {
            directory: true,
            ..Self::default()
        }
    }

    pub fn password(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Self::default()
        }
    }

    pub fn level(level: u32) -> Self {
        Self {
            level: Some(level),
            ..Self::default()
        }
    }
}

/// Finished metadata for one written entry.
#[derive(Clone)]
struct EntryMeta {
    name_raw: Vec<u8>,
    comment_raw: Vec<u8>,
    directory: bool,
    encrypted: bool,
    zip64: bool,
    version_needed: u16,
    bit_flag: u16,
    /// Method stored in the headers; `Aes` when encrypted.
    outer_method: CompressionMethod,
    /// Real method of the plaintext, carried in the AES extra field.
    inner_method: CompressionMethod,
    last_mod: DosDateTime,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    extra_field: IndexMap<u16, Vec<u8>>,
}

/// A name reservation that has not produced its metadata yet.
enum Slot {
    Pending,
    Done(EntryMeta),
}

struct SinkState<S> {
    sink: Option<S>,
    offset: u64,
    initialized: bool,
}

impl<S: DataSink> SinkState<S> {
    fn sink(&mut self) -> ZipResult<&mut S> {
        self.sink
            .as_mut()
            .ok_or(ZipError::BadFormat("writer already closed"))
    }

    async fn ensure_init(&mut self) -> ZipResult<()> {
        if !self.initialized {
            let sink = self.sink()?;
            sink.init().await?;
            self.offset = sink.size();
            self.initialized = true;
        }
        Ok(())
    }
}

/// Streaming archive writer over an append-only [`DataSink`].
///
/// `add` may be called concurrently from multiple tasks; the sink lock
/// serializes the actual byte stream while codec work for buffered
/// entries proceeds in parallel. Entry data is always followed by a data
/// descriptor, so the sink is never revisited.
pub struct ZipWriter<S: DataSink> {
    config: Config,
    pool: WorkerPool,
    zip64: bool,
    entries: Mutex<IndexMap<String, Slot>>,
    sink: AsyncMutex<SinkState<S>>,
}

impl<S: DataSink> ZipWriter<S> {
    pub fn new(sink: S) -> ZipResult<Self> {
        Self::with_config(sink, default_config())
    }

    pub fn with_config(sink: S, config: Config) -> ZipResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: WorkerPool::new(&config),
            config,
            zip64: false,
            entries: Mutex::new(IndexMap::new()),
            sink: AsyncMutex::new(SinkState {
                sink: Some(sink),
                offset: 0,
                initialized: false,
            }),
        })
    }

    /// Force the Zip64 format for the archive regardless of its size.
    pub fn force_zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    /// Append one entry. `source` supplies the uncompressed data; `None`
    /// writes an empty entry and is required for directories.
    ///
    /// On failure the name reservation is released so the caller may
    /// retry, though bytes already on the sink make the archive corrupt.
    pub async fn add(
        &self,
        name: &str,
        source: Option<&dyn ReadAt>,
        options: AddOptions,
    ) -> ZipResult<()> {
        let name = if options.directory && !name.ends_with('/') {
            format!("{name}/")
        } else {
            name.to_string()
        };

        let comment_raw = options.comment.as_deref().unwrap_or("").as_bytes().to_vec();
        if comment_raw.len() > MAX_COMMENT_LENGTH {
            return Err(ZipError::FileEntryCommentTooLarge);
        }
        if options.directory && source.is_some() {
            return Err(ZipError::BadFormat("directory entries carry no data"));
        }

        // Reserve the name before any work; insertion order fixes the
        // central directory order.
        {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            if entries.contains_key(&name) {
                return Err(ZipError::DuplicatedName(name));
            }
            entries.insert(name.clone(), Slot::Pending);
        }

        match self
            .add_reserved(&name, comment_raw, source, &options)
            .await
        {
            Ok(meta) => {
                let mut entries = self.entries.lock().expect("entries lock poisoned");
                entries.insert(name, Slot::Done(meta));
                Ok(())
            }
            Err(e) => {
                let mut entries = self.entries.lock().expect("entries lock poisoned");
                entries.shift_remove(&name);
                Err(e)
            }
        }
    }

    async fn add_reserved(
        &self,
        name: &str,
        comment_raw: Vec<u8>,
        source: Option<&dyn ReadAt>,
        options: &AddOptions,
    ) -> ZipResult<EntryMeta> {
        let empty_source = MemoryReader::new(Vec::new());
        let source = source.unwrap_or(&empty_source);
        source.init().await?;
        let uncompressed_size = source.size();

        let level = if options.directory {
            0
        } else {
            options.level.unwrap_or(DEFAULT_LEVEL).min(9)
        };
        let encrypted = options.password.is_some() && !options.directory;
        let inner_method = if level == 0 {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflate
        };
        let outer_method = if encrypted {
            CompressionMethod::Aes
        } else {
            inner_method
        };

        let zip64 = options.zip64 || self.zip64 || uncompressed_size >= U32_SENTINEL as u64;

        let mut bit_flag = FLAG_DATA_DESCRIPTOR;
        if encrypted {
            bit_flag |= FLAG_ENCRYPTED;
        }
        if !name.is_ascii() || !comment_raw.is_ascii() {
            bit_flag |= FLAG_UTF8;
        }
        bit_flag |= deflate_level_hint(level, options.directory);

        let mut version_needed = options.version.unwrap_or(VERSION_DEFAULT).max(VERSION_DEFAULT);
        if zip64 {
            version_needed = version_needed.max(VERSION_ZIP64);
        }
        if encrypted {
            version_needed = version_needed.max(VERSION_AES);
        }

        let mut meta = EntryMeta {
            name_raw: name.as_bytes().to_vec(),
            comment_raw,
            directory: options.directory,
            encrypted,
            zip64,
            version_needed,
            bit_flag,
            outer_method,
            inner_method,
            last_mod: options.last_mod.unwrap_or_default(),
            crc32: 0,
            compressed_size: 0,
            uncompressed_size,
            local_header_offset: 0,
            extra_field: options.extra_field.clone(),
        };

        // Direct path when the sink is uncontended and buffering was not
        // requested; otherwise stage the entry in memory and take the
        // lock only for the final flush.
        if options.buffered_write {
            self.write_buffered(&mut meta, source, level, options).await?;
        } else {
            match self.sink.try_lock() {
                Ok(mut state) => {
                    self.write_direct(&mut state, &mut meta, source, level, options)
                        .await?;
                }
                Err(_) => self.write_buffered(&mut meta, source, level, options).await?,
            }
        }
        Ok(meta)
    }

    async fn write_direct(
        &self,
        state: &mut SinkState<S>,
        meta: &mut EntryMeta,
        source: &dyn ReadAt,
        level: u32,
        options: &AddOptions,
    ) -> ZipResult<()> {
        state.ensure_init().await?;
        meta.local_header_offset = state.offset;

        let local = build_local_header(meta);
        state.sink()?.write_all(&local).await?;

        let codec = DeflatePipeline::new(level, options.password.as_deref())?;
        let output = run_codec(
            Box::new(codec),
            &self.pool,
            source,
            0,
            meta.uncompressed_size,
            state.sink()?,
            self.config.effective_chunk_size(),
            options.on_progress.as_ref(),
        )
        .await?;

        meta.compressed_size = output.length;
        meta.crc32 = output.signature.unwrap_or(0);

        let descriptor = build_data_descriptor(meta);
        state.sink()?.write_all(&descriptor).await?;

        state.offset += local.len() as u64 + meta.compressed_size + descriptor.len() as u64;
        tracing::debug!(
            name = %String::from_utf8_lossy(&meta.name_raw),
            offset = meta.local_header_offset,
            compressed = meta.compressed_size,
            "entry written"
        );
        Ok(())
    }

    async fn write_buffered(
        &self,
        meta: &mut EntryMeta,
        source: &dyn ReadAt,
        level: u32,
        options: &AddOptions,
    ) -> ZipResult<()> {
        let mut buffer = MemorySink::new();
        let local = build_local_header(meta);
        buffer.write_all(&local).await?;

        let codec = DeflatePipeline::new(level, options.password.as_deref())?;
        let output = run_codec(
            Box::new(codec),
            &self.pool,
            source,
            0,
            meta.uncompressed_size,
            &mut buffer,
            self.config.effective_chunk_size(),
            options.on_progress.as_ref(),
        )
        .await?;

        meta.compressed_size = output.length;
        meta.crc32 = output.signature.unwrap_or(0);

        let descriptor = build_data_descriptor(meta);
        buffer.write_all(&descriptor).await?;

        // Offset assignment happens only now, under the sink lock.
        let mut state = self.sink.lock().await;
        state.ensure_init().await?;
        meta.local_header_offset = state.offset;
        let bytes = buffer.into_bytes();
        state.sink()?.write_all(&bytes).await?;
        state.offset += bytes.len() as u64;
        Ok(())
    }

    /// Emit the central directory and trailer records, then return the
    /// sink. The archive is complete only after `close` succeeds.
    pub async fn close(&self) -> ZipResult<S> {
        self.close_with_comment("").await
    }

    /// [`close`](Self::close) with a trailing archive comment.
    pub async fn close_with_comment(&self, comment: &str) -> ZipResult<S> {
        if comment.len() > MAX_COMMENT_LENGTH {
            return Err(ZipError::ZipFileCommentTooLarge);
        }

        let metas: Vec<EntryMeta> = {
            let entries = self.entries.lock().expect("entries lock poisoned");
            entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Done(meta) => Some(meta.clone()),
                    Slot::Pending => None,
                })
                .collect()
        };

        let mut state = self.sink.lock().await;
        state.ensure_init().await?;

        let cd_offset = state.offset;
        let mut directory = Vec::new();
        for meta in &metas {
            directory.extend(build_central_record(meta));
        }
        let cd_size = directory.len() as u64;

        let zip64 = self.zip64
            || metas.len() >= U16_SENTINEL as usize
            || cd_offset >= U32_SENTINEL as u64
            || cd_size >= U32_SENTINEL as u64;

        if zip64 {
            let eocd64 = Zip64Eocd {
                version_made_by: VERSION_ZIP64,
                version_needed: VERSION_ZIP64,
                disk_number: 0,
                disk_with_cd: 0,
                disk_entries: metas.len() as u64,
                total_entries: metas.len() as u64,
                cd_size,
                cd_offset,
            };
            directory.extend(eocd64.to_bytes());
            let locator = Zip64EocdLocator {
                disk_with_eocd64: 0,
                eocd64_offset: cd_offset + cd_size,
                total_disks: 1,
            };
            directory.extend(locator.to_bytes());
        }

        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: clamp_u16(metas.len(), zip64),
            total_entries: clamp_u16(metas.len(), zip64),
            cd_size: clamp_u32(cd_size, zip64),
            cd_offset: clamp_u32(cd_offset, zip64),
            comment_len: comment.len() as u16,
        };
        directory.extend(eocd.to_bytes(comment.as_bytes()));

        state.sink()?.write_all(&directory).await?;
        state.offset += directory.len() as u64;
        tracing::debug!(entries = metas.len(), zip64, "archive closed");

        state
            .sink
            .take()
            .ok_or(ZipError::BadFormat("writer already closed"))
    }
}

fn clamp_u16(count: usize, zip64: bool) -> u16 {
    if zip64 || count >= U16_SENTINEL as usize {
        U16_SENTINEL
    } else {
        count as u16
    }
}

fn clamp_u32(value: u64, zip64: bool) -> u32 {
    if zip64 || value >= U32_SENTINEL as u64 {
        U32_SENTINEL
    } else {
        value as u32
    }
}

/// Bits 1-2 of the general purpose flag hint at the deflate level.
fn deflate_level_hint(level: u32, directory: bool) -> u16 {
    if level == 0 || directory {
        0
    } else if level < 3 {
        0b110
    } else if level < 5 {
        0b100
    } else if level == 9 {
        0b010
    } else {
        0
    }
}

/// The recognized extra fields for an entry, local-header variant.
fn build_entry_extras(meta: &EntryMeta, zip64_payload: Option<&[u8]>) -> Vec<u8> {
    let mut fields: Vec<(u16, Vec<u8>)> = Vec::new();
    if let Some(payload) = zip64_payload {
        fields.push((EXTRA_TAG_ZIP64, payload.to_vec()));
    }
    if meta.encrypted {
        fields.push((EXTRA_TAG_AES, AesExtraField::ae2(meta.inner_method).to_bytes()));
    }
    for (tag, payload) in &meta.extra_field {
        fields.push((*tag, payload.clone()));
    }
    build_extra_fields(fields.iter().map(|(tag, p)| (*tag, p.as_slice())))
}

fn build_local_header(meta: &EntryMeta) -> Vec<u8> {
    // Sizes are unknown until the codec drains; the data descriptor and
    // the central directory carry the real values. Zip64 entries flag
    // that with sentinel size fields and a zero-filled extra payload.
    let zip64_payload = meta.zip64.then(|| vec![0u8; 16]);
    let extra = build_entry_extras(meta, zip64_payload.as_deref());

    let (csize, usize_) = if meta.zip64 {
        (U32_SENTINEL, U32_SENTINEL)
    } else {
        (0, 0)
    };

    let mut out = Vec::with_capacity(LFH_SIZE + meta.name_raw.len() + extra.len());
    out.extend_from_slice(LFH_SIGNATURE);
    out.write_u16::<LittleEndian>(meta.version_needed).unwrap();
    out.write_u16::<LittleEndian>(meta.bit_flag).unwrap();
    out.write_u16::<LittleEndian>(meta.outer_method.as_u16())
        .unwrap();
    out.write_u16::<LittleEndian>(meta.last_mod.time).unwrap();
    out.write_u16::<LittleEndian>(meta.last_mod.date).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // crc, in the descriptor
    out.write_u32::<LittleEndian>(csize).unwrap();
    out.write_u32::<LittleEndian>(usize_).unwrap();
    out.write_u16::<LittleEndian>(meta.name_raw.len() as u16)
        .unwrap();
    out.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
    out.extend_from_slice(&meta.name_raw);
    out.extend_from_slice(&extra);
    out
}

fn build_data_descriptor(meta: &EntryMeta) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(DATA_DESCRIPTOR_SIGNATURE);
    out.write_u32::<LittleEndian>(meta.crc32).unwrap();
    if meta.zip64 {
        out.write_u64::<LittleEndian>(meta.compressed_size).unwrap();
        out.write_u64::<LittleEndian>(meta.uncompressed_size)
            .unwrap();
    } else {
        out.write_u32::<LittleEndian>(meta.compressed_size as u32)
            .unwrap();
        out.write_u32::<LittleEndian>(meta.uncompressed_size as u32)
            .unwrap();
    }
    out
}

fn build_central_record(meta: &EntryMeta) -> Vec<u8> {
    // The offset can push an otherwise small entry into Zip64 in the
    // central directory only.
    let zip64 = meta.zip64 || meta.local_header_offset >= U32_SENTINEL as u64;

    let zip64_payload = zip64.then(|| {
        let mut payload = Vec::with_capacity(24);
        payload
            .write_u64::<LittleEndian>(meta.uncompressed_size)
            .unwrap();
        payload
            .write_u64::<LittleEndian>(meta.compressed_size)
            .unwrap();
        payload
            .write_u64::<LittleEndian>(meta.local_header_offset)
            .unwrap();
        payload
    });
    let extra = build_entry_extras(meta, zip64_payload.as_deref());

    let version_made_by = if zip64 {
        VERSION_ZIP64
    } else {
        VERSION_DEFAULT
    };
    let version_needed = if zip64 {
        meta.version_needed.max(VERSION_ZIP64)
    } else {
        meta.version_needed
    };
    let (csize, usize_, offset) = if zip64 {
        (U32_SENTINEL, U32_SENTINEL, U32_SENTINEL)
    } else {
        (
            meta.compressed_size as u32,
            meta.uncompressed_size as u32,
            meta.local_header_offset as u32,
        )
    };
    let external_attrs: u32 = if meta.directory { 0x10 } else { 0 };

    let mut out =
        Vec::with_capacity(CDFH_MIN_SIZE + meta.name_raw.len() + extra.len() + meta.comment_raw.len());
    out.extend_from_slice(CDFH_SIGNATURE);
    out.write_u16::<LittleEndian>(version_made_by).unwrap();
    out.write_u16::<LittleEndian>(version_needed).unwrap();
    out.write_u16::<LittleEndian>(meta.bit_flag).unwrap();
    out.write_u16::<LittleEndian>(meta.outer_method.as_u16())
        .unwrap();
    out.write_u16::<LittleEndian>(meta.last_mod.time).unwrap();
    out.write_u16::<LittleEndian>(meta.last_mod.date).unwrap();
    out.write_u32::<LittleEndian>(meta.crc32).unwrap();
    out.write_u32::<LittleEndian>(csize).unwrap();
    out.write_u32::<LittleEndian>(usize_).unwrap();
    out.write_u16::<LittleEndian>(meta.name_raw.len() as u16)
        .unwrap();
    out.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
    out.write_u16::<LittleEndian>(meta.comment_raw.len() as u16)
        .unwrap();
    out.write_u16::<LittleEndian>(0).unwrap(); // disk number start
    out.write_u16::<LittleEndian>(0).unwrap(); // internal attributes
    out.write_u32::<LittleEndian>(external_attrs).unwrap();
    out.write_u32::<LittleEndian>(offset).unwrap();
    out.extend_from_slice(&meta.name_raw);
    out.extend_from_slice(&extra);
    out.extend_from_slice(&meta.comment_raw);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_hint_bits() {
        assert_eq!(deflate_level_hint(0, false), 0);
        assert_eq!(deflate_level_hint(1, false), 0b110);
        assert_eq!(deflate_level_hint(4, false), 0b100);
        assert_eq!(deflate_level_hint(5, false), 0);
        assert_eq!(deflate_level_hint(9, false), 0b010);
        assert_eq!(deflate_level_hint(9, true), 0);
    }

    #[test]
    fn descriptor_widths() {
        let mut meta = EntryMeta {
            name_raw: b"a".to_vec(),
            comment_raw: Vec::new(),
            directory: false,
            encrypted: false,
            zip64: false,
            version_needed: VERSION_DEFAULT,
            bit_flag: FLAG_DATA_DESCRIPTOR,
            outer_method: CompressionMethod::Stored,
            inner_method: CompressionMethod::Stored,
            last_mod: DosDateTime::default(),
            crc32: 1,
            compressed_size: 2,
            uncompressed_size: 3,
            local_header_offset: 0,
            extra_field: IndexMap::new(),
        };
        assert_eq!(build_data_descriptor(&meta).len(), 16);
        meta.zip64 = true;
        assert_eq!(build_data_descriptor(&meta).len(), 24);
    }
}
