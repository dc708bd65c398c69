//! # streamzip
//!
//! A streaming ZIP archive library: enumerate and extract entries from
//! local, in-memory or remote (HTTP Range) archives, and build archives
//! onto any append-only sink.
//!
//! ## Features
//!
//! - STORED and DEFLATE compression
//! - Zip64 archives (more than 65535 entries, 64-bit sizes and offsets)
//! - WinZip-AES (AES-256) entry encryption with authenticated extraction
//! - Concurrent `add` calls serialized onto a single sink
//! - HTTP Range sources, fetching only the bytes an operation needs
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamzip::{AddOptions, ExtractOptions, MemoryReader, MemorySink, ZipReader, ZipWriter};
//!
//! #[tokio::main]
//! async fn main() -> streamzip::ZipResult<()> {
//!     // Build an archive in memory.
//!     let writer = ZipWriter::new(MemorySink::new())?;
//!     let body = MemoryReader::new(b"hello".to_vec());
//!     writer.add("hello.txt", Some(&body), AddOptions::default()).await?;
//!     let archive = writer.close().await?.into_bytes();
//!
//!     // Read it back.
//!     let reader = ZipReader::new(Arc::new(MemoryReader::new(archive)))?;
//!     for entry in reader.entries().await? {
//!         let data = reader.read(&entry, &ExtractOptions::default()).await?;
//!         println!("{}: {} bytes", entry.name, data.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod aes;
pub mod cli;
pub mod codec;
pub mod config;
pub mod cp437;
pub mod crc32;
pub mod error;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use codec::ProgressFn;
pub use config::{configure, default_config, Config};
pub use error::{ZipError, ZipResult};
pub use io::{
    DataSink, FileSink, HttpRangeReader, LocalFileReader, MemoryReader, MemorySink, ReadAt,
};
pub use zip::{
    AddOptions, CompressionMethod, DosDateTime, ExtractOptions, ZipEntry, ZipReader, ZipWriter,
};
