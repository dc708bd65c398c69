//! Error types emitted by the library.

use thiserror::Error;

/// Generic result type with [`ZipError`] as its error variant.
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for all archive operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZipError {
    /// The input does not look like a ZIP archive at all.
    #[error("bad archive format: {0}")]
    BadFormat(&'static str),

    /// No End of Central Directory signature within the trailing
    /// 22 + 65535 bytes.
    #[error("end of central directory record not found")]
    EndOfCentralDirectoryNotFound,

    /// The EOCDR escalated to Zip64 but no Zip64 EOCDR is present.
    #[error("zip64 end of central directory record not found")]
    EndOfCentralDirectoryZip64NotFound,

    /// The EOCDR escalated to Zip64 but no Zip64 locator is present.
    #[error("zip64 end of central directory locator not found")]
    EndOfCentralDirectoryLocatorZip64NotFound,

    /// A central directory entry does not start with `PK\x01\x02`.
    #[error("central directory header not found")]
    CentralDirectoryHeaderNotFound,

    /// An entry's local header does not start with `PK\x03\x04`.
    #[error("local file header not found")]
    LocalFileHeaderNotFound,

    /// A 32-bit field carries the 0xFFFFFFFF sentinel but the Zip64
    /// extra field does not provide the 64-bit value.
    #[error("zip64 extra field missing for sentinel value")]
    ExtraFieldZip64NotFound,

    /// Compression method outside {STORE, DEFLATE} (after AES decoding).
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// WinZip-AES strength other than 3 (AES-256).
    #[error("unsupported encryption strength {0}")]
    UnsupportedEncryption(u8),

    /// The entry is password-protected and no password was supplied.
    #[error("entry is encrypted and no password was provided")]
    Encrypted,

    /// The AES password verifier did not match the derived value.
    #[error("invalid password")]
    InvalidPassword,

    /// HMAC tag mismatch, or CRC-32 mismatch on a plain entry.
    #[error("invalid signature")]
    InvalidSignature,

    /// An entry with this name already exists in the writer.
    #[error("duplicated entry name: {0}")]
    DuplicatedName(String),

    /// The archive comment exceeds 65535 bytes.
    #[error("zip file comment too large")]
    ZipFileCommentTooLarge,

    /// An entry comment exceeds 65535 bytes.
    #[error("file entry comment too large")]
    FileEntryCommentTooLarge,

    /// Mutually exclusive configuration options were set together.
    #[error("conflicting configuration: {0}")]
    ConfigConflict(&'static str),

    /// Transport error propagated from a reader or sink.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error propagated from the HTTP range reader.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
