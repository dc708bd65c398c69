//! Low-level ZIP container parsing.
//!
//! ZIP files are read from the end:
//! 1. Find the End of Central Directory record at the file's tail
//! 2. If Zip64, follow the locator to the Zip64 EOCDR
//! 3. Walk the central directory to get metadata for all entries
//! 4. For extraction, read each entry's local file header and data
//!
//! This approach is efficient for HTTP Range sources, which only need to
//! fetch the archive tail to list contents.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::aes::STRENGTH_AES_256;
use crate::config::MAX_COMMENT_LENGTH;
use crate::error::{ZipError, ZipResult};
use crate::io::{read_exact_at, ReadAt};

use super::structures::*;

/// Low-level ZIP parser over any [`ReadAt`] source.
///
/// Typically used through [`ZipReader`](super::ZipReader) rather than
/// directly.
pub struct ZipParser<R: ReadAt> {
    reader: Arc<R>,
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Tries the no-comment position first, then scans backward through
    /// the trailing `22 + 65535` bytes for the signature.
    pub async fn find_eocd(&self) -> ZipResult<(EndOfCentralDirectory, u64)> {
        if self.size < EndOfCentralDirectory::SIZE as u64 {
            return Err(ZipError::BadFormat("input smaller than an EOCDR"));
        }

        // Fast path: archive without a trailing comment.
        let offset = self.size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        read_exact_at(&*self.reader, offset, &mut buf).await?;

        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset));
        }

        // The EOCDR sits earlier when the archive has a comment; search
        // backward from the end of the file.
        let search_size =
            (MAX_COMMENT_LENGTH as u64 + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;

        let mut buf = vec![0u8; search_size as usize];
        read_exact_at(&*self.reader, search_start, &mut buf).await?;

        for i in (0..buf.len().saturating_sub(EndOfCentralDirectory::SIZE - 1)).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // Candidate found; the comment length must account for
                // every remaining byte or this is payload coincidence.
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd =
                        EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                    tracing::debug!(offset = search_start + i as u64, "EOCDR found by scan");
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(ZipError::EndOfCentralDirectoryNotFound)
    }

    /// Read the Zip64 locator and EOCDR once the classic record escalates.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> ZipResult<Zip64Eocd> {
        if eocd_offset < Zip64EocdLocator::SIZE as u64 {
            return Err(ZipError::EndOfCentralDirectoryLocatorZip64NotFound);
        }
        let locator_offset = eocd_offset - Zip64EocdLocator::SIZE as u64;
        let mut locator_buf = vec![0u8; Zip64EocdLocator::SIZE];
        read_exact_at(&*self.reader, locator_offset, &mut locator_buf).await?;
        let locator = Zip64EocdLocator::from_bytes(&locator_buf)?;

        let mut eocd64_buf = vec![0u8; Zip64Eocd::MIN_SIZE];
        read_exact_at(&*self.reader, locator.eocd64_offset, &mut eocd64_buf).await?;
        Zip64Eocd::from_bytes(&eocd64_buf)
    }

    /// Walk the central directory and return all entries in order.
    pub async fn list_entries(&self) -> ZipResult<Vec<ZipEntry>> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        let (cd_offset, cd_size, total_entries) = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries)
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
            )
        };
        tracing::debug!(total_entries, cd_offset, "walking central directory");

        // One read fetches the whole directory; a single Range request
        // for HTTP sources.
        let mut cd_data = vec![0u8; cd_size as usize];
        read_exact_at(&*self.reader, cd_offset, &mut cd_data).await?;

        let mut entries = Vec::with_capacity(total_entries.min(1 << 20) as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..total_entries {
            entries.push(parse_cdfh(&mut cursor)?);
        }
        Ok(entries)
    }
}

/// Parse one Central Directory File Header at the cursor.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> ZipResult<ZipEntry> {
    let mut sig = [0u8; 4];
    cursor
        .read_exact(&mut sig)
        .map_err(|_| ZipError::CentralDirectoryHeaderNotFound)?;
    if sig != CDFH_SIGNATURE {
        return Err(ZipError::CentralDirectoryHeaderNotFound);
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let version_needed = cursor.read_u16::<LittleEndian>()?;
    let bit_flag = cursor.read_u16::<LittleEndian>()?;
    let mut compression_method = CompressionMethod::from_u16(cursor.read_u16::<LittleEndian>()?);
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_length = cursor.read_u16::<LittleEndian>()?;
    let comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut local_header_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut name_raw = vec![0u8; name_length as usize];
    cursor.read_exact(&mut name_raw)?;
    let mut extra_raw = vec![0u8; extra_length as usize];
    cursor.read_exact(&mut extra_raw)?;
    let mut comment_raw = vec![0u8; comment_length as usize];
    cursor.read_exact(&mut comment_raw)?;

    let utf8 = bit_flag & FLAG_UTF8 != 0;
    let name = decode_text(&name_raw, utf8)?;
    let comment = decode_text(&comment_raw, utf8)?;

    let extra_fields = parse_extra_fields(&extra_raw);

    if let Some(zip64) = extra_fields.get(&EXTRA_TAG_ZIP64) {
        apply_zip64_extra(
            zip64,
            &mut uncompressed_size,
            &mut compressed_size,
            &mut local_header_offset,
        )?;
    }
    if compressed_size == U32_SENTINEL as u64
        || uncompressed_size == U32_SENTINEL as u64
        || local_header_offset == U32_SENTINEL as u64
    {
        return Err(ZipError::ExtraFieldZip64NotFound);
    }

    let mut password_protected = false;
    if bit_flag & FLAG_ENCRYPTED != 0 {
        if let Some(aes) = extra_fields.get(&EXTRA_TAG_AES) {
            let aes = AesExtraField::parse(aes)?;
            if aes.strength != STRENGTH_AES_256 {
                return Err(ZipError::UnsupportedEncryption(aes.strength));
            }
            password_protected = true;
            compression_method = aes.method;
        }
    }

    // MS-DOS directory attribute, or the conventional trailing slash.
    let directory = external_attrs & 0x10 != 0 || name.ends_with('/');

    Ok(ZipEntry {
        name,
        comment,
        directory,
        compression_method,
        last_mod: DosDateTime::new(last_mod_date, last_mod_time),
        crc32,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        bit_flag,
        version_needed,
        password_protected,
        extra_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    async fn parser_for(data: Vec<u8>) -> ZipParser<MemoryReader> {
        ZipParser::new(Arc::new(MemoryReader::new(data)))
    }

    #[tokio::test]
    async fn tiny_input_is_bad_format() {
        let parser = parser_for(vec![0x50, 0x4B, 1, 2, 3, 4, 5, 6, 7, 8]).await;
        assert!(matches!(
            parser.find_eocd().await,
            Err(ZipError::BadFormat(_))
        ));
    }

    #[tokio::test]
    async fn garbage_tail_not_found() {
        let parser = parser_for(vec![0xAAu8; 100]).await;
        assert!(matches!(
            parser.find_eocd().await,
            Err(ZipError::EndOfCentralDirectoryNotFound)
        ));
    }

    #[tokio::test]
    async fn eocd_with_comment_is_found() {
        let comment = b"release build 2024-03-15";
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: 0,
            total_entries: 0,
            cd_size: 0,
            cd_offset: 0,
            comment_len: comment.len() as u16,
        };
        let mut data = vec![0u8; 64];
        data.extend(eocd.to_bytes(comment));

        let parser = parser_for(data).await;
        let (parsed, offset) = parser.find_eocd().await.unwrap();
        assert_eq!(parsed.comment_len as usize, comment.len());
        assert_eq!(offset, 64);
    }
}
