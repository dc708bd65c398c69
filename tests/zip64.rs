//! Zip64 promotion, parsing, and EOCDR discovery.

use std::sync::Arc;

use streamzip::zip::{U16_SENTINEL, U32_SENTINEL, VERSION_ZIP64};
use streamzip::{
    AddOptions, Config, ExtractOptions, MemoryReader, MemorySink, ZipReader, ZipWriter,
};

fn reader_for(archive: Vec<u8>) -> ZipReader<MemoryReader> {
    ZipReader::new(Arc::new(MemoryReader::new(archive))).unwrap()
}

/// Classic EOCDR fields read straight from the archive tail (the archives
/// in this file have no trailing comment).
fn tail_eocd(archive: &[u8]) -> (u16, u32) {
    let tail = &archive[archive.len() - 22..];
    assert_eq!(&tail[0..4], b"PK\x05\x06");
    let total_entries = u16::from_le_bytes([tail[10], tail[11]]);
    let cd_offset = u32::from_le_bytes([tail[16], tail[17], tail[18], tail[19]]);
    (total_entries, cd_offset)
}

#[tokio::test]
async fn entry_count_promotes_to_zip64() {
    // Inline codec: 70000 tiny entries would drown in worker handoffs.
    let config = Config {
        use_workers: false,
        ..Config::default()
    };
    let writer = ZipWriter::with_config(MemorySink::new(), config).unwrap();
    for i in 0..70_000u32 {
        writer
            .add(&format!("f{i:05}"), None, AddOptions::level(0))
            .await
            .unwrap();
    }
    let archive = writer.close().await.unwrap().into_bytes();

    let (total_entries, cd_offset) = tail_eocd(&archive);
    assert_eq!(total_entries, U16_SENTINEL);
    assert_eq!(cd_offset, U32_SENTINEL);

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 70_000);
    assert_eq!(entries[0].name, "f00000");
    assert_eq!(entries[41_999].name, "f41999");
    assert_eq!(entries[69_999].name, "f69999");
}

#[tokio::test]
async fn forced_zip64_single_entry() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap().force_zip64();
    let body = vec![0xA5u8; 4096];
    let source = MemoryReader::new(body.clone());
    writer
        .add("big.bin", Some(&source), AddOptions::level(0))
        .await
        .unwrap();
    let archive = writer.close().await.unwrap().into_bytes();

    let (total_entries, cd_offset) = tail_eocd(&archive);
    assert_eq!(total_entries, U16_SENTINEL);
    assert_eq!(cd_offset, U32_SENTINEL);

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert!(entry.version_needed >= VERSION_ZIP64);
    assert_eq!(entry.uncompressed_size, 4096);
    assert_eq!(entry.compressed_size, 4096);

    let data = reader.read(entry, &ExtractOptions::default()).await.unwrap();
    assert_eq!(data, body);
}

#[tokio::test]
async fn per_entry_zip64_option() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"payload".to_vec());
    let mut options = AddOptions::level(0);
    options.zip64 = true;
    writer.add("z", Some(&source), options).await.unwrap();
    let source = MemoryReader::new(b"plain".to_vec());
    writer.add("p", Some(&source), AddOptions::level(0)).await.unwrap();
    let archive = writer.close().await.unwrap().into_bytes();

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        reader
            .read(&entries[0], &ExtractOptions::default())
            .await
            .unwrap(),
        b"payload"
    );
    assert_eq!(
        reader
            .read(&entries[1], &ExtractOptions::default())
            .await
            .unwrap(),
        b"plain"
    );
}

#[tokio::test]
async fn eocd_found_behind_max_comment() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"x".to_vec());
    writer.add("a", Some(&source), AddOptions::level(0)).await.unwrap();
    let comment = "c".repeat(65535);
    let archive = writer
        .close_with_comment(&comment)
        .await
        .unwrap()
        .into_bytes();

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a");
}

#[tokio::test]
async fn eocd_found_with_short_comment() {
    for len in [1usize, 21, 22, 100] {
        let writer = ZipWriter::new(MemorySink::new()).unwrap();
        let source = MemoryReader::new(b"x".to_vec());
        writer.add("a", Some(&source), AddOptions::level(0)).await.unwrap();
        let archive = writer
            .close_with_comment(&"y".repeat(len))
            .await
            .unwrap()
            .into_bytes();

        let reader = reader_for(archive);
        assert_eq!(reader.entries().await.unwrap().len(), 1, "comment len {len}");
    }
}
