//! End-to-end archive round-trips through in-memory adapters.

use std::sync::Arc;

use streamzip::zip::{EXTRA_TAG_AES, FLAG_ENCRYPTED, LFH_SIZE};
use streamzip::{
    AddOptions, CompressionMethod, Config, ExtractOptions, MemoryReader, MemorySink, ZipError,
    ZipReader, ZipWriter,
};

async fn write_archive(entries: &[(&str, &[u8], AddOptions)]) -> Vec<u8> {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    for (name, data, options) in entries {
        let source = MemoryReader::new(data.to_vec());
        writer
            .add(name, Some(&source), options.clone())
            .await
            .unwrap();
    }
    writer.close().await.unwrap().into_bytes()
}

fn reader_for(archive: Vec<u8>) -> ZipReader<MemoryReader> {
    ZipReader::new(Arc::new(MemoryReader::new(archive))).unwrap()
}

#[tokio::test]
async fn store_roundtrip() {
    let archive = write_archive(&[("hello.txt", b"hello", AddOptions::level(0))]).await;
    let reader = reader_for(archive);

    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.name, "hello.txt");
    assert_eq!(entry.compression_method, CompressionMethod::Stored);
    assert_eq!(entry.crc32, 0x3610A686);
    assert_eq!(entry.uncompressed_size, 5);
    assert_eq!(entry.compressed_size, 5);

    let data = reader.read(entry, &ExtractOptions::default()).await.unwrap();
    assert_eq!(data, b"hello");
}

#[tokio::test]
async fn deflate_roundtrip() {
    let body = vec![0x41u8; 1024];
    let archive = write_archive(&[("a.bin", &body, AddOptions::level(5))]).await;
    let reader = reader_for(archive);

    let entries = reader.entries().await.unwrap();
    let entry = &entries[0];
    assert_eq!(entry.compression_method, CompressionMethod::Deflate);
    assert!(entry.compressed_size < 20, "got {}", entry.compressed_size);

    let data = reader.read(entry, &ExtractOptions::default()).await.unwrap();
    assert_eq!(data, body);
}

#[tokio::test]
async fn aes_roundtrip() {
    let archive = write_archive(&[(
        "secret.txt",
        b"top secret",
        AddOptions::password("hunter2"),
    )])
    .await;
    let reader = reader_for(archive);

    let entries = reader.entries().await.unwrap();
    let entry = &entries[0];
    assert!(entry.password_protected);
    assert_ne!(entry.bit_flag & FLAG_ENCRYPTED, 0);
    // The AES wrapper is already unwrapped to the inner method.
    assert_eq!(entry.compression_method, CompressionMethod::Deflate);
    let aes_extra = entry.extra_fields.get(&EXTRA_TAG_AES).unwrap();
    assert_eq!(aes_extra[4], 3); // strength: AES-256
    assert_eq!(entry.crc32, 0); // AE-2 zeroes the CRC

    let data = reader
        .read(entry, &ExtractOptions::password("hunter2"))
        .await
        .unwrap();
    assert_eq!(data, b"top secret");

    let wrong = reader
        .read(entry, &ExtractOptions::password("hunter3"))
        .await;
    assert!(matches!(wrong, Err(ZipError::InvalidPassword)));
}

#[tokio::test]
async fn aes_store_roundtrip() {
    let mut options = AddOptions::password("pw");
    options.level = Some(0);
    let body = vec![0x5Au8; 333];
    let archive = write_archive(&[("s.bin", &body, options)]).await;
    let reader = reader_for(archive);

    let entries = reader.entries().await.unwrap();
    assert_eq!(entries[0].compression_method, CompressionMethod::Stored);
    let data = reader
        .read(&entries[0], &ExtractOptions::password("pw"))
        .await
        .unwrap();
    assert_eq!(data, body);
}

#[tokio::test]
async fn missing_password_is_encrypted_error() {
    let archive = write_archive(&[("s.txt", b"x", AddOptions::password("pw"))]).await;
    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    let result = reader.read(&entries[0], &ExtractOptions::default()).await;
    assert!(matches!(result, Err(ZipError::Encrypted)));
}

#[tokio::test]
async fn tampered_stored_payload_fails_crc() {
    let body = b"tamper-me-please";
    let mut archive = write_archive(&[("x.bin", body, AddOptions::level(0))]).await;

    // Stored data is verbatim in the archive; flip one payload byte.
    let pos = archive
        .windows(body.len())
        .position(|w| w == body)
        .unwrap();
    archive[pos + 3] ^= 0x01;

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    let result = reader.read(&entries[0], &ExtractOptions::default()).await;
    assert!(matches!(result, Err(ZipError::InvalidSignature)));
}

#[tokio::test]
async fn signature_check_can_be_disabled() {
    let body = b"tamper-me-please";
    let mut archive = write_archive(&[("x.bin", body, AddOptions::level(0))]).await;
    let pos = archive
        .windows(body.len())
        .position(|w| w == body)
        .unwrap();
    archive[pos] ^= 0xFF;

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    let options = ExtractOptions {
        check_signature: Some(false),
        ..ExtractOptions::default()
    };
    let data = reader.read(&entries[0], &options).await.unwrap();
    assert_eq!(data.len(), body.len());
}

#[tokio::test]
async fn tampered_ciphertext_fails_hmac() {
    let body = vec![7u8; 256];
    let mut options = AddOptions::password("pw");
    options.level = Some(0);
    let mut archive = write_archive(&[("x", &body, options)]).await;

    let reader = reader_for(archive.clone());
    let entries = reader.entries().await.unwrap();
    let lho = entries[0].local_header_offset as usize;
    let name_len = u16::from_le_bytes([archive[lho + 26], archive[lho + 27]]) as usize;
    let extra_len = u16::from_le_bytes([archive[lho + 28], archive[lho + 29]]) as usize;
    let data_offset = lho + LFH_SIZE + name_len + extra_len;

    // Past the 18-byte preamble: ciphertext proper.
    archive[data_offset + 18 + 40] ^= 0x20;

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    let result = reader
        .read(&entries[0], &ExtractOptions::password("pw"))
        .await;
    assert!(matches!(result, Err(ZipError::InvalidSignature)));
}

#[tokio::test]
async fn duplicate_name_rejected_and_state_kept() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"one".to_vec());
    writer
        .add("a.txt", Some(&source), AddOptions::default())
        .await
        .unwrap();

    let source = MemoryReader::new(b"two".to_vec());
    let result = writer.add("a.txt", Some(&source), AddOptions::default()).await;
    assert!(matches!(result, Err(ZipError::DuplicatedName(_))));

    let archive = writer.close().await.unwrap().into_bytes();
    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    let data = reader
        .read(&entries[0], &ExtractOptions::default())
        .await
        .unwrap();
    assert_eq!(data, b"one");
}

#[tokio::test]
async fn directory_entry_naming() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer.add("d", None, AddOptions::directory()).await.unwrap();
    let archive = writer.close().await.unwrap().into_bytes();

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    let entry = &entries[0];
    assert_eq!(entry.name, "d/");
    assert!(entry.directory);
    assert_eq!(entry.uncompressed_size, 0);
    assert_eq!(entry.compressed_size, 0);
}

#[tokio::test]
async fn directory_with_source_rejected() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"data".to_vec());
    let result = writer.add("d", Some(&source), AddOptions::directory()).await;
    assert!(result.is_err());

    // The reservation is released, so the name can be retried.
    writer.add("d", None, AddOptions::directory()).await.unwrap();
}

#[tokio::test]
async fn empty_entry_without_source() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer.add("empty.txt", None, AddOptions::default()).await.unwrap();
    let archive = writer.close().await.unwrap().into_bytes();

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries[0].uncompressed_size, 0);
    let data = reader
        .read(&entries[0], &ExtractOptions::default())
        .await
        .unwrap();
    assert!(data.is_empty());
}

#[tokio::test]
async fn ten_random_bytes_is_bad_format() {
    let reader = reader_for(vec![0x37, 0x91, 0x02, 0xAA, 0x4F, 0x00, 0xFF, 0x13, 0x88, 0x21]);
    assert!(matches!(
        reader.entries().await,
        Err(ZipError::BadFormat(_))
    ));
}

#[tokio::test]
async fn archive_and_entry_comments_roundtrip() {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"x".to_vec());
    let mut options = AddOptions::default();
    options.comment = Some("entry note".to_string());
    writer.add("a", Some(&source), options).await.unwrap();
    let archive = writer
        .close_with_comment("archive note")
        .await
        .unwrap()
        .into_bytes();

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries[0].comment, "entry note");
}

#[tokio::test]
async fn oversized_comments_rejected() {
    let big = "x".repeat(65536);

    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    let source = MemoryReader::new(b"x".to_vec());
    let mut options = AddOptions::default();
    options.comment = Some(big.clone());
    let result = writer.add("a", Some(&source), options).await;
    assert!(matches!(result, Err(ZipError::FileEntryCommentTooLarge)));

    let result = writer.close_with_comment(&big).await;
    assert!(matches!(result, Err(ZipError::ZipFileCommentTooLarge)));
}

#[tokio::test]
async fn non_ascii_names_use_utf8_flag() {
    let archive = write_archive(&[("héllo-ünïcode.txt", b"x", AddOptions::default())]).await;
    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert!(entries[0].utf8_name());
    assert_eq!(entries[0].name, "héllo-ünïcode.txt");
}

#[tokio::test]
async fn custom_extra_fields_preserved() {
    let mut options = AddOptions::default();
    options.extra_field.insert(0x6055, b"vendor-data".to_vec());
    let archive = write_archive(&[("a", b"x", options)]).await;

    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(
        entries[0].extra_fields.get(&0x6055).map(Vec::as_slice),
        Some(&b"vendor-data"[..])
    );
}

#[tokio::test]
async fn progress_reports_cumulative_input() {
    let body = vec![1u8; 100_000];
    let progress: Arc<std::sync::Mutex<Vec<(u64, u64)>>> = Arc::default();

    let writer = ZipWriter::with_config(
        MemorySink::new(),
        Config {
            chunk_size: 16 * 1024,
            ..Config::default()
        },
    )
    .unwrap();
    let source = MemoryReader::new(body.clone());
    let seen = progress.clone();
    let mut options = AddOptions::level(0);
    options.on_progress = Some(Arc::new(move |done, total| {
        seen.lock().unwrap().push((done, total));
    }));
    writer.add("big", Some(&source), options).await.unwrap();
    writer.close().await.unwrap();

    let seen = progress.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(seen.last().unwrap(), &(100_000, 100_000));
}

#[tokio::test]
async fn concurrent_adds_serialize_on_one_sink() {
    let writer = Arc::new(ZipWriter::new(MemorySink::new()).unwrap());

    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let body: Vec<u8> = (0..5000u32)
                .flat_map(|j| (i.wrapping_mul(31).wrapping_add(j)).to_le_bytes())
                .collect();
            let source = MemoryReader::new(body);
            let mut options = AddOptions::default();
            options.buffered_write = i % 2 == 0;
            writer.add(&format!("file-{i:02}"), Some(&source), options).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let archive = writer.close().await.unwrap().into_bytes();
    let reader = reader_for(archive);
    let entries = reader.entries().await.unwrap();
    assert_eq!(entries.len(), 16);

    for entry in &entries {
        let i: u32 = entry.name["file-".len()..].parse().unwrap();
        let expected: Vec<u8> = (0..5000u32)
            .flat_map(|j| (i.wrapping_mul(31).wrapping_add(j)).to_le_bytes())
            .collect();
        let data = reader.read(entry, &ExtractOptions::default()).await.unwrap();
        assert_eq!(data, expected, "entry {}", entry.name);
    }
}

#[tokio::test]
async fn inline_codec_config_works() {
    let config = Config {
        use_workers: false,
        max_workers: None,
        ..Config::default()
    };
    let writer = ZipWriter::with_config(MemorySink::new(), config.clone()).unwrap();
    let source = MemoryReader::new(b"inline".to_vec());
    writer.add("a", Some(&source), AddOptions::default()).await.unwrap();
    let archive = writer.close().await.unwrap().into_bytes();

    let reader = ZipReader::with_config(Arc::new(MemoryReader::new(archive)), config).unwrap();
    let entries = reader.entries().await.unwrap();
    let data = reader.read(&entries[0], &ExtractOptions::default()).await.unwrap();
    assert_eq!(data, b"inline");
}

#[tokio::test]
async fn conflicting_config_rejected() {
    let config = Config {
        use_workers: false,
        max_workers: Some(8),
        ..Config::default()
    };
    assert!(matches!(
        ZipWriter::with_config(MemorySink::new(), config),
        Err(ZipError::ConfigConflict(_))
    ));
}
