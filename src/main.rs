//! Command-line entry point: list and extract local or remote archives.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use streamzip::{
    Cli, ExtractOptions, FileSink, HttpRangeReader, LocalFileReader, MemorySink, ReadAt, ZipEntry,
    ZipReader,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.is_http_url() {
        let reader = HttpRangeReader::new(cli.file.clone()).await?;
        let transferred_before = reader.transferred_bytes();
        let reader = Arc::new(reader);

        process_zip(reader.clone(), &cli).await?;

        if !cli.is_quiet() {
            let transferred = reader.transferred_bytes() - transferred_before;
            eprintln!("\nTotal bytes transferred: {}", format_size(transferred));
        }
    } else {
        let reader = Arc::new(LocalFileReader::new(Path::new(&cli.file))?);
        process_zip(reader, &cli).await?;
    }

    Ok(())
}

/// Dispatch to list or extract mode based on CLI flags.
async fn process_zip<R: ReadAt + 'static>(reader: Arc<R>, cli: &Cli) -> Result<()> {
    let zip = ZipReader::new(reader)?;

    if cli.list || cli.verbose {
        return list_files(&zip, cli.verbose).await;
    }

    let entries = zip.entries().await?;

    // Skip directories, apply the include and exclude patterns.
    let files_to_extract: Vec<_> = entries
        .iter()
        .filter(|e| {
            if e.directory {
                return false;
            }

            if !cli.files.is_empty() {
                let matches = cli.files.iter().any(|f| {
                    if has_glob_chars(f) {
                        glob_match(f, &e.name)
                    } else {
                        let basename = Path::new(&e.name)
                            .file_name()
                            .map(|s| s.to_string_lossy())
                            .unwrap_or_default();
                        e.name == *f || basename == *f
                    }
                });
                if !matches {
                    return false;
                }
            }

            !cli
                .exclude
                .iter()
                .any(|x| e.name.contains(x) || glob_match(x, &e.name))
        })
        .collect();

    for entry in files_to_extract {
        extract_file(&zip, entry, cli).await?;
    }

    Ok(())
}

/// Print the archive contents, either names only or a detail table.
async fn list_files<R: ReadAt + 'static>(zip: &ZipReader<R>, verbose: bool) -> Result<()> {
    let entries = zip.entries().await?;

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        if verbose {
            let (year, month, day) = entry.last_mod.date_parts();
            let (hour, minute, _second) = entry.last_mod.time_parts();

            let ratio = if entry.uncompressed_size > 0 {
                format!(
                    "{:>4}%",
                    100 - (entry.compressed_size * 100 / entry.uncompressed_size).min(100)
                )
            } else {
                "  0%".to_string()
            };

            let marker = if entry.password_protected { "*" } else { " " };
            println!(
                "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02} {}{}",
                entry.uncompressed_size,
                entry.compressed_size,
                ratio,
                year,
                month,
                day,
                hour,
                minute,
                marker,
                entry.name
            );

            if !entry.directory {
                total_uncompressed += entry.uncompressed_size;
                total_compressed += entry.compressed_size;
                file_count += 1;
            }
        } else {
            println!("{}", entry.name);
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {:>27}  {} files",
            total_uncompressed, total_compressed, "", file_count
        );
    }

    Ok(())
}

/// Extract one entry to stdout or to disk per the CLI options.
async fn extract_file<R: ReadAt + 'static>(
    zip: &ZipReader<R>,
    entry: &ZipEntry,
    cli: &Cli,
) -> Result<()> {
    let mut options = ExtractOptions::default();
    options.password = cli.password.clone();

    if cli.pipe {
        use tokio::io::AsyncWriteExt;
        let mut sink = MemorySink::new();
        zip.extract(entry, &mut sink, &options).await?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(sink.get_data()).await?;
        return Ok(());
    }

    let file_name = if cli.junk_paths {
        Path::new(&entry.name)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.name.clone())
    } else {
        entry.name.clone()
    };
    let output_path = match &cli.extract_dir {
        Some(dir) => PathBuf::from(dir).join(&file_name),
        None => PathBuf::from(&file_name),
    };

    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.name);
            }
            return Ok(());
        }
        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.name);
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.name);
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut sink = FileSink::create(&output_path).await?;
    zip.extract(entry, &mut sink, &options).await?;

    Ok(())
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Minimal glob matching supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte count with a binary-unit suffix.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
