//! Archive mode: zip the whole source tree and mirror the companies folder layout.
//!
//! Compression is blocking work and runs on `spawn_blocking`; progress flows back over a
//! channel so the sink never leaves the async side. The archive is written under a temporary
//! name and renamed once complete, so a partial `DATA_*.zip` is never left behind. A source file
//! that cannot be read is counted and skipped; only failures writing the archive abort it.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use zip::write::FileOptions;

use super::files::collect_files_recursive;
use super::{percent_of, TransferSummary};
use crate::utils::LogSink;

const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

/// Local timestamp used in archive and mirror names.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn archive_file_name(stamp: &str) -> String {
    format!("DATA_{}.zip", stamp)
}

pub fn mirror_dir_name(stamp: &str) -> String {
    format!("Empresas_{}", stamp)
}

/// Entry name inside the archive: path relative to `root`, `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Compress every file under `source` into `dest/DATA_<stamp>.zip`.
pub async fn archive_source_tree(
    source: &Path,
    dest: &Path,
    stamp: &str,
    sink: &dyn LogSink,
) -> Result<TransferSummary> {
    let started = Instant::now();
    debug!(
        "[PHASE: transfer] [STEP: archive] entered (source={:?}, dest={:?})",
        source, dest
    );

    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("Failed to create destination {:?}", dest))?;
    let files = collect_files_recursive(source)
        .await
        .with_context(|| format!("Failed to scan source {:?}", source))?;
    let mut sized = Vec::with_capacity(files.len());
    for path in files {
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        sized.push((path, len));
    }
    let total: u64 = sized.iter().map(|(_, len)| *len).sum();

    let final_path = dest.join(archive_file_name(stamp));
    let tmp_path = dest.join(format!("{}.partial", archive_file_name(stamp)));
    sink.info(&format!(
        "Archiving {} files from {} into {}",
        sized.len(),
        source.display(),
        final_path.display()
    ));

    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
    let root = source.to_path_buf();
    let out = tmp_path.clone();
    let handle = tokio::task::spawn_blocking(move || zip_files(&root, &sized, total, &out, tx));

    let mut last = None;
    while let Some(pct) = rx.recv().await {
        if last != Some(pct) {
            last = Some(pct);
            sink.progress(pct);
        }
    }

    let counts = match handle.await.context("archive task panicked")? {
        Ok(counts) => counts,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .with_context(|| format!("Failed to finalize archive {:?}", final_path))?;
    if last != Some(100) {
        sink.progress(100);
    }

    if counts.failed > 0 {
        sink.warn(&format!(
            "{} files could not be read completely and are missing or incomplete in the archive",
            counts.failed
        ));
    }
    info!(
        "[PHASE: transfer] [STEP: archive] exit (files={}, failed={}, bytes={}, archive={:?}, duration_ms={})",
        counts.zipped,
        counts.failed,
        total,
        final_path,
        started.elapsed().as_millis()
    );
    Ok(TransferSummary {
        copied: counts.zipped,
        skipped: 0,
        errors: counts.failed,
        bytes_total: total,
        bytes_done: total,
        archive_path: Some(final_path.to_string_lossy().into_owned()),
        failure: None,
    })
}

/// Files zipped and files that could not be read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ZipCounts {
    zipped: u32,
    failed: u32,
}

/// Stream one source file into the open entry. Read errors come back as `Ok(Err(..))` so the
/// caller can keep going; write errors mean the archive itself is broken.
fn copy_entry<W: Write>(reader: &mut impl Read, zip: &mut W) -> Result<std::io::Result<()>> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(Ok(())),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok(Err(e)),
        };
        zip.write_all(&buf[..n]).context("Failed to write archive")?;
    }
}

fn zip_files(
    root: &Path,
    files: &[(PathBuf, u64)],
    total: u64,
    out: &Path,
    progress: mpsc::UnboundedSender<u8>,
) -> Result<ZipCounts> {
    let file = File::create(out).with_context(|| format!("Failed to create archive {:?}", out))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let mut done: u64 = 0;
    let mut counts = ZipCounts::default();

    for (path, len) in files {
        let Some(name) = entry_name(root, path) else {
            continue;
        };
        done = done.saturating_add(*len);

        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) => {
                warn!(
                    "[PHASE: transfer] [STEP: archive] skipping unreadable file {:?}: {}",
                    path, e
                );
                counts.failed += 1;
                let _ = progress.send(percent_of(done, total));
                continue;
            }
        };

        let opts = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(*len >= LARGE_FILE_THRESHOLD);
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("Failed to start archive entry {}", name))?;
        match copy_entry(&mut reader, &mut zip)? {
            Ok(()) => counts.zipped += 1,
            Err(e) => {
                // The entry stays in the archive with whatever was read before the failure.
                warn!(
                    "[PHASE: transfer] [STEP: archive] read failed mid-entry, {} is incomplete: {}",
                    name, e
                );
                counts.failed += 1;
            }
        }
        let _ = progress.send(percent_of(done, total));
    }

    zip.finish().context("Failed to finish archive")?;
    Ok(counts)
}

/// Recreate the folder layout of `companies` under `target`. Directories only, no files.
///
/// Returns the number of directories created below `target`.
pub async fn mirror_directory_structure(companies: &Path, target: &Path) -> Result<usize> {
    let started = Instant::now();
    tokio::fs::create_dir_all(target)
        .await
        .with_context(|| format!("Failed to create {:?}", target))?;

    let mut created = 0usize;
    let mut stack = vec![companies.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(
                    "[PHASE: transfer] [STEP: mirror] unable to read {:?}: {:?}",
                    dir, e
                );
                continue;
            }
        };
        while let Some(ent) = rd.next_entry().await? {
            if !ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = ent.path();
            if let Ok(rel) = path.strip_prefix(companies) {
                tokio::fs::create_dir_all(target.join(rel))
                    .await
                    .with_context(|| format!("Failed to mirror {:?}", rel))?;
                created += 1;
            }
            stack.push(path);
        }
    }

    info!(
        "[PHASE: transfer] [STEP: mirror] exit (dirs={}, target={:?}, duration_ms={})",
        created,
        target,
        started.elapsed().as_millis()
    );
    Ok(created)
}
