// Data transfer stage
//
// Runs while the engine service is stopped so no data file is held open. Copy mode never
// overwrites a destination file; archive mode never touches the source.

pub mod archive;
pub mod files;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::attach::indexer::FileRole;
use crate::settings::TransferMode;
use crate::utils::LogSink;
use files::{collect_files_recursive, copy_file_with_retries};

/// System database files that must never be carried over to another instance.
pub const SYSTEM_FILE_BLOCKLIST: [&str; 8] = [
    "master.mdf",
    "mastlog.ldf",
    "model.mdf",
    "modellog.ldf",
    "msdbdata.mdf",
    "msdblog.ldf",
    "tempdb.mdf",
    "templog.ldf",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub copied: u32,
    pub skipped: u32,
    pub errors: u32,
    pub bytes_total: u64,
    pub bytes_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    /// Set when the stage stopped early; the counts cover what happened before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Tracks bytes processed and only reports a percentage when it changes.
pub(crate) struct ProgressMeter<'a> {
    sink: &'a dyn LogSink,
    total: u64,
    done: u64,
    last: Option<u8>,
}

impl<'a> ProgressMeter<'a> {
    pub(crate) fn new(sink: &'a dyn LogSink, total: u64) -> Self {
        Self {
            sink,
            total,
            done: 0,
            last: None,
        }
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes).min(self.total);
        self.report(percent_of(self.done, self.total));
    }

    pub(crate) fn finish(&mut self) {
        self.done = self.total;
        self.report(100);
    }

    fn report(&mut self, pct: u8) {
        if self.last != Some(pct) {
            self.last = Some(pct);
            self.sink.progress(pct);
        }
    }
}

/// `done / total` as 0..=100. An empty workload counts as complete.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

fn is_blocklisted(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .is_some_and(|n| SYSTEM_FILE_BLOCKLIST.contains(&n.as_str()))
}

/// Data files under `source` eligible for transfer, with their sizes.
async fn eligible_data_files(source: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut out = Vec::new();
    for path in collect_files_recursive(source).await? {
        if FileRole::from_path(&path).is_none() || is_blocklisted(&path) {
            continue;
        }
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        out.push((path, len));
    }
    Ok(out)
}

/// Copy every primary, log and secondary file found under `source` into `dest` by file name.
///
/// Existing destination files are skipped and counted; failed copies are counted and logged,
/// never fatal.
pub async fn copy_data_files(source: &Path, dest: &Path, sink: &dyn LogSink) -> Result<TransferSummary> {
    let started = Instant::now();
    debug!(
        "[PHASE: transfer] [STEP: copy] entered (source={:?}, dest={:?})",
        source, dest
    );

    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("Failed to create destination {:?}", dest))?;
    let candidates = eligible_data_files(source)
        .await
        .with_context(|| format!("Failed to scan source {:?}", source))?;

    let mut summary = TransferSummary {
        bytes_total: candidates.iter().map(|(_, len)| *len).sum(),
        ..TransferSummary::default()
    };
    let mut meter = ProgressMeter::new(sink, summary.bytes_total);
    sink.info(&format!("Copying {} data files to {}", candidates.len(), dest.display()));

    for (src, len) in &candidates {
        let Some(file_name) = src.file_name() else {
            continue;
        };
        let dst = dest.join(file_name);
        let name = file_name.to_string_lossy();

        if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
            debug!("[PHASE: transfer] [STEP: copy] skip existing {:?}", dst);
            summary.skipped += 1;
        } else {
            match copy_file_with_retries(src, &dst, &name).await {
                Ok(_) => summary.copied += 1,
                Err(e) => {
                    warn!("[PHASE: transfer] [STEP: copy] {} failed: {:#}", name, e);
                    sink.warn(&format!("Copy failed for {}: {}", name, e));
                    summary.errors += 1;
                }
            }
        }
        meter.advance(*len);
    }
    meter.finish();
    summary.bytes_done = summary.bytes_total;

    info!(
        "[PHASE: transfer] [STEP: copy] exit (copied={}, skipped={}, errors={}, bytes={}, duration_ms={})",
        summary.copied,
        summary.skipped,
        summary.errors,
        summary.bytes_total,
        started.elapsed().as_millis()
    );
    sink.info(&format!(
        "Copy finished: {} copied, {} already present, {} errors",
        summary.copied, summary.skipped, summary.errors
    ));
    Ok(summary)
}

/// Run the configured transfer mode. `None` means nothing was requested.
pub async fn run_transfer(
    mode: TransferMode,
    source: Option<&Path>,
    dest: &Path,
    companies: Option<&Path>,
    sink: &dyn LogSink,
) -> Result<Option<TransferSummary>> {
    let source = match (mode, source) {
        (TransferMode::None, _) => return Ok(None),
        (_, Some(source)) => source,
        (_, None) => anyhow::bail!("Transfer mode {:?} needs a source directory", mode),
    };

    let summary = match mode {
        TransferMode::Copy => copy_data_files(source, dest, sink).await?,
        TransferMode::Archive => {
            let stamp = archive::timestamp();
            let mut summary = archive::archive_source_tree(source, dest, &stamp, sink).await?;
            match companies {
                Some(companies) => {
                    let target = dest.join(archive::mirror_dir_name(&stamp));
                    let dirs = archive::mirror_directory_structure(companies, &target).await?;
                    sink.info(&format!("Mirrored {} company folders into {}", dirs, target.display()));
                }
                None => {
                    warn!("[PHASE: transfer] [STEP: mirror] no companies directory configured");
                    sink.warn("No companies directory configured; folder structure not mirrored");
                }
            }
            summary.bytes_done = summary.bytes_total;
            summary
        }
        TransferMode::None => return Ok(None),
    };
    Ok(Some(summary))
}
