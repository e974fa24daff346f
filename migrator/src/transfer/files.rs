//! File helpers shared by the indexer and the transfer stage.
//!
//! - Async I/O only (tokio)
//! - Retry transient lock errors (antivirus, backup agents, a service still releasing handles)
//! - Timeout every copy, scaled by file size; copies land under a `.partial` name first
//! - Preserve permissions on Unix best-effort

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::{timeout, Duration};

/// Recursively collect all regular files under `root`, sorted by path.
pub async fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let started = Instant::now();
    debug!(
        "[PHASE: transfer] [STEP: files] collect_files_recursive entered (root={:?})",
        root
    );

    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    out.sort();

    debug!(
        "[PHASE: transfer] [STEP: files] collect_files_recursive exit (files={}, duration_ms={})",
        out.len(),
        started.elapsed().as_millis()
    );
    Ok(out)
}

/// Regular files directly under `dir`, sorted by path.
pub async fn list_files_shallow(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read_dir failed: {:?}", dir))?;
    while let Some(ent) = rd.next_entry().await? {
        if ent.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            out.push(ent.path());
        }
    }
    out.sort();
    Ok(out)
}

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("used by another process")
        || msg.contains("in use")
        || msg.contains("access is denied")
        || msg.contains("resource busy")
        || msg.contains("temporarily")
        || msg.contains("timed out")
}

/// 60s base plus 1s per MiB, capped at 10 minutes.
fn copy_timeout_for(len: u64) -> Duration {
    let mib = (len / (1024 * 1024)).min(10_000);
    Duration::from_secs(60_u64.saturating_add(mib).min(600))
}

/// Sibling that receives the bytes until the copy is complete.
fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dst.with_file_name(name)
}

/// Remove a leftover partial file. Missing is fine; anything else is logged and returned.
async fn discard_partial(tmp: &Path, label: &str) -> std::io::Result<()> {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(
                "[PHASE: transfer] [STEP: files] unable to remove partial copy (label={}, path={:?}, err={})",
                label, tmp, e
            );
            Err(e)
        }
    }
}

/// One attempt: stream `src` into `tmp` through async file handles and flush to disk.
/// Dropping the future closes both handles.
async fn copy_into(src: &Path, tmp: &Path) -> std::io::Result<u64> {
    let mut reader = tokio::fs::File::open(src).await?;
    let mut writer = tokio::fs::File::create(tmp).await?;
    let n = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await?;
    Ok(n)
}

/// Copy one file with retries + timeout.
///
/// Bytes land in `<dst>.partial` and are renamed into place only once complete, so `dst` either
/// does not exist or holds the whole file. Caller must create the parent directory.
pub async fn copy_file_with_retries(src: &Path, dst: &Path, label: &str) -> Result<u64> {
    let started = Instant::now();
    debug!(
        "[PHASE: transfer] [STEP: files] copy_file_with_retries entered (label={}, src={:?}, dst={:?})",
        label, src, dst
    );

    let timeout_dur = match tokio::fs::metadata(src).await {
        Ok(m) => copy_timeout_for(m.len()),
        Err(_) => copy_timeout_for(0),
    };
    let tmp = partial_path(dst);

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3_u32 {
        let backoff = Duration::from_millis(200_u64.saturating_mul(1_u64 << (attempt - 1)));

        // A handle dropped by a timed-out attempt can hold the partial file for one more write.
        if let Err(e) = discard_partial(&tmp, label).await {
            last_err = Some(anyhow::Error::new(e).context(format!("stale partial copy: {:?}", tmp)));
            tokio::time::sleep(backoff).await;
            continue;
        }

        let outcome = match timeout(timeout_dur, copy_into(src, &tmp)).await {
            Ok(Ok(n)) => tokio::fs::rename(&tmp, dst).await.map(|()| n),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "[PHASE: transfer] [STEP: files] copy timeout (label={}, attempt={}, timeout_ms={})",
                    label,
                    attempt,
                    timeout_dur.as_millis()
                );
                last_err = Some(anyhow::anyhow!(
                    "copy timed out after {}ms: {:?}",
                    timeout_dur.as_millis(),
                    src
                ));
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        match outcome {
            Ok(n) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(meta) = tokio::fs::metadata(src).await {
                        let mode = meta.permissions().mode();
                        let _ = tokio::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode)).await;
                    }
                }
                debug!(
                    "[PHASE: transfer] [STEP: files] copy_file_with_retries exit ok (label={}, bytes={}, attempt={}, duration_ms={})",
                    label,
                    n,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok(n);
            }
            Err(e) => {
                let err = anyhow::Error::new(e).context(format!("copy failed: {:?}", src));
                let transient = is_transient_fs_error(&err);
                warn!(
                    "[PHASE: transfer] [STEP: files] copy failed (label={}, attempt={}, transient={}, err={:#})",
                    label, attempt, transient, err
                );
                last_err = Some(err);
                if !transient {
                    break;
                }
            }
        }

        tokio::time::sleep(backoff).await;
    }

    let err = last_err.unwrap_or_else(|| anyhow::anyhow!("copy failed"));
    match discard_partial(&tmp, label).await {
        Ok(()) => Err(err),
        Err(e) => Err(err.context(format!("partial copy left at {:?}: {}", tmp, e))),
    }
}

/// Clear the read-only attribute so the engine can open the file for writing. Best-effort.
pub async fn clear_readonly(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("metadata failed: {:?}", path))?;
    let mut perms = meta.permissions();
    if !perms.readonly() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }

    tokio::fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("set_permissions failed: {:?}", path))?;
    debug!(
        "[PHASE: attach] [STEP: preflight] cleared read-only flag (path={:?})",
        path
    );
    Ok(())
}
