// Attach engine
//
// Attaches one logical database from a resolved primary file and optional log file:
// live/session short-circuit → preflight → two-file attach → rebuild-log fallback on the
// recoverable engine errors. A failure here never aborts sibling attaches.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::indexer::FileIndex;
use super::resolver::{resolve, resolve_log};
use crate::database::engine::SqlEngine;
use crate::error::MigrationError;
use crate::models::{AttachOutcome, AttachStatus, LogicalDatabase};
use crate::transfer::files::clear_readonly;
use crate::utils::LogSink;

const ERROR_LOG_MARKERS: [&str; 4] = ["5120", "5105", "access is denied", "operating system error"];
const ERROR_LOG_MAX_LINES: usize = 20;

pub struct AttachEngine {
    /// Lowercased names attached (or found live) during this session.
    attached: HashSet<String>,
    inspect_error_log_on_failure: bool,
}

impl AttachEngine {
    pub fn new(inspect_error_log_on_failure: bool) -> Self {
        Self {
            attached: HashSet::new(),
            inspect_error_log_on_failure,
        }
    }

    pub fn was_attached(&self, name: &str) -> bool {
        self.attached.contains(&name.to_lowercase())
    }

    fn mark_attached(&mut self, name: &str) {
        self.attached.insert(name.to_lowercase());
    }

    /// First of the database's names that is live in the instance.
    pub async fn live_name(&mut self, engine: &mut dyn SqlEngine, db: &LogicalDatabase) -> Option<String> {
        for name in db.all_names() {
            if self.was_attached(name) {
                return Some(name.to_string());
            }
            match engine.database_exists(name).await {
                Ok(true) => {
                    self.mark_attached(name);
                    return Some(name.to_string());
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "[PHASE: attach] [STEP: exists] existence check failed (db={}): {}",
                    name, e
                ),
            }
        }
        None
    }

    /// Live check under every name, then resolve against `index` and attach under the
    /// canonical name. `Err(NotFound)` when no primary file matches.
    pub async fn attach_logical(
        &mut self,
        engine: &mut dyn SqlEngine,
        sink: &dyn LogSink,
        db: &LogicalDatabase,
        index: &FileIndex,
    ) -> Result<AttachOutcome, MigrationError> {
        if let Some(live) = self.live_name(engine, db).await {
            sink.info(&format!("{} already attached (as {})", db.canonical_name, live));
            let primary = resolve(db, index.primaries()).ok().map(|f| f.path.clone());
            return Ok(AttachOutcome::already_attached(&db.canonical_name, primary));
        }

        let primary = resolve(db, index.primaries())?;
        let log = resolve_log(primary, index);
        Ok(self
            .attach(engine, sink, &db.canonical_name, &primary.path, log.as_deref())
            .await)
    }

    pub async fn attach(
        &mut self,
        engine: &mut dyn SqlEngine,
        sink: &dyn LogSink,
        logical_name: &str,
        primary: &Path,
        log: Option<&Path>,
    ) -> AttachOutcome {
        let started = Instant::now();
        debug!(
            "[PHASE: attach] [STEP: attach] entered (db={}, primary={:?}, log={:?})",
            logical_name, primary, log
        );

        let outcome = self.attach_inner(engine, sink, logical_name, primary, log).await;

        match &outcome.status {
            AttachStatus::Failed(detail) => {
                sink.error(&format!("{}: {}", logical_name, detail));
                if self.inspect_error_log_on_failure {
                    inspect_error_log(engine, sink).await;
                }
            }
            AttachStatus::Skipped(reason) => sink.warn(&format!("{} skipped: {}", logical_name, reason)),
            status => sink.info(&format!("{} {}", logical_name, status.label())),
        }
        info!(
            "[PHASE: attach] [STEP: attach] exit (db={}, status={}, duration_ms={})",
            logical_name,
            outcome.status.label(),
            started.elapsed().as_millis()
        );
        outcome
    }

    async fn attach_inner(
        &mut self,
        engine: &mut dyn SqlEngine,
        sink: &dyn LogSink,
        logical_name: &str,
        primary: &Path,
        log: Option<&Path>,
    ) -> AttachOutcome {
        if self.was_attached(logical_name) {
            return AttachOutcome::already_attached(logical_name, Some(primary.to_path_buf()));
        }
        match engine.database_exists(logical_name).await {
            Ok(true) => {
                self.mark_attached(logical_name);
                return AttachOutcome::already_attached(logical_name, Some(primary.to_path_buf()));
            }
            Ok(false) => {}
            Err(e) => warn!(
                "[PHASE: attach] [STEP: exists] existence check failed (db={}): {}",
                logical_name, e
            ),
        }

        if let Err(e) = preflight(engine, logical_name, primary).await {
            return AttachOutcome::new(
                logical_name,
                primary.to_path_buf(),
                log.map(Path::to_path_buf),
                AttachStatus::Skipped(format!("preflight failed: {}", e)),
            );
        }

        let log: Option<PathBuf> = match log {
            Some(l) => match preflight(engine, logical_name, l).await {
                Ok(()) => Some(l.to_path_buf()),
                Err(e) => {
                    sink.warn(&format!(
                        "{}: log file unusable, rebuilding the log instead ({})",
                        logical_name, e
                    ));
                    None
                }
            },
            None => None,
        };

        if let Some(log_path) = &log {
            match engine.attach_two_file(logical_name, primary, log_path).await {
                Ok(()) => {
                    self.mark_attached(logical_name);
                    return AttachOutcome::new(
                        logical_name,
                        primary.to_path_buf(),
                        log.clone(),
                        AttachStatus::AttachedTwoFile,
                    );
                }
                Err(e) if e.is_recoverable_attach_error() => {
                    warn!(
                        "[PHASE: attach] [STEP: attach] two-file attach refused (db={}, code={:?}); retrying with a rebuilt log",
                        logical_name,
                        e.code()
                    );
                }
                Err(e) => {
                    let err = MigrationError::AttachFailed {
                        logical_name: logical_name.to_string(),
                        source: e,
                    };
                    return AttachOutcome::new(
                        logical_name,
                        primary.to_path_buf(),
                        log.clone(),
                        AttachStatus::Failed(err.to_string()),
                    );
                }
            }
        }

        match engine.attach_rebuild_log(logical_name, primary).await {
            Ok(()) => {
                self.mark_attached(logical_name);
                AttachOutcome::new(
                    logical_name,
                    primary.to_path_buf(),
                    None,
                    AttachStatus::AttachedRebuildLog,
                )
            }
            Err(e) => {
                let err = MigrationError::AttachFailed {
                    logical_name: logical_name.to_string(),
                    source: e,
                };
                AttachOutcome::new(
                    logical_name,
                    primary.to_path_buf(),
                    log,
                    AttachStatus::Failed(err.to_string()),
                )
            }
        }
    }
}

/// Local checks when the file's directory is visible here, then the engine's own view.
/// A probe that errors (rather than answering "absent") does not block the attach.
async fn preflight(engine: &mut dyn SqlEngine, logical_name: &str, path: &Path) -> Result<(), MigrationError> {
    let locally_visible = path.parent().is_some_and(Path::is_dir);
    if locally_visible {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(MigrationError::PreflightFailed {
                logical_name: logical_name.to_string(),
                detail: format!("file not found: {}", path.display()),
            });
        }
        if let Err(e) = clear_readonly(path).await {
            warn!(
                "[PHASE: attach] [STEP: preflight] could not clear read-only flag (path={:?}): {:#}",
                path, e
            );
        }
    }

    match engine.engine_sees_file(path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(MigrationError::PreflightFailed {
            logical_name: logical_name.to_string(),
            detail: format!("engine cannot see {}", path.display()),
        }),
        Err(e) => {
            warn!(
                "[PHASE: attach] [STEP: preflight] file probe failed, continuing (path={:?}): {}",
                path, e
            );
            Ok(())
        }
    }
}

/// Echo the engine error-log lines that usually explain a failed attach.
async fn inspect_error_log(engine: &mut dyn SqlEngine, sink: &dyn LogSink) {
    match engine.recent_error_log().await {
        Ok(lines) => {
            let relevant: Vec<String> = lines
                .into_iter()
                .filter(|l| {
                    let lower = l.to_lowercase();
                    ERROR_LOG_MARKERS.iter().any(|m| lower.contains(m))
                })
                .take(ERROR_LOG_MAX_LINES)
                .collect();
            if relevant.is_empty() {
                sink.info("Error log: no relevant entries");
            }
            for line in relevant {
                sink.warn(&format!("Error log: {}", line));
            }
        }
        Err(e) => warn!(
            "[PHASE: attach] [STEP: errorlog] could not read the engine error log: {}",
            e
        ),
    }
}
