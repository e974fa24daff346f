// Post-attach maintenance: normalization, physical integrity check and verification.
//
// Every step is per database. A failure is logged and recorded against that database only;
// nothing here aborts the session.

use log::{debug, info, warn};
use std::time::Instant;

use crate::database::engine::{DatabaseState, SqlEngine};
use crate::database::statements::{
    checkdb_physical_only_stmt, compat_level_for_major, normalization_batch, parse_major_version,
};
use crate::models::{DatabaseIssue, MaintenanceReport};
use crate::utils::LogSink;

/// Level used when the server version cannot be read; every supported engine accepts it.
const FALLBACK_COMPAT_LEVEL: u16 = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceOptions {
    pub integrity_check: bool,
    pub verify: bool,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            integrity_check: true,
            verify: true,
        }
    }
}

fn issue(database: &str, detail: impl Into<String>) -> DatabaseIssue {
    DatabaseIssue {
        database: database.to_string(),
        detail: detail.into(),
    }
}

/// Compatibility level this server should run attached databases at.
pub async fn target_compat_level(engine: &mut dyn SqlEngine) -> u16 {
    match engine.product_version().await {
        Ok(version) => match parse_major_version(&version) {
            Some(major) => compat_level_for_major(major),
            None => {
                warn!(
                    "[PHASE: maintenance] [STEP: version] unparseable ProductVersion {:?}; using {}",
                    version, FALLBACK_COMPAT_LEVEL
                );
                FALLBACK_COMPAT_LEVEL
            }
        },
        Err(e) => {
            warn!(
                "[PHASE: maintenance] [STEP: version] query failed ({}); using {}",
                e, FALLBACK_COMPAT_LEVEL
            );
            FALLBACK_COMPAT_LEVEL
        }
    }
}

/// Deviations of one database from the normalized target. Empty when healthy.
pub fn deviations(state: &DatabaseState, target_level: u16) -> Vec<String> {
    let mut out = Vec::new();
    if !state.state_desc.eq_ignore_ascii_case("ONLINE") {
        out.push(format!("state is {}", state.state_desc));
    }
    if state.compatibility_level != target_level {
        out.push(format!(
            "compatibility level {} (expected {})",
            state.compatibility_level, target_level
        ));
    }
    match state.owner.as_deref() {
        Some(owner) if owner.eq_ignore_ascii_case("sa") => {}
        Some(owner) => out.push(format!("owner is {}", owner)),
        None => out.push("owner is unknown".to_string()),
    }
    if !state.page_verify.eq_ignore_ascii_case("CHECKSUM") {
        out.push(format!("page verify is {}", state.page_verify));
    }
    if state.auto_close {
        out.push("AUTO_CLOSE is on".to_string());
    }
    if state.auto_shrink {
        out.push("AUTO_SHRINK is on".to_string());
    }
    out
}

/// Normalize, optionally check and verify every user database.
pub async fn run_maintenance(
    engine: &mut dyn SqlEngine,
    sink: &dyn LogSink,
    options: MaintenanceOptions,
) -> MaintenanceReport {
    let started = Instant::now();
    let mut report = MaintenanceReport::default();

    let level = target_compat_level(engine).await;
    report.compatibility_level = Some(level);

    let databases = match engine.user_databases().await {
        Ok(dbs) => dbs,
        Err(e) => {
            warn!("[PHASE: maintenance] [STEP: list] {}", e);
            sink.error(&format!("Could not list databases for normalization: {}", e));
            report
                .normalization_failures
                .push(issue("*", format!("database list unavailable: {}", e)));
            return report;
        }
    };

    sink.info(&format!(
        "Normalizing {} databases (compatibility {})",
        databases.len(),
        level
    ));
    for db in &databases {
        match engine.execute(&normalization_batch(db, level)).await {
            Ok(()) => {
                debug!("[PHASE: maintenance] [STEP: normalize] {} ok", db);
                report.normalized.push(db.clone());
            }
            Err(e) => {
                warn!("[PHASE: maintenance] [STEP: normalize] {} failed: {}", db, e);
                sink.warn(&format!("{}: normalization failed: {}", db, e));
                report.normalization_failures.push(issue(db, e.to_string()));
            }
        }
    }

    if options.integrity_check {
        sink.info("Checking physical integrity");
        for db in &databases {
            match engine.execute(&checkdb_physical_only_stmt(db)).await {
                Ok(()) => report.integrity_checked.push(db.clone()),
                Err(e) => {
                    warn!("[PHASE: maintenance] [STEP: checkdb] {} failed: {}", db, e);
                    sink.warn(&format!("{}: integrity check failed: {}", db, e));
                    report.integrity_failures.push(issue(db, e.to_string()));
                }
            }
        }
    }

    if options.verify {
        verify(engine, sink, level, &mut report).await;
    }

    info!(
        "[PHASE: maintenance] [STEP: run] exit (normalized={}, normalize_fail={}, checkdb_fail={}, issues={}, duration_ms={})",
        report.normalized.len(),
        report.normalization_failures.len(),
        report.integrity_failures.len(),
        report.verification_issues.len(),
        started.elapsed().as_millis()
    );
    report
}

async fn verify(engine: &mut dyn SqlEngine, sink: &dyn LogSink, level: u16, report: &mut MaintenanceReport) {
    let states = match engine.database_states().await {
        Ok(states) => states,
        Err(e) => {
            warn!("[PHASE: maintenance] [STEP: verify] {}", e);
            report
                .verification_issues
                .push(issue("*", format!("database state unavailable: {}", e)));
            return;
        }
    };
    for state in &states {
        for detail in deviations(state, level) {
            sink.warn(&format!("{}: {}", state.name, detail));
            report.verification_issues.push(issue(&state.name, detail));
        }
    }
}
