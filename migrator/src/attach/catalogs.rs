// Catalog attach sequencer
//
// The fixed, ordered catalog set must reach a terminal outcome before alias discovery. A failed
// catalog never aborts the sequence; its domain simply discovers nothing.

use log::info;
use std::time::Instant;

use super::engine::AttachEngine;
use super::indexer::FileIndex;
use crate::database::engine::SqlEngine;
use crate::error::MigrationError;
use crate::models::{GroupReport, LogicalDatabase};
use crate::utils::LogSink;

pub const DB_DIRECTORY: &str = "DB_Directory";
pub const PREDETERMINADA: &str = "predeterminada";
pub const GENERALES_SQL: &str = "generalessql";
pub const COMPACW_ADMIN: &str = "CompacwAdmin";
pub const REPOSITORIO_ADMINPAQ: &str = "repositorioadminpaq";
pub const NOM_GENERALES: &str = "Nomgenerales";

/// Catalogs in attach order, with the spellings seen in the field.
pub fn default_catalogs() -> Vec<LogicalDatabase> {
    vec![
        LogicalDatabase::with_alternates(DB_DIRECTORY, &["db_directory", "DB_DIRECTORY"]),
        LogicalDatabase::new(PREDETERMINADA),
        LogicalDatabase::with_alternates(GENERALES_SQL, &["GeneralesSQL", "GENERALESSQL"]),
        LogicalDatabase::with_alternates(COMPACW_ADMIN, &["compacwadmin", "COMPACWADMIN"]),
        LogicalDatabase::new(REPOSITORIO_ADMINPAQ),
        LogicalDatabase::with_alternates(
            NOM_GENERALES,
            &["nomgenerales", "NOMGENERALES", "nomGenerales"],
        ),
    ]
}

/// The configured catalog list. Overridden names keep the built-in alternates when they match a
/// known catalog.
pub fn catalogs_from_settings(overrides: Option<&[String]>) -> Vec<LogicalDatabase> {
    let Some(names) = overrides else {
        return default_catalogs();
    };
    let known = default_catalogs();
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(|n| {
            known
                .iter()
                .find(|k| k.matches_name(n))
                .cloned()
                .unwrap_or_else(|| LogicalDatabase::new(n))
        })
        .collect()
}

/// Attach every catalog in order.
pub async fn attach_catalogs(
    attacher: &mut AttachEngine,
    engine: &mut dyn SqlEngine,
    sink: &dyn LogSink,
    catalogs: &[LogicalDatabase],
    index: &FileIndex,
) -> GroupReport {
    let started = Instant::now();
    sink.info("Attaching catalogs");
    let mut group = GroupReport::default();

    for db in catalogs {
        match attacher.attach_logical(engine, sink, db, index).await {
            Ok(outcome) => group.record(outcome),
            Err(MigrationError::NotFound { logical_name }) => {
                sink.warn(&format!("{}: no data file found", logical_name));
                group.record_unresolved(&logical_name);
            }
            Err(other) => {
                sink.error(&format!("{}: {}", db.canonical_name, other));
                group.failed.push(db.canonical_name.clone());
            }
        }
    }

    info!(
        "[PHASE: attach] [STEP: catalogs] exit (ok={}, fail={}, skipped={}, duration_ms={})",
        group.attached.len(),
        group.failed.len(),
        group.skipped.len(),
        started.elapsed().as_millis()
    );
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachStatus;
    use crate::test_support::StubEngine;
    use crate::utils::CollectingSink;

    #[test]
    fn default_order_is_fixed() {
        let names: Vec<_> = default_catalogs()
            .into_iter()
            .map(|c| c.canonical_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "DB_Directory",
                "predeterminada",
                "generalessql",
                "CompacwAdmin",
                "repositorioadminpaq",
                "Nomgenerales"
            ]
        );
    }

    #[test]
    fn overrides_keep_known_alternates() {
        let list = catalogs_from_settings(Some(&[
            "GENERALESSQL".to_string(),
            " ".to_string(),
            "Accounting".to_string(),
        ]));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].canonical_name, "generalessql");
        assert_eq!(list[0].alternate_names.len(), 2);
        assert_eq!(list[1], LogicalDatabase::new("Accounting"));
    }

    #[tokio::test]
    async fn one_failing_catalog_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["DB_Directory.mdf", "generalessql.mdf", "CompacwAdmin.mdf", "CompacwAdmin_log.ldf"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let mut engine = StubEngine::new()
            .with_live(&["predeterminada"])
            .with_rebuild_error("generalessql", 5133);
        let index = FileIndex::build(dir.path(), &mut engine).await;
        let sink = CollectingSink::default();
        let mut attacher = AttachEngine::new(false);

        let group = attach_catalogs(&mut attacher, &mut engine, &sink, &default_catalogs(), &index).await;

        assert_eq!(group.attached, vec!["DB_Directory", "predeterminada", "CompacwAdmin"]);
        assert_eq!(group.failed, vec!["generalessql"]);
        assert_eq!(group.skipped, vec!["repositorioadminpaq", "Nomgenerales"]);
        assert_eq!(group.status_of("CompacwAdmin"), Some(&AttachStatus::AttachedTwoFile));
        assert_eq!(group.status_of("predeterminada"), Some(&AttachStatus::AlreadyAttached));
    }
}
