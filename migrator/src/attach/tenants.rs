// Tenant attach sequencer and the orphan pass.
//
// Each domain is processed independently. Only when every domain discovered nothing are the
// remaining primary files attached under their own base names.

use log::info;
use std::collections::{BTreeMap, HashSet};

use super::catalogs::default_catalogs;
use super::engine::AttachEngine;
use super::indexer::FileIndex;
use super::resolver::resolve_log;
use crate::database::engine::SqlEngine;
use crate::error::MigrationError;
use crate::models::{AliasGroup, Domain, GroupReport, LogicalDatabase};
use crate::utils::LogSink;

const SYSTEM_DATABASE_FILES: [&str; 6] = ["master", "model", "msdb", "msdbdata", "tempdb", "mssqlsystemresource"];

/// Resolve and attach every discovered alias, one report group per domain.
pub async fn attach_tenants(
    attacher: &mut AttachEngine,
    engine: &mut dyn SqlEngine,
    sink: &dyn LogSink,
    groups: &[AliasGroup],
    index: &FileIndex,
) -> BTreeMap<Domain, GroupReport> {
    let mut reports = BTreeMap::new();
    for group in groups {
        let mut report = GroupReport::default();
        if !group.is_empty() {
            sink.info(&format!("Attaching {} companies ({})", group.domain.label(), group.len()));
        }
        for alias in group.names() {
            let db = LogicalDatabase::new(alias);
            match attacher.attach_logical(engine, sink, &db, index).await {
                Ok(outcome) => report.record(outcome),
                Err(MigrationError::NotFound { logical_name }) => {
                    sink.warn(&format!("{}: no data file found", logical_name));
                    report.record_unresolved(&logical_name);
                }
                Err(other) => {
                    sink.error(&format!("{}: {}", alias, other));
                    report.failed.push(alias.to_string());
                }
            }
        }
        info!(
            "[PHASE: attach] [STEP: tenants] {} (ok={}, fail={}, skipped={})",
            group.domain.label(),
            report.attached.len(),
            report.failed.len(),
            report.skipped.len()
        );
        reports.insert(group.domain, report);
    }
    reports
}

/// True when no domain produced a single alias.
pub fn orphan_pass_needed(groups: &[AliasGroup]) -> bool {
    groups.iter().all(AliasGroup::is_empty)
}

/// Lowercased base names the orphan pass must never attach.
pub fn orphan_exclusions(catalogs: &[LogicalDatabase]) -> HashSet<String> {
    let mut out: HashSet<String> = SYSTEM_DATABASE_FILES.iter().map(|s| s.to_string()).collect();
    for db in catalogs.iter().chain(default_catalogs().iter()) {
        out.extend(db.all_names().map(str::to_lowercase));
    }
    out
}

/// Attach every remaining primary file under its own base name.
pub async fn attach_orphans(
    attacher: &mut AttachEngine,
    engine: &mut dyn SqlEngine,
    sink: &dyn LogSink,
    index: &FileIndex,
    catalogs: &[LogicalDatabase],
) -> GroupReport {
    let excluded = orphan_exclusions(catalogs);
    let mut report = GroupReport::default();
    sink.info("No companies discovered; attaching the remaining data files by name");

    for primary in index.primaries() {
        let base = primary.base_name.as_str();
        if excluded.contains(&base.to_lowercase()) || attacher.was_attached(base) {
            continue;
        }
        let log = resolve_log(primary, index);
        let outcome = attacher
            .attach(engine, sink, base, &primary.path, log.as_deref())
            .await;
        report.record(outcome);
    }

    info!(
        "[PHASE: attach] [STEP: orphans] exit (ok={}, fail={}, skipped={})",
        report.attached.len(),
        report.failed.len(),
        report.skipped.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachStatus, DiscoveryStatus};
    use crate::test_support::StubEngine;
    use crate::utils::CollectingSink;

    fn group(domain: Domain, names: &[&str]) -> AliasGroup {
        let mut g = AliasGroup::new("catalog", domain);
        for n in names {
            g.insert(n);
        }
        g
    }

    fn empty_groups() -> Vec<AliasGroup> {
        Domain::ALL
            .iter()
            .map(|d| AliasGroup::unavailable("catalog", *d, DiscoveryStatus::CatalogUnavailable))
            .collect()
    }

    #[test]
    fn orphan_pass_only_when_all_domains_empty() {
        assert!(orphan_pass_needed(&empty_groups()));
        let mut groups = empty_groups();
        groups[2] = group(Domain::Commercial, &["adAlpha"]);
        assert!(!orphan_pass_needed(&groups));
    }

    #[test]
    fn exclusions_cover_system_and_catalog_spellings() {
        let ex = orphan_exclusions(&[LogicalDatabase::new("Accounting")]);
        for name in ["master", "msdbdata", "tempdb", "generalessql", "nomgenerales", "db_directory", "accounting"] {
            assert!(ex.contains(name), "{} should be excluded", name);
        }
        assert!(!ex.contains("ctalpha"));
    }

    #[tokio::test]
    async fn domains_are_isolated_and_duplicates_attach_once() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["ctAlpha.mdf", "ctAlpha_log.ldf", "nmAlpha.mdf"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let mut engine = StubEngine::new().with_two_file_error("ctAlpha", 5133);
        let journal = engine.journal();
        let index = FileIndex::build(dir.path(), &mut engine).await;
        let sink = CollectingSink::default();
        let mut attacher = AttachEngine::new(false);

        let groups = vec![
            group(Domain::Accounting, &["ctAlpha", "ctMissing"]),
            group(Domain::Payroll, &["nmAlpha"]),
            group(Domain::Commercial, &["nmAlpha"]),
        ];
        let reports = attach_tenants(&mut attacher, &mut engine, &sink, &groups, &index).await;

        let accounting = &reports[&Domain::Accounting];
        assert_eq!(accounting.failed, vec!["ctAlpha"]);
        assert_eq!(accounting.skipped, vec!["ctMissing"]);
        assert_eq!(reports[&Domain::Payroll].status_of("nmAlpha"), Some(&AttachStatus::AttachedRebuildLog));
        assert_eq!(reports[&Domain::Commercial].status_of("nmAlpha"), Some(&AttachStatus::AlreadyAttached));
        assert_eq!(journal.count_containing("CREATE DATABASE [nmAlpha]"), 1);
    }

    #[tokio::test]
    async fn orphan_pass_attaches_non_excluded_files() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["master.mdf", "generalessql.mdf", "GeneralesSQL_2.mdf", "ctLost.mdf", "ctLost_log.ldf", "ctLive.mdf"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let mut engine = StubEngine::new().with_live(&["ctLive"]);
        let index = FileIndex::build(dir.path(), &mut engine).await;
        let sink = CollectingSink::default();
        let mut attacher = AttachEngine::new(false);

        let report = attach_orphans(&mut attacher, &mut engine, &sink, &index, &default_catalogs()).await;

        assert_eq!(report.status_of("ctLost"), Some(&AttachStatus::AttachedTwoFile));
        assert_eq!(report.status_of("ctLive"), Some(&AttachStatus::AlreadyAttached));
        assert_eq!(report.status_of("GeneralesSQL_2"), Some(&AttachStatus::AttachedRebuildLog));
        assert!(report.status_of("master").is_none());
        assert!(report.status_of("generalessql").is_none());
    }
}
