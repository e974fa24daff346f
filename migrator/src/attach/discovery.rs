// Alias discovery: tenant database names registered in each live catalog.
//
// Any failure leaves that domain empty and is classified on the group's status; discovery never
// fails the session.

use log::{info, warn};

use super::catalogs::{default_catalogs, COMPACW_ADMIN, DB_DIRECTORY, GENERALES_SQL, NOM_GENERALES};
use super::engine::AttachEngine;
use crate::database::engine::SqlEngine;
use crate::database::statements::catalog_select;
use crate::error::MigrationError;
use crate::models::{AliasGroup, DiscoveryStatus, Domain, LogicalDatabase};
use crate::utils::LogSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extraction {
    Verbatim,
    /// Stored value is a folder path; the database name is its last segment.
    LastPathSegment,
}

struct DomainSource {
    domain: Domain,
    catalog: &'static str,
    table: &'static str,
    columns: &'static [&'static str],
    filter: Option<&'static str>,
    extraction: Extraction,
}

const SOURCES: [DomainSource; 4] = [
    DomainSource {
        domain: Domain::Accounting,
        catalog: GENERALES_SQL,
        table: "listaempresas",
        columns: &["aliasbdd"],
        filter: None,
        extraction: Extraction::Verbatim,
    },
    DomainSource {
        domain: Domain::Payroll,
        catalog: NOM_GENERALES,
        table: "nom10000",
        columns: &["rutaempresa"],
        filter: None,
        extraction: Extraction::LastPathSegment,
    },
    DomainSource {
        domain: Domain::Commercial,
        catalog: COMPACW_ADMIN,
        table: "Empresas",
        columns: &["crutadatos"],
        filter: Some("cidempresa <> 1"),
        extraction: Extraction::LastPathSegment,
    },
    DomainSource {
        domain: Domain::DocumentDirectory,
        catalog: DB_DIRECTORY,
        table: "DatabaseDirectory",
        columns: &[
            "DB_DocumentsMetadata",
            "DB_DocumentsContent",
            "DB_OthersMetadata",
            "DB_OthersContent",
        ],
        filter: None,
        extraction: Extraction::Verbatim,
    },
];

/// Final segment of a Windows or POSIX folder path.
pub fn last_path_segment(value: &str) -> &str {
    value
        .trim()
        .trim_end_matches(['\\', '/'])
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or("")
}

fn catalog_definition(catalogs: &[LogicalDatabase], name: &str) -> LogicalDatabase {
    let defaults = default_catalogs();
    catalogs
        .iter()
        .chain(defaults.iter())
        .find(|c| c.matches_name(name))
        .cloned()
        .unwrap_or_else(|| LogicalDatabase::new(name))
}

/// One alias group per domain, in `Domain::ALL` order.
pub async fn discover_aliases(
    attacher: &mut AttachEngine,
    engine: &mut dyn SqlEngine,
    sink: &dyn LogSink,
    catalogs: &[LogicalDatabase],
) -> Vec<AliasGroup> {
    let mut groups = Vec::with_capacity(SOURCES.len());
    for source in &SOURCES {
        let catalog = catalog_definition(catalogs, source.catalog);
        let group = discover_one(attacher, engine, source, &catalog).await;
        match &group.status {
            DiscoveryStatus::Discovered(n) => {
                sink.info(&format!("{}: {} companies registered", source.domain.label(), n))
            }
            other => sink.warn(&format!("{}: discovery skipped ({:?})", source.domain.label(), other)),
        }
        groups.push(group);
    }
    groups
}

async fn discover_one(
    attacher: &mut AttachEngine,
    engine: &mut dyn SqlEngine,
    source: &DomainSource,
    catalog: &LogicalDatabase,
) -> AliasGroup {
    let Some(live) = attacher.live_name(engine, catalog).await else {
        info!(
            "[PHASE: discovery] [STEP: {}] catalog {} is not attached",
            source.domain.label(),
            catalog.canonical_name
        );
        return AliasGroup::unavailable(&catalog.canonical_name, source.domain, DiscoveryStatus::CatalogUnavailable);
    };

    let sql = catalog_select(&live, source.table, source.columns, source.filter);
    let rows = match engine.query_text_rows(&sql).await {
        Ok(rows) => rows,
        Err(e) => {
            let status = if e.is_schema_mismatch() {
                DiscoveryStatus::SchemaMismatch(e.to_string())
            } else {
                DiscoveryStatus::QueryFailed(e.to_string())
            };
            let err = MigrationError::DiscoveryQueryFailed {
                catalog: live.clone(),
                detail: e.to_string(),
            };
            warn!("[PHASE: discovery] [STEP: {}] {}", source.domain.label(), err);
            return AliasGroup::unavailable(&live, source.domain, status);
        }
    };

    let mut group = AliasGroup::new(&live, source.domain);
    for value in rows.iter().flatten().flatten() {
        let name = match source.extraction {
            Extraction::Verbatim => value.as_str(),
            Extraction::LastPathSegment => last_path_segment(value),
        };
        group.insert(name);
    }
    info!(
        "[PHASE: discovery] [STEP: {}] exit (catalog={}, aliases={})",
        source.domain.label(),
        live,
        group.len()
    );
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{rows, server_error, StubEngine};
    use crate::utils::CollectingSink;

    #[test]
    fn last_path_segment_handles_both_separators() {
        assert_eq!(last_path_segment("C:\\Compac\\Empresas\\adALPHA"), "adALPHA");
        assert_eq!(last_path_segment("C:\\Compac\\Empresas\\adALPHA\\ "), "adALPHA");
        assert_eq!(last_path_segment("/var/opt/empresas/nmBeta/"), "nmBeta");
        assert_eq!(last_path_segment("plain"), "plain");
        assert_eq!(last_path_segment("   "), "");
    }

    #[tokio::test]
    async fn discovers_each_domain_with_dedup_and_extraction() {
        let mut engine = StubEngine::new()
            .with_live(&["GeneralesSQL", "Nomgenerales", "CompacwAdmin", "DB_Directory"])
            .with_query("[listaempresas]", rows(&["ctAlpha", "CTALPHA", " ", "ctBeta "]))
            .with_query("[nom10000]", rows(&["C:\\Nominas\\nmAlpha", "C:\\Nominas\\NMALPHA\\"]))
            .with_query("[Empresas]", rows(&["C:\\Compac\\Empresas\\adAlpha"]))
            .with_query(
                "[DatabaseDirectory]",
                vec![vec![
                    Some("document_1_metadata".to_string()),
                    Some("document_1_content".to_string()),
                    None,
                    Some(" ".to_string()),
                ]],
            );
        let journal = engine.journal();
        let sink = CollectingSink::default();
        let mut attacher = AttachEngine::new(false);

        let groups = discover_aliases(&mut attacher, &mut engine, &sink, &default_catalogs()).await;
        let by_domain = |d: Domain| groups.iter().find(|g| g.domain == d).unwrap();

        let accounting: Vec<_> = by_domain(Domain::Accounting).names().collect();
        assert_eq!(accounting, vec!["ctAlpha", "ctBeta"]);
        assert_eq!(by_domain(Domain::Payroll).len(), 1);
        assert_eq!(by_domain(Domain::Commercial).names().next(), Some("adAlpha"));
        assert_eq!(by_domain(Domain::DocumentDirectory).len(), 2);
        assert_eq!(by_domain(Domain::Accounting).source_catalog, "generalessql");

        assert_eq!(journal.count_containing("[Empresas] WHERE"), 1);
        assert_eq!(journal.count_containing("cidempresa <> 1"), 1);
    }

    #[tokio::test]
    async fn classifies_unavailable_schema_mismatch_and_query_failure() {
        let mut engine = StubEngine::new()
            .with_live(&["generalessql", "Nomgenerales", "CompacwAdmin"])
            .with_query_error("[listaempresas]", server_error(208, "Invalid object name 'listaempresas'."))
            .with_query_error("[nom10000]", server_error(207, "Invalid column name 'rutaempresa'."))
            .with_query_error("[Empresas]", server_error(229, "SELECT permission denied"));
        let sink = CollectingSink::default();
        let mut attacher = AttachEngine::new(false);

        let groups = discover_aliases(&mut attacher, &mut engine, &sink, &default_catalogs()).await;
        assert!(groups.iter().all(|g| g.is_empty()));
        assert!(matches!(groups[0].status, DiscoveryStatus::SchemaMismatch(_)));
        assert!(matches!(groups[1].status, DiscoveryStatus::SchemaMismatch(_)));
        assert!(matches!(groups[2].status, DiscoveryStatus::QueryFailed(_)));
        assert_eq!(groups[3].status, DiscoveryStatus::CatalogUnavailable);
    }
}
