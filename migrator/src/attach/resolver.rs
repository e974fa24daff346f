// Name resolver: logical database name → indexed data files.
//
// First match wins, case-insensitive. Within a step, ties go to the first path in sorted order.

use std::path::{Path, PathBuf};

use super::indexer::{DataFile, FileIndex};
use crate::error::MigrationError;
use crate::models::LogicalDatabase;

/// A file whose normalized base is shorter than this never matches by being contained in a
/// logical name; otherwise a stray `a.mdf` would resolve for most databases.
const MIN_CONTAINED_FUZZY_LEN: usize = 4;

/// Lowercase with `_`, `-`, `.` and whitespace removed.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn file_name_is(file: &DataFile, expected: &str) -> bool {
    file.file_name().to_lowercase() == expected.to_lowercase()
}

/// Primary data file for `db`:
/// 1. `<canonical>.mdf`
/// 2. `<alternate>.mdf`, alternates in order
/// 3. normalized base names where either contains the other (short file names only match
///    when they contain the logical name)
pub fn resolve<'a>(db: &LogicalDatabase, primaries: &'a [DataFile]) -> Result<&'a DataFile, MigrationError> {
    for name in db.all_names() {
        let expected = format!("{}.mdf", name);
        if let Some(hit) = primaries.iter().find(|f| file_name_is(f, &expected)) {
            return Ok(hit);
        }
    }

    let wanted: Vec<String> = db
        .all_names()
        .map(normalize)
        .filter(|n| !n.is_empty())
        .collect();
    let fuzzy = primaries.iter().find(|f| {
        let candidate = normalize(&f.base_name);
        !candidate.is_empty()
            && wanted.iter().any(|w| {
                candidate.contains(w.as_str())
                    || (candidate.chars().count() >= MIN_CONTAINED_FUZZY_LEN && w.contains(candidate.as_str()))
            })
    });

    fuzzy.ok_or_else(|| MigrationError::NotFound {
        logical_name: db.canonical_name.clone(),
    })
}

/// Log file for a primary file, looked up in the primary's own directory:
/// `<base>_log.ldf`, `<base>.ldf`, `mastlog.ldf<base>.ldf`, then any log whose normalized base
/// name contains the normalized primary base name. `None` means "no log available".
pub fn resolve_log(primary: &DataFile, index: &FileIndex) -> Option<PathBuf> {
    let dir = primary.path.parent().unwrap_or(Path::new(""));
    let base = &primary.base_name;
    let trials = [
        format!("{}_log.ldf", base),
        format!("{}.ldf", base),
        format!("mastlog.ldf{}.ldf", base),
    ];

    for trial in &trials {
        if let Some(hit) = index.logs_in_dir(dir).find(|f| file_name_is(f, trial)) {
            return Some(hit.path.clone());
        }
    }

    let wanted = normalize(base);
    if wanted.is_empty() {
        return None;
    }
    index
        .logs_in_dir(dir)
        .find(|f| normalize(&f.base_name).contains(wanted.as_str()))
        .map(|f| f.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::indexer::IndexSource;

    fn index(paths: &[&str]) -> FileIndex {
        FileIndex::from_paths(
            Path::new("/d"),
            IndexSource::LocalWalk,
            paths.iter().map(PathBuf::from),
        )
    }

    #[test]
    fn normalize_strips_separators_and_case() {
        assert_eq!(normalize("DB_Directory"), "dbdirectory");
        assert_eq!(normalize(" ct-Empresa.1 "), "ctempresa1");
    }

    #[test]
    fn exact_canonical_matches_case_insensitively() {
        let idx = index(&["/d/GENERALESSQL.mdf", "/d/generalessql.mdf", "/d/generales_sql_old.mdf"]);
        let db = LogicalDatabase::with_alternates("generalessql", &["GENERALESSQL"]);
        let hit = resolve(&db, idx.primaries()).unwrap();
        // Both spellings match step 1; sorted order decides.
        assert_eq!(hit.path, PathBuf::from("/d/GENERALESSQL.mdf"));
    }

    #[test]
    fn exact_canonical_beats_earlier_alternate_and_fuzzy() {
        let idx = index(&["/d/GENERALES.mdf", "/d/a_generalessql_old.mdf", "/d/generalessql.mdf"]);
        assert_eq!(idx.primaries()[0].base_name, "GENERALES");
        assert_eq!(idx.primaries()[1].base_name, "a_generalessql_old");

        let db = LogicalDatabase::with_alternates("generalessql", &["GENERALES"]);
        let hit = resolve(&db, idx.primaries()).unwrap();
        assert_eq!(hit.path, PathBuf::from("/d/generalessql.mdf"));
    }

    #[test]
    fn alternate_beats_earlier_fuzzy() {
        let idx = index(&["/d/a_nomgenerales_bak.mdf", "/d/nomGenerales.mdf"]);
        assert_eq!(idx.primaries()[0].base_name, "a_nomgenerales_bak");

        let db = LogicalDatabase::with_alternates("Nomgenerales_X", &["nomGenerales"]);
        let hit = resolve(&db, idx.primaries()).unwrap();
        assert_eq!(hit.base_name, "nomGenerales");
    }

    #[test]
    fn short_file_names_do_not_match_by_containment() {
        let idx = index(&["/d/a.mdf", "/d/ct.mdf", "/d/gen.mdf"]);
        let err = resolve(&LogicalDatabase::new("ctGenerales"), idx.primaries()).unwrap_err();
        assert!(matches!(err, MigrationError::NotFound { .. }));

        // The other direction still works for short names.
        let idx = index(&["/d/ct_backup.mdf"]);
        assert_eq!(
            resolve(&LogicalDatabase::new("ct"), idx.primaries()).unwrap().base_name,
            "ct_backup"
        );
    }

    #[test]
    fn fuzzy_match_either_direction() {
        let idx = index(&["/d/DB-Directory.mdf"]);
        let db = LogicalDatabase::new("DB_Directory");
        assert_eq!(resolve(&db, idx.primaries()).unwrap().base_name, "DB-Directory");

        let idx = index(&["/d/ctEmp.mdf"]);
        let db = LogicalDatabase::new("ct_Emp_2024");
        assert_eq!(resolve(&db, idx.primaries()).unwrap().base_name, "ctEmp");
    }

    #[test]
    fn not_found_carries_logical_name() {
        let idx = index(&["/d/other.mdf"]);
        let err = resolve(&LogicalDatabase::new("ctMissing"), idx.primaries()).unwrap_err();
        assert!(matches!(err, MigrationError::NotFound { logical_name } if logical_name == "ctMissing"));
    }

    #[test]
    fn log_resolution_order() {
        let idx = index(&["/d/a.mdf", "/d/a.ldf", "/d/a_log.ldf", "/d/mastlog.ldfa.ldf"]);
        let primary = &idx.primaries()[0];
        assert_eq!(resolve_log(primary, &idx), Some(PathBuf::from("/d/a_log.ldf")));

        let idx = index(&["/d/a.mdf", "/d/A.LDF", "/d/mastlog.ldfa.ldf"]);
        assert_eq!(resolve_log(&idx.primaries()[0], &idx), Some(PathBuf::from("/d/A.LDF")));

        let idx = index(&["/d/a.mdf", "/d/mastlog.ldfa.ldf"]);
        assert_eq!(
            resolve_log(&idx.primaries()[0], &idx),
            Some(PathBuf::from("/d/mastlog.ldfa.ldf"))
        );
    }

    #[test]
    fn log_fuzzy_scan_stays_in_directory() {
        let idx = index(&["/d/ctAlpha.mdf", "/d/ct_alpha_2.ldf", "/d/sub/ctAlpha_log.ldf"]);
        assert_eq!(
            resolve_log(&idx.primaries()[0], &idx),
            Some(PathBuf::from("/d/ct_alpha_2.ldf"))
        );

        let idx = index(&["/d/ctAlpha.mdf", "/d/sub/ctAlpha_log.ldf"]);
        assert_eq!(resolve_log(&idx.primaries()[0], &idx), None);
    }
}
