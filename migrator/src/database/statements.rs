// T-SQL builders for attach, discovery and maintenance.
//
// Key design decisions:
// - Identifiers are bracket-quoted (`]` doubled) and string literals are N'…' with `'` doubled;
//   names and paths are never interpolated raw
// - Existence and file-probe checks are parameterized (@P1) and live in `engine.rs`
// - Catalog tables are addressed as `[db]..table` so no `USE` changes the session database

/// Bracket-quote a SQL Server identifier.
pub fn bracket_quote(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Unicode string literal with embedded quotes doubled.
pub fn nstring_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Two-file attach (primary + log).
pub fn attach_two_file_stmt(db_name: &str, primary: &str, log: &str) -> String {
    format!(
        "CREATE DATABASE {} ON (FILENAME = {}), (FILENAME = {}) FOR ATTACH;",
        bracket_quote(db_name),
        nstring_literal(primary),
        nstring_literal(log)
    )
}

/// Single-file attach that builds a fresh transaction log.
pub fn attach_rebuild_log_stmt(db_name: &str, primary: &str) -> String {
    format!(
        "CREATE DATABASE {} ON (FILENAME = {}) FOR ATTACH_REBUILD_LOG;",
        bracket_quote(db_name),
        nstring_literal(primary)
    )
}

pub const DB_EXISTS_QUERY: &str = "SELECT DB_ID(@P1);";

/// Wraps `xp_fileexist` so the result comes back as a single int column.
pub const FILE_EXISTS_QUERY: &str = r#"
    DECLARE @exists int = 0;
    EXEC master.dbo.xp_fileexist @P1, @exists OUTPUT;
    SELECT @exists;
"#;

/// Entries up to five levels under @P1, as seen by the engine service account, in the
/// depth-first order `xp_dirtree` emits them.
pub const DIRECTORY_LISTING_QUERY: &str = r#"
    DECLARE @t TABLE (id int IDENTITY(1,1), name nvarchar(4000), depth int, isfile bit);
    INSERT @t (name, depth, isfile) EXEC master.sys.xp_dirtree @P1, 5, 1;
    SELECT name, depth, isfile FROM @t ORDER BY id;
"#;

/// One `xp_dirtree` row: bare entry name, depth below the listed root (1-based), file flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirTreeEntry {
    pub name: String,
    pub depth: i32,
    pub is_file: bool,
}

/// Rebuild `/`-joined paths relative to the listed root from depth-first `xp_dirtree` rows.
/// Only files are returned.
pub fn relative_paths_from_dirtree(entries: &[DirTreeEntry]) -> Vec<String> {
    let mut parents: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for entry in entries {
        let depth = usize::try_from(entry.depth.max(1)).unwrap_or(1);
        parents.truncate(depth - 1);
        if entry.is_file {
            // A gap in depth means a parent row is missing; skip rather than guess a path.
            if parents.len() == depth - 1 {
                let mut parts = parents.clone();
                parts.push(&entry.name);
                out.push(parts.join("/"));
            }
        } else if parents.len() == depth - 1 {
            parents.push(&entry.name);
        }
    }
    out
}

pub const PRODUCT_VERSION_QUERY: &str =
    "SELECT CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(50));";

pub const USER_DATABASES_QUERY: &str =
    "SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name;";

/// Instance default data folder (2016+ property, registry value for older engines).
pub const DEFAULT_DATA_PATH_QUERY: &str = r#"
    DECLARE @p nvarchar(4000);
    IF TRY_CONVERT(int, PARSENAME(CONVERT(varchar(50), SERVERPROPERTY('ProductVersion')), 4)) >= 13
        SELECT @p = CAST(SERVERPROPERTY('InstanceDefaultDataPath') AS nvarchar(4000));
    IF @p IS NULL
    BEGIN
        DECLARE @r nvarchar(4000) = N'';
        EXEC master.dbo.xp_instance_regread
             N'HKEY_LOCAL_MACHINE', N'Software\Microsoft\MSSQLServer\MSSQLServer',
             N'DefaultData', @r OUTPUT, 'no_output';
        SELECT @p = NULLIF(@r, N'');
    END
    SELECT @p;
"#;

/// Most recent error-log entries containing "Error", newest first.
pub const RECENT_ERROR_LOG_QUERY: &str =
    "EXEC master.dbo.xp_readerrorlog 0, 1, N'Error', NULL, NULL, NULL, N'desc';";

pub const DATABASE_STATE_QUERY: &str = r#"
    SELECT name,
           state_desc,
           CAST(compatibility_level AS int) AS compatibility_level,
           SUSER_SNAME(owner_sid) AS owner_name,
           page_verify_option_desc,
           CAST(is_auto_close_on AS int) AS is_auto_close_on,
           CAST(is_auto_shrink_on AS int) AS is_auto_shrink_on
    FROM sys.databases
    WHERE database_id > 4
    ORDER BY name;
"#;

/// Compatibility level for a server major version: 2022+ → 160, 2019 → 150, older → 140.
pub fn compat_level_for_major(major: u32) -> u16 {
    match major {
        m if m >= 16 => 160,
        15 => 150,
        _ => 140,
    }
}

/// Major version from a `ProductVersion` string such as `16.0.1000.6`.
pub fn parse_major_version(product_version: &str) -> Option<u32> {
    product_version.trim().split('.').next()?.parse().ok()
}

/// Idempotent normalization batch for one database. Ownership is best-effort.
pub fn normalization_batch(db_name: &str, compat_level: u16) -> String {
    let db = bracket_quote(db_name);
    format!(
        "ALTER DATABASE {db} SET COMPATIBILITY_LEVEL = {compat_level};\n\
         BEGIN TRY ALTER AUTHORIZATION ON DATABASE::{db} TO [sa]; END TRY BEGIN CATCH END CATCH;\n\
         ALTER DATABASE {db} SET AUTO_CLOSE OFF;\n\
         ALTER DATABASE {db} SET AUTO_SHRINK OFF;\n\
         ALTER DATABASE {db} SET PAGE_VERIFY CHECKSUM;",
    )
}

/// Physical-only consistency check for one database.
pub fn checkdb_physical_only_stmt(db_name: &str) -> String {
    format!(
        "DBCC CHECKDB({}) WITH NO_INFOMSGS, PHYSICAL_ONLY;",
        bracket_quote(db_name)
    )
}

/// Select `columns` from a catalog table under the catalog's default schema, skipping rows where
/// every selected column is blank.
pub fn catalog_select(catalog_db: &str, table: &str, columns: &[&str], filter: Option<&str>) -> String {
    let cols = columns
        .iter()
        .map(|c| bracket_quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let not_blank = columns
        .iter()
        .map(|c| format!("NULLIF(LTRIM(RTRIM({})), '') IS NOT NULL", bracket_quote(c)))
        .collect::<Vec<_>>()
        .join(" OR ");
    let mut sql = format!(
        "SELECT {} FROM {}..{} WHERE ({})",
        cols,
        bracket_quote(catalog_db),
        bracket_quote(table),
        not_blank
    );
    if let Some(f) = filter {
        sql.push_str(" AND ");
        sql.push_str(f);
    }
    sql.push(';');
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, depth: i32, is_file: bool) -> DirTreeEntry {
        DirTreeEntry {
            name: name.to_string(),
            depth,
            is_file,
        }
    }

    #[test]
    fn dirtree_rows_rebuild_nested_paths() {
        let rows = vec![
            row("ctAlpha.mdf", 1, true),
            row("Empresas", 1, false),
            row("adBeta", 2, false),
            row("adBeta.mdf", 3, true),
            row("adBeta_log.ldf", 3, true),
            row("adGamma", 2, false),
            row("adGamma.mdf", 3, true),
            row("notes.txt", 1, true),
        ];
        assert_eq!(
            relative_paths_from_dirtree(&rows),
            vec![
                "ctAlpha.mdf",
                "Empresas/adBeta/adBeta.mdf",
                "Empresas/adBeta/adBeta_log.ldf",
                "Empresas/adGamma/adGamma.mdf",
                "notes.txt",
            ]
        );
    }

    #[test]
    fn dirtree_rows_with_missing_parent_are_dropped() {
        let rows = vec![row("orphan.mdf", 3, true), row("top.mdf", 1, true)];
        assert_eq!(relative_paths_from_dirtree(&rows), vec!["top.mdf"]);
    }

    #[test]
    fn bracket_quote_doubles_closing_brackets() {
        assert_eq!(bracket_quote("ctEmpresa"), "[ctEmpresa]");
        assert_eq!(bracket_quote("weird]name"), "[weird]]name]");
    }

    #[test]
    fn nstring_literal_doubles_quotes() {
        assert_eq!(nstring_literal("C:\\Data\\a.mdf"), "N'C:\\Data\\a.mdf'");
        assert_eq!(
            nstring_literal("C:\\O'Brien\\a.mdf"),
            "N'C:\\O''Brien\\a.mdf'"
        );
    }

    #[test]
    fn attach_statements_escape_paths_and_names() {
        let sql = attach_two_file_stmt("x]; DROP DATABASE master;--", "C:\\D\\it's.mdf", "C:\\D\\l.ldf");
        assert_eq!(
            sql,
            "CREATE DATABASE [x]]; DROP DATABASE master;--] ON (FILENAME = N'C:\\D\\it''s.mdf'), (FILENAME = N'C:\\D\\l.ldf') FOR ATTACH;"
        );

        let rebuild = attach_rebuild_log_stmt("ctEmpresa", "C:\\D\\ctEmpresa.mdf");
        assert!(rebuild.ends_with("FOR ATTACH_REBUILD_LOG;"));
        assert!(!rebuild.contains(".ldf"));
    }

    #[test]
    fn compat_tiers() {
        assert_eq!(compat_level_for_major(17), 160);
        assert_eq!(compat_level_for_major(16), 160);
        assert_eq!(compat_level_for_major(15), 150);
        assert_eq!(compat_level_for_major(14), 140);
        assert_eq!(compat_level_for_major(11), 140);
    }

    #[test]
    fn parse_major_version_reads_first_component() {
        assert_eq!(parse_major_version("16.0.1000.6"), Some(16));
        assert_eq!(parse_major_version(" 15.0.2000.5 "), Some(15));
        assert_eq!(parse_major_version("garbage"), None);
    }

    #[test]
    fn normalization_batch_covers_every_option() {
        let sql = normalization_batch("ctEmpresa", 150);
        assert!(sql.contains("SET COMPATIBILITY_LEVEL = 150"));
        assert!(sql.contains("BEGIN TRY ALTER AUTHORIZATION ON DATABASE::[ctEmpresa] TO [sa]; END TRY"));
        assert!(sql.contains("SET AUTO_CLOSE OFF"));
        assert!(sql.contains("SET AUTO_SHRINK OFF"));
        assert!(sql.contains("SET PAGE_VERIFY CHECKSUM"));
    }

    #[test]
    fn checkdb_is_physical_only() {
        assert_eq!(
            checkdb_physical_only_stmt("ctEmpresa"),
            "DBCC CHECKDB([ctEmpresa]) WITH NO_INFOMSGS, PHYSICAL_ONLY;"
        );
    }

    #[test]
    fn catalog_select_uses_default_schema_and_blank_filter() {
        let sql = catalog_select("generalessql", "listaempresas", &["aliasbdd"], None);
        assert_eq!(
            sql,
            "SELECT [aliasbdd] FROM [generalessql]..[listaempresas] WHERE (NULLIF(LTRIM(RTRIM([aliasbdd])), '') IS NOT NULL);"
        );

        let sql = catalog_select("CompacwAdmin", "Empresas", &["crutadatos"], Some("cidempresa <> 1"));
        assert!(sql.ends_with("AND cidempresa <> 1;"));
    }
}
