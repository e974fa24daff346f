// Database engine capability used by the attach pipeline.
//
// Production code uses `TiberiusEngine` (one SQL Server connection owned for the whole session);
// tests use an in-memory stub. All calls are synchronous round-trips from the pipeline's point
// of view and take `&mut self`: nothing else may issue statements on the connection meanwhile.

use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use std::path::Path;
use thiserror::Error;
use tiberius::{Client, Query, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;

use super::statements;

/// Engine errors that let a two-file attach fall back to a rebuild-log attach:
/// 5105 file activation error, 5120 unable to open physical file, 5173 files do not belong
/// together, 1813 new database could not be opened.
pub const RECOVERABLE_ATTACH_CODES: [u32; 4] = [5105, 5120, 5173, 1813];

/// 208 invalid object name, 207 invalid column name.
const SCHEMA_MISMATCH_CODES: [u32; 2] = [208, 207];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine error {code}: {message}")]
    Server { code: u32, message: String },
    #[error("{0}")]
    Protocol(String),
}

impl EngineError {
    pub fn code(&self) -> Option<u32> {
        match self {
            EngineError::Server { code, .. } => Some(*code),
            EngineError::Protocol(_) => None,
        }
    }

    pub fn is_recoverable_attach_error(&self) -> bool {
        self.code()
            .is_some_and(|c| RECOVERABLE_ATTACH_CODES.contains(&c))
    }

    pub fn is_schema_mismatch(&self) -> bool {
        self.code()
            .is_some_and(|c| SCHEMA_MISMATCH_CODES.contains(&c))
    }
}

impl From<tiberius::error::Error> for EngineError {
    fn from(e: tiberius::error::Error) -> Self {
        match e {
            tiberius::error::Error::Server(token) => EngineError::Server {
                code: token.code(),
                message: token.message().to_string(),
            },
            other => EngineError::Protocol(other.to_string()),
        }
    }
}

/// One row of `sys.databases` used by the post-attach verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseState {
    pub name: String,
    pub state_desc: String,
    pub compatibility_level: u16,
    pub owner: Option<String>,
    pub page_verify: String,
    pub auto_close: bool,
    pub auto_shrink: bool,
}

#[async_trait]
pub trait SqlEngine: Send {
    /// True if a database with this name is live in the instance.
    async fn database_exists(&mut self, name: &str) -> Result<bool, EngineError>;

    /// True if the engine's service account can see `path`.
    async fn engine_sees_file(&mut self, path: &Path) -> Result<bool, EngineError>;

    async fn attach_two_file(
        &mut self,
        name: &str,
        primary: &Path,
        log: &Path,
    ) -> Result<(), EngineError>;

    async fn attach_rebuild_log(&mut self, name: &str, primary: &Path) -> Result<(), EngineError>;

    /// Run a read query and return every column of every row as optional text.
    async fn query_text_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, EngineError>;

    /// Run a statement batch, draining all result sets.
    async fn execute(&mut self, sql: &str) -> Result<(), EngineError>;

    async fn product_version(&mut self) -> Result<String, EngineError>;

    /// Names of every non-system database.
    async fn user_databases(&mut self) -> Result<Vec<String>, EngineError>;

    /// Files under `dir` (up to five levels) as `/`-separated paths relative to `dir`.
    async fn list_directory(&mut self, dir: &Path) -> Result<Vec<String>, EngineError>;

    async fn default_data_path(&mut self) -> Result<Option<String>, EngineError>;

    async fn recent_error_log(&mut self) -> Result<Vec<String>, EngineError>;

    async fn database_states(&mut self) -> Result<Vec<DatabaseState>, EngineError>;
}

pub type SqlServerClient = Client<Compat<TcpStream>>;

/// SQL Server engine over a single tiberius client.
pub struct TiberiusEngine {
    client: SqlServerClient,
}

impl TiberiusEngine {
    pub fn new(client: SqlServerClient) -> Self {
        Self { client }
    }

    async fn scalar_text(&mut self, sql: &str) -> Result<Option<String>, EngineError> {
        let rows = self.query_text_rows(sql).await?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next().flatten()))
    }

    async fn scalar_int_with_param(&mut self, sql: &str, param: String) -> Result<Option<i32>, EngineError> {
        let mut query = Query::new(sql);
        query.bind(param);
        let mut stream = query.query(&mut self.client).await?;
        let mut value = None;
        while let Some(item) = stream.try_next().await? {
            if let QueryItem::Row(row) = item {
                if value.is_none() {
                    value = row.try_get::<i32, _>(0)?;
                }
            }
        }
        Ok(value)
    }
}

fn path_for_engine(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn cell_text(row: &tiberius::Row, idx: usize) -> Option<String> {
    if let Ok(Some(s)) = row.try_get::<&str, _>(idx) {
        return Some(s.to_string());
    }
    if let Ok(Some(n)) = row.try_get::<i32, _>(idx) {
        return Some(n.to_string());
    }
    if let Ok(Some(n)) = row.try_get::<i64, _>(idx) {
        return Some(n.to_string());
    }
    if let Ok(Some(n)) = row.try_get::<u8, _>(idx) {
        return Some(n.to_string());
    }
    if let Ok(Some(b)) = row.try_get::<bool, _>(idx) {
        return Some(if b { "1" } else { "0" }.to_string());
    }
    None
}

#[async_trait]
impl SqlEngine for TiberiusEngine {
    async fn database_exists(&mut self, name: &str) -> Result<bool, EngineError> {
        let id = self
            .scalar_int_with_param(statements::DB_EXISTS_QUERY, name.to_string())
            .await?;
        Ok(id.is_some())
    }

    async fn engine_sees_file(&mut self, path: &Path) -> Result<bool, EngineError> {
        let exists = self
            .scalar_int_with_param(statements::FILE_EXISTS_QUERY, path_for_engine(path))
            .await?;
        Ok(exists == Some(1))
    }

    async fn attach_two_file(
        &mut self,
        name: &str,
        primary: &Path,
        log: &Path,
    ) -> Result<(), EngineError> {
        let sql = statements::attach_two_file_stmt(
            name,
            &path_for_engine(primary),
            &path_for_engine(log),
        );
        self.execute(&sql).await
    }

    async fn attach_rebuild_log(&mut self, name: &str, primary: &Path) -> Result<(), EngineError> {
        let sql = statements::attach_rebuild_log_stmt(name, &path_for_engine(primary));
        self.execute(&sql).await
    }

    async fn query_text_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>, EngineError> {
        let mut stream = self.client.simple_query(sql).await?;
        let mut rows = Vec::new();
        while let Some(item) = stream.try_next().await? {
            if let QueryItem::Row(row) = item {
                let cells = (0..row.len()).map(|i| cell_text(&row, i)).collect();
                rows.push(cells);
            }
        }
        Ok(rows)
    }

    async fn execute(&mut self, sql: &str) -> Result<(), EngineError> {
        debug!(
            "[PHASE: database] [STEP: execute] batch entered (len={})",
            sql.len()
        );
        let mut stream = self.client.simple_query(sql).await?;
        // Drain all result sets.
        while stream.try_next().await?.is_some() {}
        Ok(())
    }

    async fn product_version(&mut self) -> Result<String, EngineError> {
        self.scalar_text(statements::PRODUCT_VERSION_QUERY)
            .await?
            .ok_or_else(|| EngineError::Protocol("ProductVersion is null".to_string()))
    }

    async fn user_databases(&mut self) -> Result<Vec<String>, EngineError> {
        let rows = self.query_text_rows(statements::USER_DATABASES_QUERY).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.into_iter().next().flatten())
            .collect())
    }

    async fn list_directory(&mut self, dir: &Path) -> Result<Vec<String>, EngineError> {
        let mut query = Query::new(statements::DIRECTORY_LISTING_QUERY);
        query.bind(path_for_engine(dir));
        let mut stream = query.query(&mut self.client).await?;
        let mut entries = Vec::new();
        while let Some(item) = stream.try_next().await? {
            if let QueryItem::Row(row) = item {
                if let Some(name) = row.try_get::<&str, _>(0)? {
                    entries.push(statements::DirTreeEntry {
                        name: name.to_string(),
                        depth: row.try_get::<i32, _>(1)?.unwrap_or(1),
                        is_file: row.try_get::<bool, _>(2)?.unwrap_or(false),
                    });
                }
            }
        }
        Ok(statements::relative_paths_from_dirtree(&entries))
    }

    async fn default_data_path(&mut self) -> Result<Option<String>, EngineError> {
        Ok(self
            .scalar_text(statements::DEFAULT_DATA_PATH_QUERY)
            .await?
            .filter(|p| !p.trim().is_empty()))
    }

    async fn recent_error_log(&mut self) -> Result<Vec<String>, EngineError> {
        let rows = self.query_text_rows(statements::RECENT_ERROR_LOG_QUERY).await?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_iter().flatten().collect::<Vec<_>>().join(" "))
            .collect())
    }

    async fn database_states(&mut self) -> Result<Vec<DatabaseState>, EngineError> {
        let rows = self.query_text_rows(statements::DATABASE_STATE_QUERY).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let text = |i: usize| r.get(i).cloned().flatten();
            let flag = |i: usize| text(i).as_deref() == Some("1");
            out.push(DatabaseState {
                name: text(0).unwrap_or_default(),
                state_desc: text(1).unwrap_or_default(),
                compatibility_level: text(2).and_then(|v| v.parse().ok()).unwrap_or(0),
                owner: text(3),
                page_verify: text(4).unwrap_or_default(),
                auto_close: flag(5),
                auto_shrink: flag(6),
            });
        }
        Ok(out)
    }
}
