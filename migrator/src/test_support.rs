// In-memory engine, connector and service stubs for unit tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::database::connection::{ConnectError, EngineConnector};
use crate::database::engine::{DatabaseState, EngineError, SqlEngine};
use crate::database::statements;
use crate::system::service::{ServiceControl, ServiceError, ServiceState};

type Rows = Vec<Vec<Option<String>>>;

/// Every statement and query the stub received, shared with the test after the engine is boxed.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, sql: &str) {
        if let Ok(mut v) = self.0.lock() {
            v.push(sql.to_string());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.entries().iter().filter(|s| s.contains(needle)).count()
    }
}

pub fn server_error(code: u32, message: &str) -> EngineError {
    EngineError::Server {
        code,
        message: message.to_string(),
    }
}

pub fn rows(values: &[&str]) -> Rows {
    values.iter().map(|v| vec![Some(v.to_string())]).collect()
}

#[derive(Default)]
pub struct StubEngine {
    live: BTreeSet<String>,
    hidden_files: HashSet<PathBuf>,
    probe_fails: bool,
    two_file_errors: HashMap<String, EngineError>,
    rebuild_errors: HashMap<String, EngineError>,
    queries: Vec<(String, Result<Rows, EngineError>)>,
    execute_errors: Vec<(String, EngineError)>,
    product_version: Option<String>,
    listing: Option<Vec<String>>,
    default_data_path: Option<String>,
    error_log: Vec<String>,
    states: Option<Vec<DatabaseState>>,
    journal: Journal,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            product_version: Some("16.0.1000.6".to_string()),
            ..Self::default()
        }
    }

    pub fn with_live(mut self, names: &[&str]) -> Self {
        self.live.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn hide_file(mut self, path: &Path) -> Self {
        self.hidden_files.insert(path.to_path_buf());
        self
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.probe_fails = true;
        self
    }

    pub fn with_two_file_error(mut self, name: &str, code: u32) -> Self {
        self.two_file_errors
            .insert(name.to_lowercase(), server_error(code, "two-file attach refused"));
        self
    }

    pub fn with_rebuild_error(mut self, name: &str, code: u32) -> Self {
        self.rebuild_errors
            .insert(name.to_lowercase(), server_error(code, "rebuild-log attach refused"));
        self
    }

    /// Rows for any query whose text contains `needle`.
    pub fn with_query(mut self, needle: &str, result: Rows) -> Self {
        self.queries.push((needle.to_string(), Ok(result)));
        self
    }

    pub fn with_query_error(mut self, needle: &str, error: EngineError) -> Self {
        self.queries.push((needle.to_string(), Err(error)));
        self
    }

    pub fn with_execute_error(mut self, needle: &str, code: u32) -> Self {
        self.execute_errors
            .push((needle.to_string(), server_error(code, "statement refused")));
        self
    }

    pub fn with_product_version(mut self, version: &str) -> Self {
        self.product_version = Some(version.to_string());
        self
    }

    pub fn with_listing(mut self, names: &[&str]) -> Self {
        self.listing = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_default_data_path(mut self, path: &str) -> Self {
        self.default_data_path = Some(path.to_string());
        self
    }

    pub fn with_error_log(mut self, lines: &[&str]) -> Self {
        self.error_log = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_states(mut self, states: Vec<DatabaseState>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn is_live(&self, name: &str) -> bool {
        self.live.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

#[async_trait]
impl SqlEngine for StubEngine {
    async fn database_exists(&mut self, name: &str) -> Result<bool, EngineError> {
        Ok(self.is_live(name))
    }

    async fn engine_sees_file(&mut self, path: &Path) -> Result<bool, EngineError> {
        if self.probe_fails {
            return Err(EngineError::Protocol("xp_fileexist unavailable".to_string()));
        }
        Ok(!self.hidden_files.contains(path))
    }

    async fn attach_two_file(
        &mut self,
        name: &str,
        primary: &Path,
        log: &Path,
    ) -> Result<(), EngineError> {
        self.journal.push(&statements::attach_two_file_stmt(
            name,
            &primary.to_string_lossy(),
            &log.to_string_lossy(),
        ));
        if let Some(e) = self.two_file_errors.get(&name.to_lowercase()) {
            return Err(e.clone());
        }
        self.live.insert(name.to_string());
        Ok(())
    }

    async fn attach_rebuild_log(&mut self, name: &str, primary: &Path) -> Result<(), EngineError> {
        self.journal.push(&statements::attach_rebuild_log_stmt(
            name,
            &primary.to_string_lossy(),
        ));
        if let Some(e) = self.rebuild_errors.get(&name.to_lowercase()) {
            return Err(e.clone());
        }
        self.live.insert(name.to_string());
        Ok(())
    }

    async fn query_text_rows(&mut self, sql: &str) -> Result<Rows, EngineError> {
        self.journal.push(sql);
        for (needle, result) in &self.queries {
            if sql.contains(needle.as_str()) {
                return result.clone();
            }
        }
        Ok(Vec::new())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), EngineError> {
        self.journal.push(sql);
        for (needle, error) in &self.execute_errors {
            if sql.contains(needle.as_str()) {
                return Err(error.clone());
            }
        }
        Ok(())
    }

    async fn product_version(&mut self) -> Result<String, EngineError> {
        self.product_version
            .clone()
            .ok_or_else(|| EngineError::Protocol("ProductVersion is null".to_string()))
    }

    async fn user_databases(&mut self) -> Result<Vec<String>, EngineError> {
        Ok(self.live.iter().cloned().collect())
    }

    async fn list_directory(&mut self, _dir: &Path) -> Result<Vec<String>, EngineError> {
        self.listing
            .clone()
            .ok_or_else(|| EngineError::Protocol("xp_dirtree unavailable".to_string()))
    }

    async fn default_data_path(&mut self) -> Result<Option<String>, EngineError> {
        Ok(self.default_data_path.clone())
    }

    async fn recent_error_log(&mut self) -> Result<Vec<String>, EngineError> {
        Ok(self.error_log.clone())
    }

    async fn database_states(&mut self) -> Result<Vec<DatabaseState>, EngineError> {
        if let Some(states) = &self.states {
            return Ok(states.clone());
        }
        Ok(self
            .live
            .iter()
            .map(|name| DatabaseState {
                name: name.clone(),
                state_desc: "ONLINE".to_string(),
                compatibility_level: 160,
                owner: Some("sa".to_string()),
                page_verify: "CHECKSUM".to_string(),
                auto_close: false,
                auto_shrink: false,
            })
            .collect())
    }
}

/// Hands out one prepared engine; later connects fail.
pub struct StubConnector {
    engine: Mutex<Option<StubEngine>>,
    attempts: Mutex<u32>,
}

impl StubConnector {
    pub fn new(engine: StubEngine) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
            attempts: Mutex::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            engine: Mutex::new(None),
            attempts: Mutex::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.lock().map(|a| *a).unwrap_or_default()
    }
}

#[async_trait]
impl EngineConnector for StubConnector {
    async fn connect(&self) -> Result<Box<dyn SqlEngine>, ConnectError> {
        if let Ok(mut a) = self.attempts.lock() {
            *a += 1;
        }
        let engine = self.engine.lock().ok().and_then(|mut e| e.take());
        match engine {
            Some(engine) => Ok(Box::new(engine)),
            None => Err(ConnectError {
                user_message: "Unable to connect.".to_string(),
                internal_details: "stub has no engine".to_string(),
            }),
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(1)
    }
}

struct ServiceInner {
    state: ServiceState,
    pending: Option<ServiceState>,
    polls_since_request: u32,
    settle_after: u32,
    force_effective: bool,
    requests: Vec<String>,
}

/// Service that reaches the requested state on the (N+1)-th state query after a request.
#[derive(Clone)]
pub struct StubServiceControl {
    inner: Arc<Mutex<ServiceInner>>,
}

impl StubServiceControl {
    fn with_state(state: ServiceState, settle_after: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceInner {
                state,
                pending: None,
                polls_since_request: 0,
                settle_after,
                force_effective: false,
                requests: Vec::new(),
            })),
        }
    }

    pub fn running(settle_after: u32) -> Self {
        Self::with_state(ServiceState::Running, settle_after)
    }

    pub fn stopped(settle_after: u32) -> Self {
        Self::with_state(ServiceState::Stopped, settle_after)
    }

    pub fn with_effective_force_stop(self) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.force_effective = true;
        }
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|i| i.requests.clone())
            .unwrap_or_default()
    }

    fn begin(&self, label: &str, target: ServiceState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.requests.push(label.to_string());
            if inner.pending.is_none() && inner.state != target {
                inner.pending = Some(target);
                inner.polls_since_request = 0;
                inner.state = ServiceState::Transitioning;
            }
        }
    }
}

#[async_trait]
impl ServiceControl for StubServiceControl {
    async fn query_state(&self, _service: &str) -> Result<ServiceState, ServiceError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ServiceError::Command("poisoned".to_string()))?;
        if let Some(target) = inner.pending {
            if inner.polls_since_request >= inner.settle_after {
                inner.state = target;
                inner.pending = None;
            } else {
                inner.polls_since_request += 1;
            }
        }
        Ok(inner.state)
    }

    async fn request_stop(&self, _service: &str) -> Result<(), ServiceError> {
        self.begin("stop", ServiceState::Stopped);
        Ok(())
    }

    async fn force_stop(&self, _service: &str) -> Result<(), ServiceError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.requests.push("force_stop".to_string());
            if inner.force_effective {
                inner.state = ServiceState::Stopped;
                inner.pending = None;
            }
        }
        Ok(())
    }

    async fn request_start(&self, _service: &str) -> Result<(), ServiceError> {
        self.begin("start", ServiceState::Running);
        Ok(())
    }
}
