// Database connection management
//
// EngineConnector trait: the orchestrator connects only after the service is (re)started, so
// connecting is a capability handed to it rather than an already-open client. Tests swap in
// stub connectors to exercise connection failure paths without a real instance.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tiberius::{Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::TokioAsyncWriteCompatExt;

use super::engine::{SqlEngine, TiberiusEngine};
use crate::settings::MigrationSettings;
use crate::utils::logging::mask_connection_string;

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// User-friendly message (safe to show in UI)
    pub user_message: String,
    /// Internal details for logging (may contain masked info)
    pub internal_details: String,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ConnectError {}

/// Opens the session's engine connection.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SqlEngine>, ConnectError>;

    /// Timeout for a single connection attempt.
    fn timeout_duration(&self) -> Duration {
        Duration::from_secs(20)
    }

    /// Attempts before giving up. A freshly started service often refuses the first logins.
    fn max_retries(&self) -> u32 {
        3
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(2)
    }
}

/// Connect with a per-attempt timeout and bounded retries.
pub async fn connect_with_retry<C: EngineConnector + ?Sized>(
    connector: &C,
) -> Result<Box<dyn SqlEngine>, ConnectError> {
    let mut last_error = None;

    for attempt in 0..connector.max_retries() {
        match timeout(connector.timeout_duration(), connector.connect()).await {
            Ok(Ok(engine)) => {
                debug!(
                    "[PHASE: database] [STEP: connect] connected (attempt={})",
                    attempt + 1
                );
                return Ok(engine);
            }
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: database] [STEP: connect] attempt {} failed: {}",
                    attempt + 1,
                    e.internal_details
                );
                last_error = Some(e);
            }
            Err(_) => {
                warn!(
                    "[PHASE: database] [STEP: connect] attempt {} timed out",
                    attempt + 1
                );
                last_error = Some(ConnectError {
                    user_message: "Connection timed out. Check network connectivity and firewall."
                        .to_string(),
                    internal_details: format!("Timeout on attempt {}", attempt + 1),
                });
            }
        }
        if attempt + 1 < connector.max_retries() {
            tokio::time::sleep(connector.retry_delay()).await;
        }
    }

    Err(last_error.unwrap_or_else(|| ConnectError {
        user_message: "Connection failed after all retries.".to_string(),
        internal_details: "Unknown error".to_string(),
    }))
}

/// Quote an ADO connection-string value when it contains separators or quotes.
fn ado_value(value: &str) -> String {
    if value.contains([';', '"', '\'', '=']) || value.trim() != value {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Build the ADO connection string for the `master` database of an instance.
///
/// SQL authentication when a user is configured, integrated security otherwise.
pub fn build_connection_string(settings: &MigrationSettings) -> String {
    let mut parts = vec![
        format!("Server=tcp:{}", ado_value(settings.instance.trim())),
        "Database=master".to_string(),
        "Application Name=attach-migrator".to_string(),
    ];
    match settings.user.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(user) => {
            parts.push(format!("User Id={}", ado_value(user.trim())));
            parts.push(format!(
                "Password={}",
                ado_value(settings.password.as_deref().unwrap_or(""))
            ));
        }
        None => parts.push("IntegratedSecurity=true".to_string()),
    }
    if settings.trust_server_certificate {
        parts.push("TrustServerCertificate=true".to_string());
    }
    parts.push(format!(
        "Encrypt={}",
        if settings.encrypt { "true" } else { "false" }
    ));
    parts.join(";")
}

/// Production connector for SQL Server.
pub struct TiberiusConnector {
    connection_string: String,
    connect_timeout: Duration,
}

impl TiberiusConnector {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            connect_timeout: Duration::from_secs(20),
        }
    }

    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            connection_string: build_connection_string(settings),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
        }
    }

    async fn open(&self) -> Result<TiberiusEngine> {
        let config = Config::from_ado_string(&self.connection_string)?;
        // Resolves `host\INSTANCE` through SQL Browser; plain hosts connect directly.
        let tcp = TcpStream::connect_named(&config).await?;
        tcp.set_nodelay(true)?;

        // tiberius expects a futures::io::AsyncWrite, so we use compat_write
        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(TiberiusEngine::new(client))
    }
}

#[async_trait]
impl EngineConnector for TiberiusConnector {
    async fn connect(&self) -> Result<Box<dyn SqlEngine>, ConnectError> {
        info!(
            "[PHASE: database] [STEP: connect] Connecting ({})",
            mask_connection_string(&self.connection_string)
        );
        match self.open().await {
            Ok(engine) => Ok(Box::new(engine)),
            Err(e) => Err(ConnectError {
                user_message: "Unable to connect. Verify instance name, credentials, and that the service is running."
                    .to_string(),
                internal_details: format!("Connection error: {}", e),
            }),
        }
    }

    fn timeout_duration(&self) -> Duration {
        self.connect_timeout
    }
}
