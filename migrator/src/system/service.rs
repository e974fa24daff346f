// Engine service control
//
// `ServiceControl` is the seam the lifecycle controller polls through. Windows drives the
// service with net/sc/taskkill; Linux drives the `mssql-server` systemd unit.

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::time::Duration;

use super::run_cmd_with_timeout;

pub const DEFAULT_INSTANCE_SERVICE: &str = "MSSQLSERVER";
pub const LINUX_SERVICE_UNIT: &str = "mssql-server";

const CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Running,
    Stopped,
    Transitioning,
    Unknown,
}

/// A service and the last state observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub service_name: String,
    pub state: ServiceState,
}

impl ServiceHandle {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            state: ServiceState::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' is not installed")]
    NotInstalled(String),
    #[error("service command failed: {0}")]
    Command(String),
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Command(format!("{:#}", e))
    }
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn query_state(&self, service: &str) -> Result<ServiceState, ServiceError>;

    /// Graceful stop request; returns once the request is issued.
    async fn request_stop(&self, service: &str) -> Result<(), ServiceError>;

    async fn force_stop(&self, service: &str) -> Result<(), ServiceError>;

    async fn request_start(&self, service: &str) -> Result<(), ServiceError>;
}

/// Service name for an instance identifier.
///
/// `host\NAME` → `MSSQL$NAME`; an empty name or `MSSQLSERVER` → `MSSQLSERVER`. Identifiers that
/// already are service names pass through; anything else is the default instance.
pub fn service_name_from_instance(instance: &str) -> String {
    let inst = instance.trim();
    if let Some((_, name)) = inst.split_once('\\') {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case(DEFAULT_INSTANCE_SERVICE) {
            return DEFAULT_INSTANCE_SERVICE.to_string();
        }
        return format!("MSSQL${}", name);
    }
    let upper = inst.to_ascii_uppercase();
    if upper.starts_with("MSSQL$") || upper == DEFAULT_INSTANCE_SERVICE {
        return inst.to_string();
    }
    DEFAULT_INSTANCE_SERVICE.to_string()
}

fn sc_state_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:STATE|ESTADO)\s*:.*?\b(RUNNING|STOPPED|START_PENDING|STOP_PENDING|PAUSED|CONTINUE_PENDING|PAUSE_PENDING)\b",
        )
        .ok()
    })
    .as_ref()
}

/// State from `sc query` output, English or Spanish.
pub fn parse_sc_state(output: &str) -> ServiceState {
    let Some(re) = sc_state_regex() else {
        return ServiceState::Unknown;
    };
    for line in output.lines() {
        if let Some(caps) = re.captures(line) {
            return match caps[1].to_ascii_uppercase().as_str() {
                "RUNNING" => ServiceState::Running,
                "STOPPED" => ServiceState::Stopped,
                _ => ServiceState::Transitioning,
            };
        }
    }
    ServiceState::Unknown
}

/// State from `systemctl is-active` output.
pub fn parse_systemctl_state(output: &str) -> ServiceState {
    match output.trim().to_ascii_lowercase().as_str() {
        "active" => ServiceState::Running,
        "inactive" | "failed" => ServiceState::Stopped,
        "activating" | "deactivating" | "reloading" => ServiceState::Transitioning,
        _ => ServiceState::Unknown,
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Windows service control through `net`, `sc` and `taskkill`.
#[derive(Debug, Default)]
pub struct ScServiceControl;

#[async_trait]
impl ServiceControl for ScServiceControl {
    async fn query_state(&self, service: &str) -> Result<ServiceState, ServiceError> {
        let out = run_cmd_with_timeout("sc", &args(&["query", service]), CMD_TIMEOUT, "sc_query").await?;
        let text = out.combined();
        // 1060: the specified service does not exist
        if !out.success() && text.contains("1060") {
            return Err(ServiceError::NotInstalled(service.to_string()));
        }
        let state = parse_sc_state(&text);
        debug!(
            "[PHASE: service] [STEP: query] sc query (service={}, state={:?})",
            service, state
        );
        Ok(state)
    }

    async fn request_stop(&self, service: &str) -> Result<(), ServiceError> {
        let out = run_cmd_with_timeout("net", &args(&["stop", service, "/y"]), CMD_TIMEOUT, "net_stop").await?;
        if !out.success() {
            // Already stopped or a dependency refused; polling decides.
            warn!(
                "[PHASE: service] [STEP: stop] net stop returned exit_code={:?}: {}",
                out.exit_code,
                out.combined()
            );
        }
        Ok(())
    }

    async fn force_stop(&self, service: &str) -> Result<(), ServiceError> {
        let out = run_cmd_with_timeout("sc", &args(&["stop", service]), CMD_TIMEOUT, "sc_stop").await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: service] [STEP: stop] sc stop failed (exit_code={:?}); killing the service process",
            out.exit_code
        );
        let filter = format!("SERVICES eq {}", service);
        let kill = run_cmd_with_timeout(
            "taskkill",
            &args(&["/F", "/FI", &filter]),
            CMD_TIMEOUT,
            "taskkill_service",
        )
        .await?;
        if !kill.success() {
            return Err(ServiceError::Command(format!(
                "taskkill failed (exit_code={:?}): {}",
                kill.exit_code,
                kill.combined()
            )));
        }
        Ok(())
    }

    async fn request_start(&self, service: &str) -> Result<(), ServiceError> {
        let out = run_cmd_with_timeout("net", &args(&["start", service]), CMD_TIMEOUT, "net_start").await?;
        if out.success() {
            return Ok(());
        }
        let sc = run_cmd_with_timeout("sc", &args(&["start", service]), CMD_TIMEOUT, "sc_start").await?;
        if !sc.success() {
            warn!(
                "[PHASE: service] [STEP: start] sc start returned exit_code={:?}: {}",
                sc.exit_code,
                sc.combined()
            );
        }
        Ok(())
    }
}

/// Linux control of the `mssql-server` unit. Falls back to `sudo -n` when systemctl is refused.
#[derive(Debug, Default)]
pub struct SystemdServiceControl;

impl SystemdServiceControl {
    async fn systemctl(&self, verb_args: &[&str], operation: &str) -> Result<(), ServiceError> {
        let mut base = args(verb_args);
        base.push("--no-pager".to_string());

        let out = run_cmd_with_timeout("systemctl", &base, CMD_TIMEOUT, operation).await?;
        if out.success() {
            return Ok(());
        }

        let text = out.combined().to_ascii_lowercase();
        let denied = text.contains("access denied") || text.contains("authentication");
        if denied && which::which("sudo").is_ok() {
            info!(
                "[PHASE: service] [STEP: systemctl] retrying via sudo -n (operation={})",
                operation
            );
            let mut with_sudo = vec!["-n".to_string(), "systemctl".to_string()];
            with_sudo.extend(base);
            let out = run_cmd_with_timeout("sudo", &with_sudo, CMD_TIMEOUT, operation).await?;
            if out.success() {
                return Ok(());
            }
            return Err(ServiceError::Command(format!(
                "sudo systemctl {} failed (exit_code={:?}): {}",
                operation,
                out.exit_code,
                out.combined()
            )));
        }

        Err(ServiceError::Command(format!(
            "systemctl {} failed (exit_code={:?}): {}",
            operation,
            out.exit_code,
            out.combined()
        )))
    }
}

#[async_trait]
impl ServiceControl for SystemdServiceControl {
    async fn query_state(&self, service: &str) -> Result<ServiceState, ServiceError> {
        // is-active exits non-zero for anything but "active"; the text is what matters.
        let out = run_cmd_with_timeout(
            "systemctl",
            &args(&["is-active", "--no-pager", service]),
            CMD_TIMEOUT,
            "systemctl_is_active",
        )
        .await?;
        Ok(parse_systemctl_state(&out.stdout))
    }

    async fn request_stop(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl(&["stop", "--no-block", service], "stop").await
    }

    async fn force_stop(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl(&["kill", "--signal=SIGKILL", service], "kill").await
    }

    async fn request_start(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl(&["start", "--no-block", service], "start").await
    }
}

/// Platform service control and the service name to drive.
pub fn platform_service_control(
    instance: &str,
    explicit_name: Option<&str>,
) -> (Box<dyn ServiceControl>, String) {
    if cfg!(windows) {
        let name = explicit_name
            .map(str::to_string)
            .unwrap_or_else(|| service_name_from_instance(instance));
        (Box::new(ScServiceControl), name)
    } else {
        let name = explicit_name.unwrap_or(LINUX_SERVICE_UNIT).to_string();
        (Box::new(SystemdServiceControl), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_derivation() {
        assert_eq!(service_name_from_instance("SRV01\\COMPAC"), "MSSQL$COMPAC");
        assert_eq!(service_name_from_instance("SRV01\\ COMPAC "), "MSSQL$COMPAC");
        assert_eq!(service_name_from_instance("SRV01\\"), "MSSQLSERVER");
        assert_eq!(service_name_from_instance("SRV01\\mssqlserver"), "MSSQLSERVER");
        assert_eq!(service_name_from_instance("MSSQL$COMPAC"), "MSSQL$COMPAC");
        assert_eq!(service_name_from_instance("MSSQLSERVER"), "MSSQLSERVER");
        assert_eq!(service_name_from_instance("localhost"), "MSSQLSERVER");
        assert_eq!(service_name_from_instance(""), "MSSQLSERVER");
    }

    #[test]
    fn parse_sc_state_english() {
        let out = "SERVICE_NAME: MSSQL$COMPAC\n        TYPE               : 10  WIN32_OWN_PROCESS\n        STATE              : 4  RUNNING\n                                (STOPPABLE, PAUSABLE, ACCEPTS_SHUTDOWN)\n";
        assert_eq!(parse_sc_state(out), ServiceState::Running);

        let out = "        STATE              : 1  STOPPED\n";
        assert_eq!(parse_sc_state(out), ServiceState::Stopped);
    }

    #[test]
    fn parse_sc_state_spanish_and_pending() {
        let out = "NOMBRE_SERVICIO: MSSQL$COMPAC\n        ESTADO             : 3  STOP_PENDING\n";
        assert_eq!(parse_sc_state(out), ServiceState::Transitioning);
        let out = "        Estado             : 2  START_PENDING\n";
        assert_eq!(parse_sc_state(out), ServiceState::Transitioning);
    }

    #[test]
    fn parse_sc_state_unknown_output() {
        assert_eq!(parse_sc_state(""), ServiceState::Unknown);
        assert_eq!(
            parse_sc_state("[SC] OpenService FAILED 1060:"),
            ServiceState::Unknown
        );
    }

    #[test]
    fn parse_systemctl_states() {
        assert_eq!(parse_systemctl_state("active\n"), ServiceState::Running);
        assert_eq!(parse_systemctl_state("inactive"), ServiceState::Stopped);
        assert_eq!(parse_systemctl_state("failed"), ServiceState::Stopped);
        assert_eq!(parse_systemctl_state("deactivating"), ServiceState::Transitioning);
        assert_eq!(parse_systemctl_state("unknown"), ServiceState::Unknown);
    }
}
