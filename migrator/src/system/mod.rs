// Operating-system plumbing: external commands and engine service control.
//
// Commands are short control verbs (sc, net, systemctl). Arguments are masked before logging.

pub mod lifecycle;
pub mod service;

use anyhow::{Context, Result};
use log::{debug, error, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::utils::logging::mask_arg_for_log;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined, the way console tools interleave them for a reader.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

/// Spawn/wait failures worth another attempt. A non-zero exit is never one of them.
fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    ["timed out", "temporarily", "busy", "interrupted"]
        .iter()
        .any(|needle| msg.contains(needle))
}

fn masked_args(args: &[String]) -> String {
    args.iter()
        .map(|a| mask_arg_for_log(a))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn exec_once(program: &str, args: &[String], limit: Duration, operation: &str) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: system] [STEP: {}] exec {} {} (timeout_ms={})",
        operation,
        program,
        masked_args(args),
        limit.as_millis()
    );

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("{}: failed to spawn {}", operation, program))?;

    // On timeout the wait future is dropped with the child, which kills it.
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("{}: wait failed for {}", operation, program))?,
        Err(_) => anyhow::bail!("{}: {} timed out after {}ms", operation, program, limit.as_millis()),
    };

    let out = CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: started.elapsed().as_millis(),
    };
    debug!(
        "[PHASE: system] [STEP: {}] exit (exit_code={:?}, duration_ms={})",
        operation, out.exit_code, out.duration_ms
    );
    Ok(out)
}

/// Run a service-control command with a timeout, retrying transient spawn/wait failures.
///
/// Output is returned for any exit code; callers interpret it.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    limit: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(
        strategy,
        || exec_once(program, args, limit, operation),
        |e: &anyhow::Error| {
            let transient = is_transient_exec_error(e);
            if transient {
                warn!("[PHASE: system] [STEP: {}] retrying after: {:#}", operation, e);
            }
            transient
        },
    )
    .await;

    if let Err(e) = &result {
        error!("[PHASE: system] [STEP: {}] {} failed: {:#}", operation, program, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_cmd_with_timeout_basic_smoke() {
        #[cfg(windows)]
        let (program, args) = ("cmd", vec!["/C".to_string(), "echo hello".to_string()]);
        #[cfg(not(windows))]
        let (program, args) = ("sh", vec!["-c".to_string(), "echo hello".to_string()]);

        let out = run_cmd_with_timeout(program, &args, Duration::from_secs(5), "test_echo")
            .await
            .expect("command should run");
        assert!(out.success());
        assert!(out.duration_ms < 5_000);
        assert!(out.combined().to_ascii_lowercase().contains("hello"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn non_zero_exit_is_returned_not_raised() {
        let args = vec!["-c".to_string(), "echo nope >&2; exit 3".to_string()];
        let out = run_cmd_with_timeout("sh", &args, Duration::from_secs(5), "test_exit")
            .await
            .expect("command should run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.combined(), "nope");
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_exec_error(&anyhow::anyhow!("sc_query: sc timed out after 10ms")));
        assert!(is_transient_exec_error(&anyhow::anyhow!("Resource temporarily unavailable")));
        assert!(!is_transient_exec_error(&anyhow::anyhow!("No such file or directory")));
    }

    #[tokio::test]
    async fn missing_program_fails_without_retrying() {
        let err = run_cmd_with_timeout("definitely-not-a-real-binary", &[], Duration::from_secs(1), "test_missing")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("failed to spawn"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn slow_command_is_killed_at_the_limit() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let started = Instant::now();
        let err = run_cmd_with_timeout("sh", &args, Duration::from_millis(100), "test_slow")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
