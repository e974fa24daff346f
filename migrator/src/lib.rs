// Attach Migrator
// Library entry point: logging setup and the command-line driver.

pub mod attach;
pub mod database;
pub mod error;
pub mod maintenance;
pub mod models;
pub mod orchestrator;
pub mod settings;
pub mod system;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;

use log::{error, info, warn};
use std::path::PathBuf;

use crate::database::connection::TiberiusConnector;
use crate::models::MigrationReport;
use crate::orchestrator::MigrationSession;
use crate::system::service::platform_service_control;
use crate::utils::ConsoleSink;

pub use crate::error::MigrationError;
pub use crate::settings::MigrationSettings;

/// Exit codes of the command-line driver.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const COMPLETED_WITH_FAILURES: i32 = 1;
    pub const ABORTED: i32 = 2;
    pub const INVALID_SETTINGS: i32 = 3;
}

/// Initialize logging with dual format (JSON + human-readable).
pub fn init_logging(with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder()?;
    std::fs::create_dir_all(&log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("attach-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("attach-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Parsed command-line flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    pub with_stdout: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config: None,
            report_json: None,
            with_stdout: true,
        }
    }
}

fn flag_value(arg: &str, flag: &str) -> Option<PathBuf> {
    arg.strip_prefix(flag)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse `--config=PATH`, `--report-json=PATH` and `--no-stdout-log`. Unknown flags are ignored.
pub fn parse_cli_args(args: &[String]) -> CliOptions {
    let mut opts = CliOptions::default();
    for arg in args.iter().skip(1) {
        if arg == "--no-stdout-log" {
            opts.with_stdout = false;
        } else if let Some(v) = flag_value(arg, "--config=") {
            opts.config = Some(v);
        } else if let Some(v) = flag_value(arg, "--report-json=") {
            opts.report_json = Some(v);
        }
    }
    opts
}

/// Exit code for a finished session.
pub fn exit_code_for(report: &MigrationReport) -> i32 {
    if report.aborted.is_some() {
        exit_code::ABORTED
    } else if report.total_failed() > 0 {
        exit_code::COMPLETED_WITH_FAILURES
    } else {
        exit_code::OK
    }
}

fn write_report_json(path: &std::path::Path, report: &MigrationReport) -> anyhow::Result<()> {
    use anyhow::Context;
    let bytes = serde_json::to_vec_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, bytes).with_context(|| format!("Failed to write report {:?}", path))
}

/// Command-line driver: load settings, run one session, print the summary.
pub fn run_cli(args: &[String]) -> i32 {
    let opts = parse_cli_args(args);
    if let Err(e) = init_logging(opts.with_stdout) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let settings = match settings::load(opts.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: settings] {:#}", e);
            eprintln!("Invalid settings: {:#}", e);
            return exit_code::INVALID_SETTINGS;
        }
    };
    info!(
        "[PHASE: initialization] [STEP: settings] instance={}, transfer={:?}, destination={:?}",
        settings.instance, settings.transfer_mode, settings.destination_dir
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let rt = match rt {
        Ok(rt) => rt,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: runtime] {}", e);
            eprintln!("Failed to create async runtime: {}", e);
            return exit_code::ABORTED;
        }
    };

    let report = rt.block_on(async {
        let (service, service_name) =
            platform_service_control(&settings.instance, settings.service_name.as_deref());
        let connector = TiberiusConnector::from_settings(&settings);
        let sink = ConsoleSink::new();
        let session = MigrationSession::new(settings, &connector, service.as_ref(), service_name, &sink);

        let cancel = session.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[PHASE: session] [STEP: signal] interrupt received; finishing the current stage");
                cancel.cancel();
            }
        });

        session.run().await
    });

    println!("{}", report.render_text());
    if let Some(path) = &opts.report_json {
        if let Err(e) = write_report_json(path, &report) {
            error!("[PHASE: report] [STEP: json] {:#}", e);
            eprintln!("{:#}", e);
        }
    }
    exit_code_for(&report)
}
