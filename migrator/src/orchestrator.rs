// Migration session
//
// Stage order: (transfer requested) service stop → transfer → service start; connect; catalogs;
// discovery; tenants (+ orphan pass); maintenance. Cancellation is honored between stages only.
// Whatever happens, `run` returns a report.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::attach::indexer::IndexSource;
use crate::attach::{
    attach_catalogs, attach_orphans, attach_tenants, catalogs_from_settings, discover_aliases,
    orphan_pass_needed, AttachEngine, FileIndex,
};
use crate::database::connection::{connect_with_retry, EngineConnector};
use crate::database::engine::SqlEngine;
use crate::error::MigrationError;
use crate::maintenance::{run_maintenance, MaintenanceOptions};
use crate::models::MigrationReport;
use crate::settings::{MigrationSettings, TransferMode};
use crate::system::lifecycle::ServiceLifecycleController;
use crate::system::service::ServiceControl;
use crate::transfer::{run_transfer, TransferSummary};
use crate::utils::LogSink;

pub struct MigrationSession<'a, C: EngineConnector + ?Sized> {
    settings: MigrationSettings,
    connector: &'a C,
    service: &'a dyn ServiceControl,
    service_name: String,
    sink: &'a dyn LogSink,
    cancel: CancellationToken,
    session_id: String,
}

impl<'a, C: EngineConnector + ?Sized> MigrationSession<'a, C> {
    pub fn new(
        settings: MigrationSettings,
        connector: &'a C,
        service: &'a dyn ServiceControl,
        service_name: impl Into<String>,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            settings,
            connector,
            service,
            service_name: service_name.into(),
            sink,
            cancel: CancellationToken::new(),
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run every stage and return the report. Never fails.
    pub async fn run(&self) -> MigrationReport {
        let started = Instant::now();
        info!(
            "[PHASE: session] [STEP: run] entered (session_id={}, instance={}, transfer={:?})",
            self.session_id, self.settings.instance, self.settings.transfer_mode
        );
        let mut report = MigrationReport::new(&self.session_id, &self.settings.instance);

        if let Err(e) = self.run_stages(&mut report).await {
            let reason = match &e {
                MigrationError::Cancelled => "cancelled".to_string(),
                other => other.to_string(),
            };
            error!(
                "[PHASE: session] [STEP: run] aborted (session_id={}): {}",
                self.session_id, reason
            );
            self.sink.error(&format!("Migration aborted: {}", reason));
            report.aborted = Some(reason);
        }
        report.finished_at = Some(Utc::now());

        info!(
            "[PHASE: session] [STEP: run] exit (session_id={}, attached={}, failed={}, aborted={}, duration_ms={})",
            self.session_id,
            report.total_attached(),
            report.total_failed(),
            report.aborted.is_some(),
            started.elapsed().as_millis()
        );
        report
    }

    fn checkpoint(&self, next_stage: &str) -> Result<(), MigrationError> {
        if self.cancel.is_cancelled() {
            warn!(
                "[PHASE: session] [STEP: {}] cancellation requested; stopping",
                next_stage
            );
            return Err(MigrationError::Cancelled);
        }
        debug!("[PHASE: session] [STEP: {}] entered", next_stage);
        Ok(())
    }

    async fn run_stages(&self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        self.settings.validate()?;

        if self.settings.transfer_mode != TransferMode::None {
            self.checkpoint("transfer")?;
            let dest = match &self.settings.destination_dir {
                Some(dir) => dir.clone(),
                None => self.detect_destination_before_transfer().await?,
            };
            report.destination = Some(dest.to_string_lossy().into_owned());
            report.transfer = Some(self.transfer_stage(&dest).await?);
        }

        self.checkpoint("connect")?;
        let mut engine = connect_with_retry(self.connector).await.map_err(|e| {
            error!("[PHASE: session] [STEP: connect] {}", e.internal_details);
            MigrationError::Connection(e.user_message)
        })?;
        let engine: &mut dyn SqlEngine = engine.as_mut();

        let destination = match self.settings.destination_dir.clone() {
            Some(dir) => Some(dir),
            None => detect_destination(engine).await,
        };
        let index = match &destination {
            Some(dir) => {
                report.destination = Some(dir.to_string_lossy().into_owned());
                self.sink.info(&format!("Indexing data files under {}", dir.display()));
                FileIndex::build(dir, engine).await
            }
            None => {
                warn!("[PHASE: session] [STEP: index] no destination directory could be determined");
                self.sink.warn("No data directory known; only live databases can be matched");
                FileIndex::from_paths(Path::new(""), IndexSource::Unavailable, Vec::<PathBuf>::new())
            }
        };

        let mut attacher = AttachEngine::new(self.settings.inspect_error_log_on_failure);
        let catalogs = catalogs_from_settings(self.settings.catalogs.as_deref());

        self.checkpoint("catalogs")?;
        report.catalogs = attach_catalogs(&mut attacher, engine, self.sink, &catalogs, &index).await;

        self.checkpoint("discovery")?;
        let groups = discover_aliases(&mut attacher, engine, self.sink, &catalogs).await;
        for group in &groups {
            report.discovery.insert(group.domain, group.status.clone());
        }

        self.checkpoint("tenants")?;
        report.tenants = attach_tenants(&mut attacher, engine, self.sink, &groups, &index).await;
        if orphan_pass_needed(&groups) {
            report.orphans = Some(attach_orphans(&mut attacher, engine, self.sink, &index, &catalogs).await);
        }

        self.checkpoint("maintenance")?;
        let options = MaintenanceOptions {
            integrity_check: self.settings.run_integrity_check,
            verify: self.settings.verify_after,
        };
        report.maintenance = Some(run_maintenance(engine, self.sink, options).await);
        Ok(())
    }

    /// The service is stopped during transfer, so the default data path is read up front.
    async fn detect_destination_before_transfer(&self) -> Result<PathBuf, MigrationError> {
        let mut engine = connect_with_retry(self.connector)
            .await
            .map_err(|e| MigrationError::Connection(e.user_message))?;
        detect_destination(engine.as_mut()).await.ok_or_else(|| {
            MigrationError::Config("no destination_dir configured and the instance reports no default data path".to_string())
        })
    }

    /// Stop → transfer → start. The service is restarted even when the transfer itself fails.
    async fn transfer_stage(&self, dest: &Path) -> Result<TransferSummary, MigrationError> {
        let lifecycle = ServiceLifecycleController::new(self.service, self.settings.service_poll_interval());
        let timeout = self.settings.service_timeout();

        if self.settings.manage_service {
            self.sink.info(&format!("Stopping service {}", self.service_name));
            lifecycle.stop(&self.service_name, timeout).await?;
        }

        let result = run_transfer(
            self.settings.transfer_mode,
            self.settings.source_dir.as_deref(),
            dest,
            self.settings.companies_dir.as_deref(),
            self.sink,
        )
        .await;

        if self.settings.manage_service {
            self.sink.info(&format!("Starting service {}", self.service_name));
            lifecycle.start(&self.service_name, timeout).await?;
        }

        match result {
            Ok(summary) => Ok(summary.unwrap_or_default()),
            Err(e) => {
                error!("[PHASE: transfer] [STEP: run] {:#}", e);
                self.sink.error(&format!("Transfer failed: {:#}", e));
                Ok(TransferSummary {
                    errors: 1,
                    failure: Some(format!("{:#}", e)),
                    ..TransferSummary::default()
                })
            }
        }
    }
}

/// The engine's default data directory, if it reports one.
async fn detect_destination(engine: &mut dyn SqlEngine) -> Option<PathBuf> {
    match engine.default_data_path().await {
        Ok(Some(path)) if !path.trim().is_empty() => {
            info!("[PHASE: session] [STEP: destination] default data path {}", path);
            Some(PathBuf::from(path.trim()))
        }
        Ok(_) => None,
        Err(e) => {
            warn!("[PHASE: session] [STEP: destination] default data path query failed: {}", e);
            None
        }
    }
}
