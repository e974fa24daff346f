// Error taxonomy for a migration session.
//
// Per-database failures (NotFound, PreflightFailed, AttachFailed, DiscoveryQueryFailed) are
// recorded in the report and never abort sibling work. ServiceTimeout, Connection and
// Cancelled abort the remaining pipeline; the report is still produced.

use thiserror::Error;

use crate::database::engine::EngineError;
use crate::system::service::ServiceState;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("no data file found for '{logical_name}'")]
    NotFound { logical_name: String },

    #[error("preflight failed for '{logical_name}': {detail}")]
    PreflightFailed {
        logical_name: String,
        detail: String,
    },

    #[error("attach failed for '{logical_name}': {source}")]
    AttachFailed {
        logical_name: String,
        #[source]
        source: EngineError,
    },

    #[error("service '{service}' did not reach {target:?} in time (last state: {last_state:?})")]
    ServiceTimeout {
        service: String,
        target: ServiceState,
        last_state: ServiceState,
    },

    #[error("discovery query failed against '{catalog}': {detail}")]
    DiscoveryQueryFailed { catalog: String, detail: String },

    #[error("unable to connect to the database engine: {0}")]
    Connection(String),

    #[error("invalid settings: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("migration cancelled")]
    Cancelled,
}

impl MigrationError {
    /// Errors that stop the remaining pipeline stages.
    pub fn aborts_pipeline(&self) -> bool {
        matches!(
            self,
            MigrationError::ServiceTimeout { .. }
                | MigrationError::Connection(_)
                | MigrationError::Cancelled
        )
    }
}
