// SQL Server access: connection, engine capability trait and statement builders.

pub mod connection;
pub mod engine;
pub mod statements;

pub use connection::{connect_with_retry, ConnectError, EngineConnector, TiberiusConnector};
pub use engine::{DatabaseState, EngineError, SqlEngine, TiberiusEngine};
