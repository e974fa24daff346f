// Session data model: attach targets, per-attempt outcomes, discovered alias groups and the
// final report.

pub mod outcome;
pub mod report;

pub use outcome::{
    AliasGroup, AttachOutcome, AttachStatus, DiscoveryStatus, Domain, LogicalDatabase,
};
pub use report::{DatabaseIssue, GroupReport, MaintenanceReport, MigrationReport};
