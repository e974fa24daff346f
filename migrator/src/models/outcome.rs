use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An attach target: the name a set of data files should appear under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalDatabase {
    pub canonical_name: String,
    #[serde(default)]
    pub alternate_names: Vec<String>,
}

impl LogicalDatabase {
    pub fn new(canonical_name: impl Into<String>) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            alternate_names: Vec::new(),
        }
    }

    pub fn with_alternates(canonical_name: &str, alternates: &[&str]) -> Self {
        Self {
            canonical_name: canonical_name.to_string(),
            alternate_names: alternates.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Canonical name first, then alternates in declaration order.
    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_name.as_str())
            .chain(self.alternate_names.iter().map(String::as_str))
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.all_names().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Terminal status of one attach attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum AttachStatus {
    AlreadyAttached,
    AttachedTwoFile,
    AttachedRebuildLog,
    Skipped(String),
    Failed(String),
}

impl AttachStatus {
    /// True when the database is live after this attempt.
    pub fn is_attached(&self) -> bool {
        matches!(
            self,
            AttachStatus::AlreadyAttached
                | AttachStatus::AttachedTwoFile
                | AttachStatus::AttachedRebuildLog
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttachStatus::AlreadyAttached => "already attached",
            AttachStatus::AttachedTwoFile => "attached",
            AttachStatus::AttachedRebuildLog => "attached (log rebuilt)",
            AttachStatus::Skipped(_) => "skipped",
            AttachStatus::Failed(_) => "failed",
        }
    }
}

/// Result of one attach attempt. Immutable once created.
///
/// `primary_file` is `None` only for `AlreadyAttached` outcomes where the database was live
/// and no file had to be resolved for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOutcome {
    pub logical_name: String,
    pub primary_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub status: AttachStatus,
}

impl AttachOutcome {
    pub fn new(
        logical_name: &str,
        primary_file: PathBuf,
        log_file: Option<PathBuf>,
        status: AttachStatus,
    ) -> Self {
        Self {
            logical_name: logical_name.to_string(),
            primary_file: Some(primary_file),
            log_file,
            status,
        }
    }

    pub fn already_attached(logical_name: &str, primary_file: Option<PathBuf>) -> Self {
        Self {
            logical_name: logical_name.to_string(),
            primary_file,
            log_file: None,
            status: AttachStatus::AlreadyAttached,
        }
    }
}

/// Tenant-database family managed by one catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Domain {
    Accounting,
    Payroll,
    Commercial,
    DocumentDirectory,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Accounting,
        Domain::Payroll,
        Domain::Commercial,
        Domain::DocumentDirectory,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Domain::Accounting => "Accounting",
            Domain::Payroll => "Payroll",
            Domain::Commercial => "Commercial",
            Domain::DocumentDirectory => "DocumentDirectory",
        }
    }
}

/// How discovery went for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum DiscoveryStatus {
    Discovered(usize),
    /// The catalog is not live under any of its names.
    CatalogUnavailable,
    /// The catalog is live but the expected table or column is missing.
    SchemaMismatch(String),
    QueryFailed(String),
}

/// Deduplicated tenant names discovered in one catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasGroup {
    pub source_catalog: String,
    pub domain: Domain,
    /// Keyed by lowercase name; value keeps the first spelling seen.
    names: BTreeMap<String, String>,
    pub status: DiscoveryStatus,
}

impl AliasGroup {
    pub fn new(source_catalog: &str, domain: Domain) -> Self {
        Self {
            source_catalog: source_catalog.to_string(),
            domain,
            names: BTreeMap::new(),
            status: DiscoveryStatus::Discovered(0),
        }
    }

    pub fn unavailable(source_catalog: &str, domain: Domain, status: DiscoveryStatus) -> Self {
        Self {
            status,
            ..Self::new(source_catalog, domain)
        }
    }

    /// Trim and insert; blanks and case-insensitive duplicates are dropped.
    /// Returns true if the name was new.
    pub fn insert(&mut self, raw: &str) -> bool {
        let name = raw.trim();
        if name.is_empty() {
            return false;
        }
        let key = name.to_lowercase();
        if self.names.contains_key(&key) {
            return false;
        }
        self.names.insert(key, name.to_string());
        if let DiscoveryStatus::Discovered(n) = &mut self.status {
            *n = self.names.len();
        }
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
