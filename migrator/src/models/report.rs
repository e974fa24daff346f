// Final migration report.
//
// Always producible: an aborted run or a run with zero attaches still yields a report that
// lists every failure by name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::outcome::{AttachOutcome, AttachStatus, DiscoveryStatus, Domain};
use crate::transfer::TransferSummary;

/// Attach results for one group (catalogs, one tenant domain, or the orphan pass).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub attached: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub outcomes: Vec<AttachOutcome>,
}

impl GroupReport {
    pub fn record(&mut self, outcome: AttachOutcome) {
        let name = outcome.logical_name.clone();
        match &outcome.status {
            s if s.is_attached() => self.attached.push(name),
            AttachStatus::Skipped(_) => self.skipped.push(name),
            _ => self.failed.push(name),
        }
        self.outcomes.push(outcome);
    }

    /// Records a name for which no data file could be resolved.
    pub fn record_unresolved(&mut self, logical_name: &str) {
        self.skipped.push(logical_name.to_string());
    }

    pub fn status_of(&self, logical_name: &str) -> Option<&AttachStatus> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.logical_name.eq_ignore_ascii_case(logical_name))
            .map(|o| &o.status)
    }

    pub fn is_attached(&self, logical_name: &str) -> bool {
        self.attached
            .iter()
            .any(|n| n.eq_ignore_ascii_case(logical_name))
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// A per-database failure from normalization, integrity checking or verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseIssue {
    pub database: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub compatibility_level: Option<u16>,
    pub normalized: Vec<String>,
    pub normalization_failures: Vec<DatabaseIssue>,
    pub integrity_checked: Vec<String>,
    pub integrity_failures: Vec<DatabaseIssue>,
    pub verification_issues: Vec<DatabaseIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub session_id: String,
    pub instance: String,
    pub destination: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferSummary>,
    pub catalogs: GroupReport,
    pub discovery: BTreeMap<Domain, DiscoveryStatus>,
    pub tenants: BTreeMap<Domain, GroupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphans: Option<GroupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl MigrationReport {
    pub fn new(session_id: &str, instance: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            instance: instance.to_string(),
            destination: None,
            started_at: Utc::now(),
            finished_at: None,
            transfer: None,
            catalogs: GroupReport::default(),
            discovery: BTreeMap::new(),
            tenants: BTreeMap::new(),
            orphans: None,
            maintenance: None,
            aborted: None,
        }
    }

    /// Groups in display order: catalogs, each tenant domain, orphans.
    pub fn groups(&self) -> Vec<(String, &GroupReport)> {
        let mut out = vec![("Catalogs".to_string(), &self.catalogs)];
        for (domain, group) in &self.tenants {
            out.push((domain.label().to_string(), group));
        }
        if let Some(orphans) = &self.orphans {
            out.push(("Orphans".to_string(), orphans));
        }
        out
    }

    pub fn total_attached(&self) -> usize {
        self.groups().iter().map(|(_, g)| g.attached.len()).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.groups().iter().map(|(_, g)| g.failed.len()).sum()
    }

    /// Human-readable summary, one block per group.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Summary (session {})", self.session_id);
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "  ABORTED: {}", reason);
        }
        if let Some(t) = &self.transfer {
            let _ = writeln!(
                out,
                "  Transfer: copied={} skipped={} errors={}",
                t.copied, t.skipped, t.errors
            );
            if let Some(failure) = &t.failure {
                let _ = writeln!(out, "  Transfer failed: {}", failure);
            }
        }
        for (label, group) in self.groups() {
            let _ = writeln!(
                out,
                "{}: OK={}  FAIL={}  SKIPPED={}",
                label,
                group.attached.len(),
                group.failed.len(),
                group.skipped.len()
            );
            if !group.attached.is_empty() {
                let _ = writeln!(out, "   OK:      {}", sorted_join(&group.attached));
            }
            if !group.failed.is_empty() {
                let _ = writeln!(out, "   FAIL:    {}", sorted_join(&group.failed));
            }
            if !group.skipped.is_empty() {
                let _ = writeln!(out, "   SKIPPED: {}", sorted_join(&group.skipped));
            }
        }
        for (domain, status) in &self.discovery {
            match status {
                DiscoveryStatus::Discovered(_) => {}
                other => {
                    let _ = writeln!(out, "Discovery {}: {:?}", domain.label(), other);
                }
            }
        }
        if let Some(m) = &self.maintenance {
            if let Some(level) = m.compatibility_level {
                let _ = writeln!(
                    out,
                    "Normalization: {} databases at compatibility {}",
                    m.normalized.len(),
                    level
                );
            }
            for issue in m
                .normalization_failures
                .iter()
                .chain(&m.integrity_failures)
                .chain(&m.verification_issues)
            {
                let _ = writeln!(out, "   [{}] {}", issue.database, issue.detail);
            }
        }
        out
    }
}

fn sorted_join(names: &[String]) -> String {
    let mut v: Vec<&str> = names.iter().map(String::as_str).collect();
    v.sort_by_key(|n| n.to_lowercase());
    v.join(", ")
}
