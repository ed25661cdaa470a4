//! ceremony audit trail
//!
//! one report per ceremony attempt, success or not. reports carry ids,
//! indices and outcomes only; never messages, shares or capabilities.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ceremony::{CeremonyId, CeremonyKind, CeremonyPhase, KeyId};

/// how one ceremony attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum CeremonyOutcome {
    Completed,
    /// internal error text, never shown to clients
    Failed(String),
}

impl CeremonyOutcome {
    pub fn reason(&self) -> Option<&str> {
        match self {
            CeremonyOutcome::Completed => None,
            CeremonyOutcome::Failed(reason) => Some(reason),
        }
    }
}

impl core::fmt::Display for CeremonyOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CeremonyOutcome::Completed => f.write_str("completed"),
            CeremonyOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyReport {
    pub ceremony_id: CeremonyId,
    pub kind: CeremonyKind,
    pub key_id: KeyId,
    /// caller-supplied client label, if any
    pub client: Option<String>,
    /// 1-based attempt number within one request
    pub attempt: u32,
    pub phase_reached: CeremonyPhase,
    pub outcome: CeremonyOutcome,
    pub participants: Vec<u32>,
    pub culprits: Vec<u32>,
    /// domains that did not confirm their wipe
    pub unconfirmed_wipes: Vec<String>,
    pub duration_ms: u64,
}

impl CeremonyReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, CeremonyOutcome::Completed)
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, report: &CeremonyReport);
}

/// emits reports as structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, r: &CeremonyReport) {
        if r.succeeded() && r.unconfirmed_wipes.is_empty() {
            info!(
                ceremony_id = %r.ceremony_id,
                kind = ?r.kind,
                key_id = %r.key_id,
                client = r.client.as_deref().unwrap_or("-"),
                attempt = r.attempt,
                phase = %r.phase_reached,
                participants = ?r.participants,
                duration_ms = r.duration_ms,
                "ceremony complete"
            );
        } else {
            warn!(
                ceremony_id = %r.ceremony_id,
                kind = ?r.kind,
                key_id = %r.key_id,
                client = r.client.as_deref().unwrap_or("-"),
                attempt = r.attempt,
                phase = %r.phase_reached,
                outcome = %r.outcome,
                participants = ?r.participants,
                culprits = ?r.culprits,
                unconfirmed_wipes = ?r.unconfirmed_wipes,
                duration_ms = r.duration_ms,
                "ceremony failed"
            );
        }
    }
}

/// keeps reports in memory, for tests and the cli demo
#[derive(Debug, Default)]
pub struct MemoryAudit {
    reports: Mutex<Vec<CeremonyReport>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<CeremonyReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, report: &CeremonyReport) {
        let mut reports = match self.reports.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        reports.push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: CeremonyOutcome) -> CeremonyReport {
        CeremonyReport {
            ceremony_id: CeremonyId::random(),
            kind: CeremonyKind::Signing,
            key_id: KeyId::random(),
            client: Some("wallet".into()),
            attempt: 1,
            phase_reached: CeremonyPhase::Wiped,
            outcome,
            participants: vec![1, 2],
            culprits: vec![],
            unconfirmed_wipes: vec![],
            duration_ms: 12,
        }
    }

    #[test]
    fn test_memory_audit_records() {
        let audit = MemoryAudit::new();
        audit.record(&report(CeremonyOutcome::Completed));
        audit.record(&report(CeremonyOutcome::Failed("timeout".into())));
        let reports = audit.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].succeeded());
        assert!(!reports[1].succeeded());
        assert_eq!(reports[1].outcome.reason(), Some("timeout"));
    }

    #[test]
    fn test_report_serializes_without_secrets() {
        let json = serde_json::to_string(&report(CeremonyOutcome::Completed)).unwrap();
        assert!(json.contains("\"kind\":\"signing\""));
        assert!(json.contains("\"phase_reached\":\"wiped\""));
        assert!(json.contains("\"outcome\":{\"status\":\"completed\"}"));

        let failed = report(CeremonyOutcome::Failed("round timed out".into()));
        let json = serde_json::to_string(&failed).unwrap();
        let back: CeremonyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcome, failed.outcome);
    }
}
