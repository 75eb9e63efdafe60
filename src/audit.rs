//! One audit record per request, written at its terminal transition.
//!
//! The proxy core hands every finished request to an [`AuditSink`].
//! [`TracingAuditSink`] writes structured `tracing` events under the
//! `watchtower::audit` target; [`MemoryAuditSink`] keeps records in
//! memory for tests and embedding.

use std::sync::Mutex;

use crate::logging::AUDIT_TARGET;
use crate::module::ModuleId;
use crate::proxy::pipeline::{Outcome, Stage};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub correlation_id: String,
    pub method: String,
    pub path: String,
    pub module: Option<ModuleId>,
    pub principal: Option<String>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

impl AuditRecord {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }

    #[must_use]
    pub const fn aborted_at(&self) -> Option<Stage> {
        match self.outcome {
            Outcome::Aborted { stage, .. } => Some(stage),
            Outcome::Completed => None,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let module = record.module.map_or("none", ModuleId::as_str);
        let principal = record.principal.as_deref().unwrap_or("none");
        match &record.outcome {
            Outcome::Completed => tracing::info!(
                target: AUDIT_TARGET,
                correlation_id = %record.correlation_id,
                method = %record.method,
                path = %record.path,
                module,
                principal,
                outcome = "completed",
                attempts = record.attempts,
                bytes = record.bytes,
                elapsed_ms = record.elapsed_ms,
                "request completed"
            ),
            Outcome::Aborted { stage, cause } => tracing::warn!(
                target: AUDIT_TARGET,
                correlation_id = %record.correlation_id,
                method = %record.method,
                path = %record.path,
                module,
                principal,
                outcome = "aborted",
                stage = %stage,
                cause = %cause,
                attempts = record.attempts,
                bytes = record.bytes,
                elapsed_ms = record.elapsed_ms,
                "request aborted"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.push(record.clone());
    }
}
