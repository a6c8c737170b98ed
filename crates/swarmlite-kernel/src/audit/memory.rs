//! In-memory implementation of `AuditLog`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::signing::{HmacSigner, ZERO_HASH};

use super::{
    record_canonical, sign_record, verify_records, AuditEntry, AuditError, AuditLog,
    AuditRecord,
};

#[derive(Default)]
struct Inner {
    records: Vec<AuditRecord>,
    heads: HashMap<String, String>,
}

/// In-memory signed audit log
pub struct InMemoryAuditLog {
    signer: HmacSigner,
    inner: Mutex<Inner>,
}

impl InMemoryAuditLog {
    pub fn new(signer: HmacSigner) -> Self {
        Self {
            signer,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Total records across all workflows
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Overwrite a record's signature with zeros (for testing chain
    /// verification failures)
    pub fn tamper_signature(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.iter_mut().find(|r| r.seq == seq) {
            record.signature = ZERO_HASH.to_string();
        }
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut inner = self.inner.lock();

        let seq = inner.records.len() as u64 + 1;
        let prev_hash = inner
            .heads
            .get(&entry.workflow_id)
            .cloned()
            .unwrap_or_else(|| ZERO_HASH.to_string());

        let mut record = AuditRecord {
            seq,
            workflow_id: entry.workflow_id,
            task_id: entry.task_id,
            event: entry.event,
            from_state: entry.from_state,
            to_state: entry.to_state,
            timestamp: Utc::now(),
            prev_hash,
            signature: String::new(),
        };
        sign_record(&self.signer, &mut record);

        inner
            .heads
            .insert(record.workflow_id.clone(), record.signature.clone());
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn records(&self, workflow_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn verify_chain(&self, workflow_id: &str) -> Result<usize, AuditError> {
        let records = self.records(workflow_id).await?;
        verify_records(&self.signer, &records)
    }
}
