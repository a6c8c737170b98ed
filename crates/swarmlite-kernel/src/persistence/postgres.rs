//! PostgreSQL implementation of `StateStore` and `AuditLog`.
//!
//! Uses the layout from `migrations/`: `workflows` and `tasks` rows keyed
//! by `(workflow_id)` and `(workflow_id, task_id)`, plus the append-only
//! `audit` table. All queries are runtime-checked; compare-and-set is a
//! row-locking transaction so the signature can be recomputed atomically
//! with the status flip.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};

use crate::audit::{
    record_canonical, verify_records, AuditEntry, AuditError, AuditLog, AuditRecord,
};
use crate::signing::{HmacSigner, ZERO_HASH};
use crate::workflow::{TaskStatus, WorkflowStatus};

use super::encryption::FieldCipher;
use super::store::*;

/// PostgreSQL-backed state store and audit log
///
/// # Example
///
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// let store = PostgresStateStore::new(pool, signer, cipher);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
    signer: HmacSigner,
    cipher: Option<FieldCipher>,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool, signer: HmacSigner, cipher: Option<FieldCipher>) -> Self {
        Self {
            pool,
            signer,
            cipher,
        }
    }

    /// Run pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn require_cipher(&self, workflow_id: &str) -> Result<&FieldCipher, StoreError> {
        self.cipher
            .as_ref()
            .ok_or_else(|| StoreError::EncryptionRequired(workflow_id.to_string()))
    }

    fn seal_definition(&self, record: &WorkflowRecord) -> Result<Value, StoreError> {
        if !definition_is_sensitive(&record.definition) {
            return Ok(record.definition.clone());
        }
        let cipher = self.require_cipher(&record.workflow_id)?;
        let plaintext = serde_json::to_vec(&record.definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sealed = cipher
            .seal(&plaintext)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;
        Ok(Value::String(sealed))
    }

    fn unseal_definition(&self, workflow_id: &str, stored: Value) -> Result<Value, StoreError> {
        if let Value::String(s) = &stored {
            if FieldCipher::is_sealed(s) {
                let cipher = self.require_cipher(workflow_id)?;
                let plaintext = cipher
                    .open(s)
                    .map_err(|e| StoreError::Encryption(e.to_string()))?;
                return serde_json::from_slice(&plaintext)
                    .map_err(|e| StoreError::Serialization(e.to_string()));
            }
        }
        Ok(stored)
    }

    fn seal_task_error(&self, record: &TaskRecord) -> Result<Option<String>, StoreError> {
        match (&record.last_error, record.sensitive) {
            (Some(error), true) => {
                let cipher = self.require_cipher(&record.workflow_id)?;
                Ok(Some(
                    cipher
                        .seal_str(error)
                        .map_err(|e| StoreError::Encryption(e.to_string()))?,
                ))
            }
            (other, _) => Ok(other.clone()),
        }
    }

    fn unseal_task_error(
        &self,
        workflow_id: &str,
        stored: Option<String>,
    ) -> Result<Option<String>, StoreError> {
        match stored {
            Some(error) if FieldCipher::is_sealed(&error) => {
                let cipher = self.require_cipher(workflow_id)?;
                Ok(Some(
                    cipher
                        .open_str(&error)
                        .map_err(|e| StoreError::Encryption(e.to_string()))?,
                ))
            }
            other => Ok(other),
        }
    }

    fn workflow_from_row(&self, row: &PgRow) -> Result<(WorkflowRecord, String), StoreError> {
        let workflow_id: String = row
            .try_get("workflow_id")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let status: WorkflowStatus = status_raw
            .parse()
            .map_err(StoreError::Serialization)?;
        let definition_stored: Value = row
            .try_get("definition_blob")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let context: Value = row
            .try_get("context")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let context = serde_json::from_value(context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let signature: String = row
            .try_get("signature")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let record = WorkflowRecord {
            definition: self.unseal_definition(&workflow_id, definition_stored)?,
            workflow_id,
            status,
            idempotency_key: row
                .try_get("idempotency_key")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            last_error: row
                .try_get("last_error")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            context,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        };
        Ok((record, signature))
    }

    fn task_from_row(&self, row: &PgRow) -> Result<(TaskRecord, String), StoreError> {
        let workflow_id: String = row
            .try_get("workflow_id")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let status: TaskStatus = status_raw.parse().map_err(StoreError::Serialization)?;
        let attempt: i32 = row
            .try_get("attempt")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let last_error_stored: Option<String> = row
            .try_get("last_error")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let signature: String = row
            .try_get("signature")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let record = TaskRecord {
            last_error: self.unseal_task_error(&workflow_id, last_error_stored)?,
            workflow_id,
            task_id: row
                .try_get("task_id")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            status,
            attempt: attempt.max(0) as u32,
            sensitive: row
                .try_get("sensitive")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| StoreError::Database(e.to_string()))?,
            finished_at: row
                .try_get("finished_at")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        };
        Ok((record, signature))
    }

    fn verify_workflow(&self, record: &WorkflowRecord, signature: &str) -> Result<(), StoreError> {
        if self.signer.verify(&workflow_canonical(record), signature) {
            Ok(())
        } else {
            Err(StoreError::SignatureMismatch(record.workflow_id.clone()))
        }
    }

    fn verify_task(&self, record: &TaskRecord, signature: &str) -> Result<(), StoreError> {
        if self.signer.verify(&task_canonical(record), signature) {
            Ok(())
        } else {
            Err(StoreError::SignatureMismatch(format!(
                "{}/{}",
                record.workflow_id, record.task_id
            )))
        }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    #[instrument(skip(self, record), fields(workflow_id = %record.workflow_id))]
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        let signature = self.signer.sign(&workflow_canonical(record));
        let definition = self.seal_definition(record)?;
        let context = serde_json::to_value(&record.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflows
                (workflow_id, definition_blob, status, idempotency_key, last_error,
                 context, created_at, updated_at, signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (workflow_id) DO UPDATE SET
                definition_blob = EXCLUDED.definition_blob,
                status = EXCLUDED.status,
                idempotency_key = EXCLUDED.idempotency_key,
                last_error = EXCLUDED.last_error,
                context = EXCLUDED.context,
                updated_at = EXCLUDED.updated_at,
                signature = EXCLUDED.signature
            "#,
        )
        .bind(&record.workflow_id)
        .bind(&definition)
        .bind(record.status.to_string())
        .bind(&record.idempotency_key)
        .bind(&record.last_error)
        .bind(&context)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&signature)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to put workflow: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let (record, signature) = self.workflow_from_row(&row)?;
                self.verify_workflow(&record, &signature)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list_in_flight(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE status = 'running' ORDER BY workflow_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let (record, signature) = self.workflow_from_row(row)?;
            self.verify_workflow(&record, &signature)?;
            records.push(record);
        }
        Ok(records)
    }

    #[instrument(skip(self, record), fields(workflow_id = %record.workflow_id, task_id = %record.task_id))]
    async fn put_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let signature = self.signer.sign(&task_canonical(record));
        let last_error = self.seal_task_error(record)?;

        sqlx::query(
            r#"
            INSERT INTO tasks
                (workflow_id, task_id, status, attempt, last_error, sensitive,
                 started_at, finished_at, signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (workflow_id, task_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                last_error = EXCLUDED.last_error,
                sensitive = EXCLUDED.sensitive,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                signature = EXCLUDED.signature
            "#,
        )
        .bind(&record.workflow_id)
        .bind(&record.task_id)
        .bind(record.status.to_string())
        .bind(record.attempt as i32)
        .bind(&last_error)
        .bind(record.sensitive)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&signature)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to put task: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    async fn get_task(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE workflow_id = $1 AND task_id = $2")
            .bind(workflow_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let (record, signature) = self.task_from_row(&row)?;
                self.verify_task(&record, &signature)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY task_id")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let (record, signature) = self.task_from_row(row)?;
            self.verify_task(&record, &signature)?;
            records.push(record);
        }
        Ok(records)
    }

    async fn cas_task_status(
        &self,
        workflow_id: &str,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            "SELECT * FROM tasks WHERE workflow_id = $1 AND task_id = $2 FOR UPDATE",
        )
        .bind(workflow_id)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::TaskNotFound {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
        })?;

        let (mut record, signature) = self.task_from_row(&row)?;
        self.verify_task(&record, &signature)?;

        if record.status != expected {
            return Ok(false);
        }

        record.status = new;
        let signature = self.signer.sign(&task_canonical(&record));
        let last_error = self.seal_task_error(&record)?;

        sqlx::query(
            r#"
            UPDATE tasks SET status = $3, last_error = $4, signature = $5
            WHERE workflow_id = $1 AND task_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(task_id)
        .bind(record.status.to_string())
        .bind(&last_error)
        .bind(&signature)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(true)
    }
}

#[async_trait]
impl AuditLog for PostgresStateStore {
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM audit")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let prev_hash: Option<String> = sqlx::query_scalar(
            "SELECT signature FROM audit WHERE workflow_id = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(&entry.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut record = AuditRecord {
            seq: seq.max(1) as u64,
            workflow_id: entry.workflow_id,
            task_id: entry.task_id,
            event: entry.event,
            from_state: entry.from_state,
            to_state: entry.to_state,
            timestamp: chrono::Utc::now(),
            prev_hash: prev_hash.unwrap_or_else(|| ZERO_HASH.to_string()),
            signature: String::new(),
        };
        record.signature = self.signer.sign(&record_canonical(&record));

        sqlx::query(
            r#"
            INSERT INTO audit
                (seq, workflow_id, task_id, event, from_state, to_state,
                 timestamp, prev_hash, signature)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.seq as i64)
        .bind(&record.workflow_id)
        .bind(&record.task_id)
        .bind(record.event.to_string())
        .bind(&record.from_state)
        .bind(&record.to_state)
        .bind(record.timestamp)
        .bind(&record.prev_hash)
        .bind(&record.signature)
        .execute(&mut *tx)
        .await
        .map_err(|e| AuditError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(record)
    }

    async fn records(&self, workflow_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let rows = sqlx::query("SELECT * FROM audit WHERE workflow_id = $1 ORDER BY seq")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row
                .try_get("seq")
                .map_err(|e| AuditError::Database(e.to_string()))?;
            let event_raw: String = row
                .try_get("event")
                .map_err(|e| AuditError::Database(e.to_string()))?;
            records.push(AuditRecord {
                seq: seq.max(0) as u64,
                workflow_id: row
                    .try_get("workflow_id")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                task_id: row
                    .try_get("task_id")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                event: event_raw.parse().map_err(AuditError::Serialization)?,
                from_state: row
                    .try_get("from_state")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                to_state: row
                    .try_get("to_state")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                timestamp: row
                    .try_get("timestamp")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                prev_hash: row
                    .try_get("prev_hash")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
                signature: row
                    .try_get("signature")
                    .map_err(|e| AuditError::Database(e.to_string()))?,
            });
        }
        Ok(records)
    }

    async fn verify_chain(&self, workflow_id: &str) -> Result<usize, AuditError> {
        let records = self.records(workflow_id).await?;
        verify_records(&self.signer, &records)
    }
}
