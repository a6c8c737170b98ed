//! Durable state persistence: signed workflow and task rows.
//!
//! The state store is the sole source of truth for workflow and task
//! state. Every row carries an HMAC-SHA256 signature over its canonical
//! byte encoding; fields derived from sensitive tasks are encrypted at
//! rest. The scheduler mutates task status only through compare-and-set,
//! which keeps concurrent schedulers for the same workflow safe.

mod encryption;
mod memory;
mod postgres;
mod store;

pub use encryption::{EncryptionError, FieldCipher};
pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use store::{
    definition_is_sensitive, task_canonical, workflow_canonical, StateStore, StoreError,
    TaskRecord, WorkflowRecord,
};
