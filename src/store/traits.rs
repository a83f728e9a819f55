//! Single async interface for draft persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// A raw persisted draft row.
///
/// `value` is the text exactly as stored; parsing it is the caller's job so
/// that a corrupt payload can be told apart from a database failure.
#[derive(Debug, Clone)]
pub struct StoredDraft {
    pub applicant_id: String,
    pub namespace: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Fetch the draft stored for an applicant under a namespace.
    async fn get_draft(
        &self,
        applicant_id: &str,
        namespace: &str,
    ) -> Result<Option<StoredDraft>, DatabaseError>;

    /// Insert or replace the draft for an applicant under a namespace.
    async fn put_draft(
        &self,
        applicant_id: &str,
        namespace: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// Delete a draft. Returns whether a row was removed.
    async fn delete_draft(&self, applicant_id: &str, namespace: &str)
    -> Result<bool, DatabaseError>;

    /// List the namespaces an applicant has drafts for.
    async fn list_namespaces(&self, applicant_id: &str) -> Result<Vec<String>, DatabaseError>;
}
