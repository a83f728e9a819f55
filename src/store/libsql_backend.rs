//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, StoredDraft};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a StoredDraft.
///
/// Column order: 0:applicant_id, 1:namespace, 2:value, 3:updated_at
fn row_to_draft(row: &libsql::Row) -> Result<StoredDraft, libsql::Error> {
    let updated_str: String = row.get(3)?;
    Ok(StoredDraft {
        applicant_id: row.get(0)?,
        namespace: row.get(1)?,
        value: row.get(2)?,
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get_draft(
        &self,
        applicant_id: &str,
        namespace: &str,
    ) -> Result<Option<StoredDraft>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT applicant_id, namespace, value, updated_at FROM drafts
                 WHERE applicant_id = ?1 AND namespace = ?2",
                params![applicant_id, namespace],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_draft: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_draft(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_draft: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_draft: {e}"))),
        }
    }

    async fn put_draft(
        &self,
        applicant_id: &str,
        namespace: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO drafts (applicant_id, namespace, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (applicant_id, namespace) DO UPDATE SET value = ?3, updated_at = ?4",
                params![applicant_id, namespace, value, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_draft: {e}")))?;

        debug!(applicant = %applicant_id, namespace = %namespace, "Draft saved");
        Ok(())
    }

    async fn delete_draft(
        &self,
        applicant_id: &str,
        namespace: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM drafts WHERE applicant_id = ?1 AND namespace = ?2",
                params![applicant_id, namespace],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_draft: {e}")))?;
        Ok(count > 0)
    }

    async fn list_namespaces(&self, applicant_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT namespace FROM drafts WHERE applicant_id = ?1 ORDER BY namespace",
                params![applicant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_namespaces: {e}")))?;

        let mut namespaces = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_namespaces: {e}")))?
        {
            let namespace: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_namespaces: {e}")))?;
            namespaces.push(namespace);
        }
        Ok(namespaces)
    }
}
