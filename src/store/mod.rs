//! libSQL-backed storage for onboarding drafts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, StoredDraft};
