//! Optional certificate upload stage.
//!
//! Each chosen file becomes an entry in `uploading` state right away. The
//! upload result later moves it to `uploaded` or removes it. The stage commit
//! is refused while anything is still uploading, unless the applicant skips
//! the stage, in which case an empty list is sent.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::catalog::CertType;
use crate::error::OnboardingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntry {
    pub id: Uuid,
    pub cert_type_id: String,
    pub cert_type_label: String,
    pub file_name: String,
    #[serde(default)]
    pub file_url: Option<String>,
    pub status: DocumentStatus,
}

/// How an upload settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Uploaded(DocumentEntry),
    /// The entry was removed; it is returned with status `failed`.
    Failed { entry: DocumentEntry, reason: String },
    /// No entry with that id is uploading any more.
    Discarded,
}

/// Payload for the document commit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCommit {
    pub documents: Vec<CommittedDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedDocument {
    pub file_url: String,
    pub file_type_id: String,
}

/// Document entries for one applicant. Persisted under `documents`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRegistrar {
    entries: Vec<DocumentEntry>,
}

impl DocumentRegistrar {
    pub fn entries(&self) -> &[DocumentEntry] {
        &self.entries
    }

    pub fn get(&self, id: Uuid) -> Option<&DocumentEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Add a placeholder entry for a file that is about to be uploaded.
    pub fn start_upload(&mut self, file_name: &str, cert_type: &CertType) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push(DocumentEntry {
            id,
            cert_type_id: cert_type.id.clone(),
            cert_type_label: cert_type.label.clone(),
            file_name: file_name.to_string(),
            file_url: None,
            status: DocumentStatus::Uploading,
        });
        id
    }

    /// Resolve an upload: success stores the URL, failure removes the entry.
    pub fn on_upload_settled(&mut self, id: Uuid, result: Result<String, String>) -> Settled {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.id == id && e.status == DocumentStatus::Uploading)
        else {
            debug!(entry = %id, "Upload settled for an entry that is no longer uploading");
            return Settled::Discarded;
        };

        match result {
            Ok(url) => {
                let entry = &mut self.entries[pos];
                entry.file_url = Some(url);
                entry.status = DocumentStatus::Uploaded;
                Settled::Uploaded(entry.clone())
            }
            Err(reason) => {
                let mut entry = self.entries.remove(pos);
                entry.status = DocumentStatus::Failed;
                Settled::Failed { entry, reason }
            }
        }
    }

    /// Delete an entry at the applicant's request. Not allowed mid-upload.
    pub fn remove(&mut self, id: Uuid) -> Result<DocumentEntry, OnboardingError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(OnboardingError::DocumentNotFound(id))?;
        if self.entries[pos].status == DocumentStatus::Uploading {
            return Err(OnboardingError::DocumentUploading(id));
        }
        Ok(self.entries.remove(pos))
    }

    /// Number of uploads still in flight.
    pub fn outstanding(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == DocumentStatus::Uploading)
            .count()
    }

    /// Whether the commit control is enabled.
    pub fn can_commit(&self) -> bool {
        self.outstanding() == 0
    }

    /// Build the commit payload. `skip` always sends an empty list.
    pub fn commit_payload(&self, skip: bool) -> Result<DocumentCommit, OnboardingError> {
        if skip {
            return Ok(DocumentCommit {
                documents: Vec::new(),
            });
        }
        let count = self.outstanding();
        if count > 0 {
            return Err(OnboardingError::UploadsOutstanding { count });
        }
        let documents = self
            .entries
            .iter()
            .filter(|e| e.status == DocumentStatus::Uploaded)
            .filter_map(|e| {
                e.file_url.as_ref().map(|url| CommittedDocument {
                    file_url: url.clone(),
                    file_type_id: e.cert_type_id.clone(),
                })
            })
            .collect();
        Ok(DocumentCommit { documents })
    }

    /// Drop `uploading` entries whose upload is no longer running, e.g. after
    /// a restart. Returns how many were dropped.
    pub fn drop_interrupted(&mut self, in_flight: impl Fn(Uuid) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| match e.status {
            DocumentStatus::Uploaded => e.file_url.is_some(),
            DocumentStatus::Uploading => in_flight(e.id),
            DocumentStatus::Failed => false,
        });
        let dropped = before - self.entries.len();
        if dropped > 0 {
            warn!(dropped, "Dropped interrupted document uploads");
        }
        dropped
    }
}
