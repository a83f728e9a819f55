//! Namespaced draft persistence.
//!
//! Each draft type owns one namespace. Loads tolerate corrupt or
//! inconsistent payloads by logging and falling back to the empty draft;
//! saves always write the whole draft.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::documents::DocumentRegistrar;
use super::model::{OnboardingSession, PersonalInfoDraft};
use super::skills::SkillSelection;
use crate::error::DatabaseError;
use crate::store::Database;

/// Persistence namespace keys.
pub mod namespace {
    pub const PERSONAL_INFO: &str = "personalInfo";
    pub const SELECTED_SKILLS: &str = "selectedSkills";
    pub const SESSION: &str = "onboardingSession";
    pub const DOCUMENTS: &str = "documents";

    pub const ALL: [&str; 4] = [PERSONAL_INFO, SELECTED_SKILLS, SESSION, DOCUMENTS];
}

/// A value persisted under a fixed namespace.
pub trait Draft: Serialize + DeserializeOwned + Send + Sync {
    const NAMESPACE: &'static str;

    /// Consistency check run after a stored draft is parsed.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Draft for PersonalInfoDraft {
    const NAMESPACE: &'static str = namespace::PERSONAL_INFO;
}

impl Draft for SkillSelection {
    const NAMESPACE: &'static str = namespace::SELECTED_SKILLS;
}

impl Draft for OnboardingSession {
    const NAMESPACE: &'static str = namespace::SESSION;

    fn check(&self) -> Result<(), String> {
        self.sequencer.check()
    }
}

impl Draft for DocumentRegistrar {
    const NAMESPACE: &'static str = namespace::DOCUMENTS;
}

/// Draft store scoped to a single applicant.
#[derive(Clone)]
pub struct ProgressStore {
    db: Arc<dyn Database>,
    applicant_id: String,
}

impl ProgressStore {
    pub fn new(db: Arc<dyn Database>, applicant_id: impl Into<String>) -> Self {
        Self {
            db,
            applicant_id: applicant_id.into(),
        }
    }

    pub fn applicant_id(&self) -> &str {
        &self.applicant_id
    }

    /// Load a draft, or `None` when nothing usable is stored.
    pub async fn load_existing<D: Draft>(&self) -> Result<Option<D>, DatabaseError> {
        let Some(stored) = self.db.get_draft(&self.applicant_id, D::NAMESPACE).await? else {
            return Ok(None);
        };
        let parsed = serde_json::from_str::<D>(&stored.value)
            .map_err(|e| e.to_string())
            .and_then(|draft| draft.check().map(|()| draft));
        match parsed {
            Ok(draft) => Ok(Some(draft)),
            Err(e) => {
                tracing::warn!(
                    applicant = %self.applicant_id,
                    namespace = D::NAMESPACE,
                    error = %e,
                    "Stored draft is corrupt, starting from an empty draft"
                );
                Ok(None)
            }
        }
    }

    /// Load a draft, falling back to its empty value.
    pub async fn load<D: Draft + Default>(&self) -> Result<D, DatabaseError> {
        Ok(self.load_existing().await?.unwrap_or_default())
    }

    /// Write the whole draft.
    pub async fn save<D: Draft>(&self, draft: &D) -> Result<(), DatabaseError> {
        let value = serde_json::to_string(draft)
            .map_err(|e| DatabaseError::Serialization(format!("{}: {e}", D::NAMESPACE)))?;
        self.db
            .put_draft(&self.applicant_id, D::NAMESPACE, &value)
            .await
    }

    pub async fn clear<D: Draft>(&self) -> Result<bool, DatabaseError> {
        self.db.delete_draft(&self.applicant_id, D::NAMESPACE).await
    }

    /// Remove every draft this applicant has.
    pub async fn clear_all(&self) -> Result<(), DatabaseError> {
        for ns in namespace::ALL {
            self.db.delete_draft(&self.applicant_id, ns).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn store(applicant: &str) -> (Arc<dyn Database>, ProgressStore) {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.init_schema().await.unwrap();
        let db: Arc<dyn Database> = Arc::new(backend);
        let store = ProgressStore::new(Arc::clone(&db), applicant);
        (db, store)
    }

    #[tokio::test]
    async fn first_time_visitor_gets_empty_draft() {
        let (_db, store) = store("new").await;
        let draft: PersonalInfoDraft = store.load().await.unwrap();
        assert_eq!(draft, PersonalInfoDraft::default());
        assert!(store.load_existing::<PersonalInfoDraft>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_draft_resumes() {
        let (db, store) = store("a1").await;
        db.put_draft("a1", "personalInfo", r#"{"firstName":"An","city":"Đà Nẵng"}"#)
            .await
            .unwrap();

        let draft: PersonalInfoDraft = store.load().await.unwrap();
        assert_eq!(draft.first_name, "An");
        assert_eq!(draft.city, "Đà Nẵng");
        assert_eq!(draft.last_name, "");
        assert_eq!(draft.phone, "");
    }

    #[tokio::test]
    async fn corrupt_payload_yields_default() {
        let (db, store) = store("a1").await;
        db.put_draft("a1", "selectedSkills", "{not json").await.unwrap();

        let selection: SkillSelection = store.load().await.unwrap();
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn inconsistent_session_is_discarded() {
        let (db, store) = store("a1").await;
        let session = OnboardingSession::start("a1", true, 4);
        let mut raw = serde_json::to_value(&session).unwrap();
        raw["sequencer"]["current_stage_index"] = 9.into();
        raw["sequencer"]["furthest_index"] = 9.into();
        db.put_draft("a1", "onboardingSession", &raw.to_string())
            .await
            .unwrap();

        assert!(store.load_existing::<OnboardingSession>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_is_idempotent() {
        let (_db, store) = store("a1").await;
        let selection = SkillSelection::from_ids(["cpr", "swimming"]);
        store.save(&selection).await.unwrap();

        let first: SkillSelection = store.load().await.unwrap();
        let second: SkillSelection = store.load().await.unwrap();
        assert_eq!(first, selection);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn last_save_wins() {
        let (_db, store) = store("a1").await;
        for n in 1..=5 {
            let draft = PersonalInfoDraft {
                first_name: format!("An {n}"),
                ..Default::default()
            };
            store.save(&draft).await.unwrap();
        }
        let draft: PersonalInfoDraft = store.load().await.unwrap();
        assert_eq!(draft.first_name, "An 5");
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let (db, store) = store("a1").await;
        store
            .save(&PersonalInfoDraft {
                first_name: "An".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.save(&SkillSelection::from_ids(["cpr"])).await.unwrap();

        assert_eq!(
            db.list_namespaces("a1").await.unwrap(),
            vec!["personalInfo".to_string(), "selectedSkills".to_string()]
        );
    }

    #[tokio::test]
    async fn clear_all_removes_every_namespace() {
        let (db, store) = store("a1").await;
        store.save(&SkillSelection::from_ids(["cpr"])).await.unwrap();
        store.save(&DocumentRegistrar::default()).await.unwrap();

        store.clear_all().await.unwrap();
        assert!(db.list_namespaces("a1").await.unwrap().is_empty());
        assert!(!store.clear::<SkillSelection>().await.unwrap());
    }
}
