//! OnboardingController: gates stage entry, applies stage operations and
//! persists every change before reporting it.
//!
//! All mutations for one applicant run under that applicant's lock. Document
//! uploads run in spawned tasks that take the lock again to settle their entry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{Catalog, CertType, PrerequisiteQuestion};
use super::consent::{ConsentAnswers, ConsentOutcome, ConsentSubmitter};
use super::documents::{DocumentCommit, DocumentEntry, DocumentRegistrar, Settled};
use super::gate::{self, AuthState, GateOutcome, Route};
use super::model::{OnboardingSession, PersonalInfoDraft};
use super::progress::ProgressStore;
use super::skills::{SkillSelection, SkillSelector, SkillTaxonomy};
use super::state::{Retreat, Stage, StageCompletion, StepSequencer};
use crate::error::{Error, FieldError, OnboardingError};
use crate::remote::{
    AuthSnapshot, ConsentApi, DocumentCommitApi, DocumentFile, DocumentUploadApi, Geocoder,
    ProfileApi, SkillTaxonomyLoader,
};
use crate::store::Database;

const EVENT_CAPACITY: usize = 256;

/// Remote services the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub consent: Arc<dyn ConsentApi>,
    pub uploads: Arc<dyn DocumentUploadApi>,
    pub documents: Arc<dyn DocumentCommitApi>,
    pub taxonomy: Arc<dyn SkillTaxonomyLoader>,
    pub geocoder: Arc<dyn Geocoder>,
    pub profile: Arc<dyn ProfileApi>,
}

impl Collaborators {
    /// Use one implementation for every collaborator.
    pub fn from_shared<T>(api: Arc<T>) -> Self
    where
        T: ConsentApi
            + DocumentUploadApi
            + DocumentCommitApi
            + SkillTaxonomyLoader
            + Geocoder
            + ProfileApi
            + 'static,
    {
        Self {
            consent: api.clone(),
            uploads: api.clone(),
            documents: api.clone(),
            taxonomy: api.clone(),
            geocoder: api.clone(),
            profile: api,
        }
    }
}

/// Progress notifications pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OnboardingEvent {
    StageChanged {
        applicant_id: String,
        stage: Stage,
        sub_step: usize,
    },
    DocumentUpdated {
        applicant_id: String,
        entry: DocumentEntry,
    },
    DocumentFailed {
        applicant_id: String,
        entry: DocumentEntry,
        reason: String,
    },
    OnboardingComplete {
        applicant_id: String,
    },
}

impl OnboardingEvent {
    pub fn applicant_id(&self) -> &str {
        match self {
            Self::StageChanged { applicant_id, .. }
            | Self::DocumentUpdated { applicant_id, .. }
            | Self::DocumentFailed { applicant_id, .. }
            | Self::OnboardingComplete { applicant_id } => applicant_id,
        }
    }
}

/// Result of asking for access to a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted(String),
    Refused(GateOutcome),
}

/// Result of entering a stage.
#[derive(Debug, Clone)]
pub enum StageEntry {
    Pending,
    Redirect(Route),
    Allowed(StageView),
}

/// Wizard position and progress indicator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub stage: Stage,
    pub sub_step: usize,
    pub current_stage_index: usize,
    pub stages: Vec<Stage>,
    pub completed_stages: BTreeSet<Stage>,
    pub onboarding_complete: bool,
}

impl Position {
    fn of(sequencer: &StepSequencer) -> Self {
        Self {
            stage: sequencer.current(),
            sub_step: sequencer.sub_step(),
            current_stage_index: sequencer.current_stage_index(),
            stages: sequencer.stages().to_vec(),
            completed_stages: sequencer.completed_stages().clone(),
            onboarding_complete: sequencer.is_complete(),
        }
    }
}

/// Everything a stage screen needs to render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageView {
    pub position: Position,
    pub data: StageData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StageData {
    Auth,
    PersonalInfo {
        draft: PersonalInfoDraft,
        errors: Vec<FieldError>,
    },
    PrerequisiteConsent {
        questions: Vec<PrerequisiteQuestion>,
        answers: ConsentAnswers,
        submitted: bool,
    },
    SkillSelection {
        selected: SkillSelection,
        category_index: usize,
    },
    DocumentUpload {
        cert_types: Vec<CertType>,
        entries: DocumentRegistrar,
        can_commit: bool,
        committed: bool,
    },
    Complete,
}

/// Outcome of saving the personal-info draft.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalInfoReport {
    pub draft: PersonalInfoDraft,
    pub errors: Vec<FieldError>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillToggle {
    pub skill_id: String,
    pub selected: bool,
    pub selection: SkillSelection,
}

/// Result of `advance()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advanced {
    /// Whether the move stayed inside the current stage.
    pub within_stage: bool,
    pub position: Position,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retreated {
    pub retreat: Retreat,
    pub position: Position,
}

/// Status summary for the REST endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingStatus {
    pub applicant_id: String,
    pub position: Position,
    pub furthest: Stage,
    pub consent_submitted: bool,
    pub documents_committed: bool,
}

/// Coordinates the onboarding wizard for every applicant.
pub struct OnboardingController {
    db: Arc<dyn Database>,
    catalog: Catalog,
    include_documents: bool,
    apis: Collaborators,
    taxonomy: OnceCell<Arc<SkillTaxonomy>>,
    events: broadcast::Sender<OnboardingEvent>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: RwLock<HashSet<Uuid>>,
}

impl OnboardingController {
    pub fn new(
        db: Arc<dyn Database>,
        catalog: Catalog,
        include_documents: bool,
        apis: Collaborators,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            db,
            catalog,
            include_documents,
            apis,
            taxonomy: OnceCell::new(),
            events,
            locks: Mutex::new(HashMap::new()),
            in_flight: RwLock::new(HashSet::new()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Subscribe to progress events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<OnboardingEvent> {
        self.events.subscribe()
    }

    fn store(&self, applicant_id: &str) -> ProgressStore {
        ProgressStore::new(Arc::clone(&self.db), applicant_id)
    }

    fn emit(&self, event: OnboardingEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_position(&self, applicant_id: &str, sequencer: &StepSequencer) {
        self.emit(OnboardingEvent::StageChanged {
            applicant_id: applicant_id.to_string(),
            stage: sequencer.current(),
            sub_step: sequencer.sub_step(),
        });
    }

    async fn lock_applicant(&self, applicant_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map holds idle locks; holders and waiters keep a clone.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(applicant_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Load the applicant's session, creating it on the first visit.
    async fn load_session(&self, store: &ProgressStore) -> Result<OnboardingSession, Error> {
        let question_count = self.catalog.question_count();
        let mut session = match store.load_existing::<OnboardingSession>().await? {
            Some(session) => session,
            None => {
                let session = OnboardingSession::start(
                    store.applicant_id(),
                    self.include_documents,
                    question_count,
                );
                store.save(&session).await?;
                info!(applicant = %store.applicant_id(), "Onboarding session started");
                session
            }
        };
        if session.consent.len() != question_count && !session.consent_submitted {
            warn!(
                applicant = %store.applicant_id(),
                stored = session.consent.len(),
                expected = question_count,
                "Prerequisite questions changed, resetting answers"
            );
            session.consent = ConsentAnswers::new(question_count);
        }
        Ok(session)
    }

    async fn save_session(
        &self,
        store: &ProgressStore,
        session: &mut OnboardingSession,
    ) -> Result<(), Error> {
        session.touch();
        store.save(session).await?;
        Ok(())
    }

    async fn load_documents(&self, store: &ProgressStore) -> Result<DocumentRegistrar, Error> {
        let mut registrar: DocumentRegistrar = store.load().await?;
        let in_flight = self.in_flight.read().await;
        if registrar.drop_interrupted(|id| in_flight.contains(&id)) > 0 {
            store.save(&registrar).await?;
        }
        Ok(registrar)
    }

    fn require_stage(session: &OnboardingSession, expected: Stage) -> Result<(), OnboardingError> {
        let actual = session.sequencer.current();
        if actual != expected {
            debug!(applicant = %session.applicant_id, %expected, %actual, "Operation refused for stage");
            return Err(OnboardingError::WrongStage { expected, actual });
        }
        Ok(())
    }

    /// The oracle's claims, completed with the locally recorded completion.
    async fn effective_state(
        &self,
        auth: &AuthSnapshot,
    ) -> Result<(AuthState, Option<OnboardingSession>), Error> {
        let mut state = auth.state;
        let session = match &auth.applicant_id {
            Some(id) if state.is_authenticated && !state.is_loading => {
                self.store(id).load_existing::<OnboardingSession>().await?
            }
            _ => None,
        };
        if session.as_ref().is_some_and(OnboardingSession::is_complete) {
            state.onboarding_complete = true;
        }
        Ok((state, session))
    }

    /// Gate an operation on `stage`, or on the applicant's current stage.
    pub async fn access(&self, auth: &AuthSnapshot, stage: Option<Stage>) -> Result<Access, Error> {
        let (state, session) = self.effective_state(auth).await?;
        let stage = stage
            .or_else(|| session.as_ref().map(|s| s.sequencer.current()))
            .unwrap_or(Stage::PersonalInfo);

        match gate::evaluate(stage, &state) {
            GateOutcome::Allow => match &auth.applicant_id {
                Some(id) if state.is_authenticated => Ok(Access::Granted(id.clone())),
                _ => Ok(Access::Refused(GateOutcome::RedirectTo(Route::Registration))),
            },
            outcome => Ok(Access::Refused(outcome)),
        }
    }

    /// Gate and load a stage. Entering an already reached stage moves the
    /// wizard there; asking for one not reached yet redirects to the current.
    pub async fn enter(&self, auth: &AuthSnapshot, stage: Stage) -> Result<StageEntry, Error> {
        let (state, _) = self.effective_state(auth).await?;
        match gate::evaluate(stage, &state) {
            GateOutcome::Pending => return Ok(StageEntry::Pending),
            GateOutcome::RedirectTo(route) => return Ok(StageEntry::Redirect(route)),
            GateOutcome::Allow => {}
        }

        let applicant_id = match &auth.applicant_id {
            Some(id) if state.is_authenticated => id.clone(),
            _ => {
                // Only the registration stage is open to anonymous callers.
                let sequencer = StepSequencer::new(self.include_documents);
                return Ok(StageEntry::Allowed(StageView {
                    position: Position::of(&sequencer),
                    data: StageData::Auth,
                }));
            }
        };

        let _guard = self.lock_applicant(&applicant_id).await;
        let store = self.store(&applicant_id);
        let mut session = self.load_session(&store).await?;
        let current = session.sequencer.current();

        if !session.sequencer.includes(stage) {
            return Ok(StageEntry::Redirect(Route::Stage(current)));
        }
        if stage != current {
            match session.sequencer.jump_to(stage) {
                Ok(()) => {
                    self.save_session(&store, &mut session).await?;
                    debug!(applicant = %applicant_id, from = %current, to = %stage, "Jumped to stage");
                    self.emit_position(&applicant_id, &session.sequencer);
                }
                Err(OnboardingError::StageNotReached { .. }) => {
                    debug!(applicant = %applicant_id, %stage, %current, "Stage not reached, redirecting");
                    return Ok(StageEntry::Redirect(Route::Stage(current)));
                }
                Err(OnboardingError::AlreadyComplete) => {
                    return Ok(StageEntry::Redirect(Route::Profile));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let view = self.view(&store, &session).await?;
        Ok(StageEntry::Allowed(view))
    }

    async fn view(
        &self,
        store: &ProgressStore,
        session: &OnboardingSession,
    ) -> Result<StageView, Error> {
        let data = match session.sequencer.current() {
            Stage::Auth => StageData::Auth,
            Stage::PersonalInfo => {
                let draft: PersonalInfoDraft = store.load().await?;
                StageData::PersonalInfo {
                    errors: draft.validate().err().unwrap_or_default(),
                    draft,
                }
            }
            Stage::PrerequisiteConsent => StageData::PrerequisiteConsent {
                questions: self.catalog.questions.clone(),
                answers: session.consent.clone(),
                submitted: session.consent_submitted,
            },
            Stage::SkillSelection => StageData::SkillSelection {
                selected: store.load().await?,
                category_index: session.sequencer.sub_step(),
            },
            Stage::DocumentUpload => {
                let entries = self.load_documents(store).await?;
                StageData::DocumentUpload {
                    cert_types: self.catalog.cert_types.clone(),
                    can_commit: entries.can_commit(),
                    entries,
                    committed: session.documents_committed,
                }
            }
            Stage::Complete => StageData::Complete,
        };
        Ok(StageView {
            position: Position::of(&session.sequencer),
            data,
        })
    }

    pub async fn status(&self, applicant_id: &str) -> Result<OnboardingStatus, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let session = self.load_session(&self.store(applicant_id)).await?;
        Ok(OnboardingStatus {
            applicant_id: applicant_id.to_string(),
            position: Position::of(&session.sequencer),
            furthest: session.sequencer.furthest(),
            consent_submitted: session.consent_submitted,
            documents_committed: session.documents_committed,
        })
    }

    // ── PersonalInfo ───────────────────────────────────────────────

    /// Persist the whole draft and report what still blocks the stage.
    pub async fn save_personal_info(
        &self,
        applicant_id: &str,
        draft: PersonalInfoDraft,
    ) -> Result<PersonalInfoReport, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::PersonalInfo)?;

        store.save(&draft).await?;
        let errors = draft.validate().err().unwrap_or_default();
        Ok(PersonalInfoReport {
            complete: errors.is_empty(),
            draft,
            errors,
        })
    }

    /// Fill the address from coordinates. Geocoding failures leave the draft
    /// as it was.
    pub async fn locate(
        &self,
        applicant_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<PersonalInfoDraft, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::PersonalInfo)?;

        let mut draft: PersonalInfoDraft = store.load().await?;
        match self.apis.geocoder.reverse(lat, lon).await {
            Ok(found) => {
                draft.apply_geocode(&found);
                store.save(&draft).await?;
            }
            Err(e) => {
                warn!(applicant = %applicant_id, error = %e, "Reverse geocoding failed");
            }
        }
        Ok(draft)
    }

    // ── PrerequisiteConsent ────────────────────────────────────────

    pub async fn answer_consent(
        &self,
        applicant_id: &str,
        index: usize,
        yes: bool,
    ) -> Result<ConsentOutcome, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::PrerequisiteConsent)?;
        if session.consent_submitted {
            return Err(OnboardingError::ConsentLocked.into());
        }

        let current = session.sequencer.sub_step();
        let outcome = session
            .consent
            .answer(current, index, yes, &self.catalog.questions)?;
        if let Some(next) = outcome.next_sub_step(self.catalog.question_count()) {
            session.sequencer.set_sub_step(next);
        }
        self.save_session(&store, &mut session).await?;

        if let ConsentOutcome::Rejected { question, .. } = &outcome {
            info!(applicant = %applicant_id, question, "Prerequisite answered no");
        } else {
            self.emit_position(applicant_id, &session.sequencer);
        }
        Ok(outcome)
    }

    /// Send the all-yes consent record. A second call after success is a no-op.
    pub async fn submit_consent(&self, applicant_id: &str) -> Result<(), Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::PrerequisiteConsent)?;
        if session.consent_submitted {
            return Ok(());
        }

        let record = session
            .consent
            .seal(&self.catalog.questions)
            .ok_or(OnboardingError::ConsentIncomplete)?;
        ConsentSubmitter::new(Arc::clone(&self.apis.consent))
            .submit(applicant_id, &record)
            .await?;

        session.consent_submitted = true;
        self.save_session(&store, &mut session).await
    }

    // ── SkillSelection ─────────────────────────────────────────────

    /// The skill taxonomy, loaded on first use.
    pub async fn taxonomy(&self) -> Result<Arc<SkillTaxonomy>, Error> {
        let taxonomy = self
            .taxonomy
            .get_or_try_init(|| async { self.apis.taxonomy.load().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(taxonomy))
    }

    pub async fn toggle_skill(&self, applicant_id: &str, skill_id: &str) -> Result<SkillToggle, Error> {
        let taxonomy = self.taxonomy().await?;
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::SkillSelection)?;

        let mut selection: SkillSelection = store.load().await?;
        let selected = SkillSelector::new(&taxonomy).toggle(&mut selection, skill_id)?;
        store.save(&selection).await?;
        Ok(SkillToggle {
            skill_id: skill_id.to_string(),
            selected,
            selection,
        })
    }

    // ── DocumentUpload ─────────────────────────────────────────────

    /// Register the file as `uploading` and upload it in the background.
    pub async fn start_document_upload(
        self: &Arc<Self>,
        applicant_id: &str,
        cert_type_id: &str,
        file: DocumentFile,
    ) -> Result<DocumentEntry, Error> {
        let cert_type = self
            .catalog
            .cert_type(cert_type_id)
            .cloned()
            .ok_or_else(|| OnboardingError::UnknownCertType(cert_type_id.to_string()))?;

        let entry = {
            let _guard = self.lock_applicant(applicant_id).await;
            let store = self.store(applicant_id);
            let mut session = self.load_session(&store).await?;
            Self::require_stage(&session, Stage::DocumentUpload)?;

            let mut registrar = self.load_documents(&store).await?;
            let id = registrar.start_upload(&file.file_name, &cert_type);
            store.save(&registrar).await?;
            self.in_flight.write().await.insert(id);

            if session.documents_committed {
                session.documents_committed = false;
                self.save_session(&store, &mut session).await?;
            }
            registrar
                .get(id)
                .cloned()
                .ok_or(OnboardingError::DocumentNotFound(id))?
        };

        info!(applicant = %applicant_id, entry = %entry.id, file = %entry.file_name, "Document upload started");

        let this = Arc::clone(self);
        let applicant = applicant_id.to_string();
        let entry_id = entry.id;
        tokio::spawn(async move {
            let result = this
                .apis
                .uploads
                .upload(&applicant, file)
                .await
                .map_err(|e| e.to_string());
            if let Err(e) = this.settle_upload(&applicant, entry_id, result).await {
                warn!(applicant = %applicant, entry = %entry_id, error = %e, "Failed to settle document upload");
                this.in_flight.write().await.remove(&entry_id);
            }
        });

        Ok(entry)
    }

    async fn settle_upload(
        &self,
        applicant_id: &str,
        entry_id: Uuid,
        result: Result<String, String>,
    ) -> Result<(), Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut registrar = self.load_documents(&store).await?;
        let settled = registrar.on_upload_settled(entry_id, result);
        self.in_flight.write().await.remove(&entry_id);

        match settled {
            Settled::Uploaded(entry) => {
                store.save(&registrar).await?;
                info!(applicant = %applicant_id, entry = %entry_id, "Document uploaded");
                self.emit(OnboardingEvent::DocumentUpdated {
                    applicant_id: applicant_id.to_string(),
                    entry,
                });
            }
            Settled::Failed { entry, reason } => {
                store.save(&registrar).await?;
                warn!(applicant = %applicant_id, entry = %entry_id, reason = %reason, "Document upload failed");
                self.emit(OnboardingEvent::DocumentFailed {
                    applicant_id: applicant_id.to_string(),
                    entry,
                    reason,
                });
            }
            Settled::Discarded => {}
        }
        Ok(())
    }

    pub async fn remove_document(&self, applicant_id: &str, entry_id: Uuid) -> Result<DocumentEntry, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::DocumentUpload)?;

        let mut registrar = self.load_documents(&store).await?;
        let removed = registrar.remove(entry_id)?;
        store.save(&registrar).await?;
        Ok(removed)
    }

    /// Send the uploaded documents, or an empty list when skipping.
    pub async fn commit_documents(&self, applicant_id: &str, skip: bool) -> Result<DocumentCommit, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut session = self.load_session(&store).await?;
        Self::require_stage(&session, Stage::DocumentUpload)?;

        let registrar = self.load_documents(&store).await?;
        let payload = registrar.commit_payload(skip)?;
        self.apis
            .documents
            .commit_documents(applicant_id, &payload)
            .await
            .inspect_err(|e| warn!(applicant = %applicant_id, error = %e, "Document commit failed"))?;

        session.documents_committed = true;
        self.save_session(&store, &mut session).await?;
        info!(applicant = %applicant_id, documents = payload.documents.len(), skip, "Documents committed");
        Ok(payload)
    }

    // ── Navigation ─────────────────────────────────────────────────

    /// Move forward: to the next question or category inside a stage, or to
    /// the next stage once the current one is complete.
    pub async fn advance(&self, applicant_id: &str) -> Result<Advanced, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut session = self.load_session(&store).await?;
        let stage = session.sequencer.current();
        let sub_step = session.sequencer.sub_step();

        let completion = match stage {
            Stage::Complete => return Err(OnboardingError::AlreadyComplete.into()),
            Stage::Auth => StageCompletion::Ready,
            Stage::PersonalInfo => {
                let draft: PersonalInfoDraft = store.load().await?;
                let info = draft.validate().map_err(OnboardingError::Validation)?;
                self.apis.profile.submit_personal_info(applicant_id, &info).await?;
                StageCompletion::Ready
            }
            Stage::PrerequisiteConsent => {
                let question_count = self.catalog.question_count();
                if sub_step < question_count {
                    if !session.consent.is_affirmed(sub_step) {
                        return Err(OnboardingError::TransitionBlocked {
                            stage,
                            reason: format!("question {} is not answered yes", sub_step + 1),
                        }
                        .into());
                    }
                    return self
                        .move_within(&store, &mut session, sub_step + 1)
                        .await;
                }
                if session.consent_submitted {
                    StageCompletion::Ready
                } else {
                    StageCompletion::Blocked("prerequisite answers not submitted".to_string())
                }
            }
            Stage::SkillSelection => {
                let taxonomy = self.taxonomy().await?;
                let selector = SkillSelector::new(&taxonomy);
                match selector.completion(sub_step) {
                    StageCompletion::Blocked(_) => {
                        return self
                            .move_within(&store, &mut session, sub_step + 1)
                            .await;
                    }
                    StageCompletion::Ready => {
                        let selection: SkillSelection = store.load().await?;
                        self.apis.profile.submit_skills(applicant_id, selection.ids()).await?;
                        StageCompletion::Ready
                    }
                }
            }
            Stage::DocumentUpload => {
                if session.documents_committed {
                    StageCompletion::Ready
                } else {
                    StageCompletion::Blocked("documents not committed".to_string())
                }
            }
        };

        let entered = session.sequencer.advance(completion)?;
        self.save_session(&store, &mut session).await?;
        info!(applicant = %applicant_id, from = %stage, to = %entered, "Onboarding stage advanced");
        self.emit_position(applicant_id, &session.sequencer);
        if entered.is_terminal() {
            info!(applicant = %applicant_id, "Onboarding complete");
            self.emit(OnboardingEvent::OnboardingComplete {
                applicant_id: applicant_id.to_string(),
            });
        }

        Ok(Advanced {
            within_stage: false,
            position: Position::of(&session.sequencer),
        })
    }

    async fn move_within(
        &self,
        store: &ProgressStore,
        session: &mut OnboardingSession,
        sub_step: usize,
    ) -> Result<Advanced, Error> {
        session.sequencer.set_sub_step(sub_step);
        self.save_session(store, session).await?;
        self.emit_position(&session.applicant_id, &session.sequencer);
        Ok(Advanced {
            within_stage: true,
            position: Position::of(&session.sequencer),
        })
    }

    /// Step back one question, category or stage.
    pub async fn retreat(&self, applicant_id: &str) -> Result<Retreated, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let mut session = self.load_session(&store).await?;

        let retreat = session.sequencer.retreat()?;
        if retreat != Retreat::Exited {
            self.save_session(&store, &mut session).await?;
            self.emit_position(applicant_id, &session.sequencer);
        }
        debug!(applicant = %applicant_id, ?retreat, "Onboarding retreat");
        Ok(Retreated {
            retreat,
            position: Position::of(&session.sequencer),
        })
    }

    /// Discard every draft and start over. Refused once complete.
    pub async fn restart(&self, applicant_id: &str) -> Result<Position, Error> {
        let _guard = self.lock_applicant(applicant_id).await;
        let store = self.store(applicant_id);
        let session = self.load_session(&store).await?;
        if session.is_complete() {
            return Err(OnboardingError::AlreadyComplete.into());
        }
        let outstanding = self.load_documents(&store).await?.outstanding();
        if outstanding > 0 {
            return Err(OnboardingError::UploadsOutstanding { count: outstanding }.into());
        }

        store.clear_all().await?;
        let session = self.load_session(&store).await?;
        info!(applicant = %applicant_id, "Onboarding restarted");
        self.emit_position(applicant_id, &session.sequencer);
        Ok(Position::of(&session.sequencer))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::RemoteError;
    use crate::onboarding::consent::ConsentRecord;
    use crate::onboarding::model::{GeocodedAddress, ValidatedPersonalInfo};
    use crate::onboarding::skills::tests::sample_taxonomy;
    use crate::store::LibSqlBackend;

    const WAIT: Duration = Duration::from_secs(5);

    fn down(service: &str) -> RemoteError {
        RemoteError::RequestFailed {
            service: service.into(),
            reason: "connection refused".into(),
        }
    }

    #[derive(Default)]
    struct Stubs {
        consent_down: std::sync::atomic::AtomicBool,
        geocoder_down: std::sync::atomic::AtomicBool,
        upload_gate: Option<Semaphore>,
        upload_error: Option<String>,
        consent: StdMutex<Vec<ConsentRecord>>,
        commits: StdMutex<Vec<DocumentCommit>>,
        profiles: StdMutex<Vec<ValidatedPersonalInfo>>,
        skills: StdMutex<Vec<Vec<String>>>,
        taxonomy_loads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ConsentApi for Stubs {
        async fn submit_consent(&self, _: &str, record: &ConsentRecord) -> Result<(), RemoteError> {
            if self.consent_down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(down("consent"));
            }
            self.consent.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl DocumentUploadApi for Stubs {
        async fn upload(&self, _: &str, file: DocumentFile) -> Result<String, RemoteError> {
            if let Some(gate) = &self.upload_gate {
                gate.acquire().await.unwrap().forget();
            }
            match &self.upload_error {
                Some(reason) => Err(RemoteError::Rejected {
                    service: "upload".into(),
                    status: 413,
                    body: reason.clone(),
                }),
                None => Ok(format!("https://files.example/{}", file.file_name)),
            }
        }
    }

    #[async_trait]
    impl DocumentCommitApi for Stubs {
        async fn commit_documents(&self, _: &str, commit: &DocumentCommit) -> Result<(), RemoteError> {
            self.commits.lock().unwrap().push(commit.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl SkillTaxonomyLoader for Stubs {
        async fn load(&self) -> Result<SkillTaxonomy, Error> {
            self.taxonomy_loads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(sample_taxonomy())
        }
    }

    #[async_trait]
    impl Geocoder for Stubs {
        async fn reverse(&self, _: f64, _: f64) -> Result<GeocodedAddress, RemoteError> {
            if self.geocoder_down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(down("geocoder"));
            }
            Ok(GeocodedAddress {
                address: "12 Lê Lợi".into(),
                ward: "Phú Hội".into(),
                district: "Thuận Hóa".into(),
                city: "Huế".into(),
            })
        }
    }

    #[async_trait]
    impl ProfileApi for Stubs {
        async fn submit_personal_info(&self, _: &str, info: &ValidatedPersonalInfo) -> Result<(), RemoteError> {
            self.profiles.lock().unwrap().push(info.clone());
            Ok(())
        }

        async fn submit_skills(&self, _: &str, skill_ids: &[String]) -> Result<(), RemoteError> {
            self.skills.lock().unwrap().push(skill_ids.to_vec());
            Ok(())
        }
    }

    async fn memory_db() -> Arc<dyn Database> {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.init_schema().await.unwrap();
        Arc::new(backend)
    }

    async fn controller_with(stubs: Stubs) -> (Arc<OnboardingController>, Arc<Stubs>) {
        let stubs = Arc::new(stubs);
        let controller = OnboardingController::new(
            memory_db().await,
            Catalog::default(),
            true,
            Collaborators::from_shared(Arc::clone(&stubs)),
        );
        (controller, stubs)
    }

    fn applicant(id: &str) -> AuthSnapshot {
        AuthSnapshot::authenticated(id, false)
    }

    async fn fill_personal_info(c: &OnboardingController, id: &str) {
        c.save_personal_info(
            id,
            PersonalInfoDraft {
                first_name: "An".into(),
                city: "Đà Nẵng".into(),
                phone: "0905 123 456".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        c.advance(id).await.unwrap();
    }

    async fn pass_consent(c: &OnboardingController, id: &str) {
        for i in 0..c.catalog().question_count() {
            c.answer_consent(id, i, true).await.unwrap();
        }
        c.submit_consent(id).await.unwrap();
        c.advance(id).await.unwrap();
    }

    async fn pass_skills(c: &OnboardingController, id: &str) {
        c.toggle_skill(id, "cpr").await.unwrap();
        // Category 1 -> 2, then leave the stage.
        assert!(c.advance(id).await.unwrap().within_stage);
        assert!(!c.advance(id).await.unwrap().within_stage);
    }

    #[tokio::test]
    async fn gate_outcomes_before_loading() {
        let (c, _) = controller_with(Stubs::default()).await;

        assert!(matches!(
            c.enter(&AuthSnapshot::pending(), Stage::PersonalInfo).await.unwrap(),
            StageEntry::Pending
        ));
        assert!(matches!(
            c.enter(&AuthSnapshot::anonymous(), Stage::SkillSelection).await.unwrap(),
            StageEntry::Redirect(Route::Registration)
        ));
        assert!(matches!(
            c.enter(&AuthSnapshot::authenticated("done", true), Stage::PersonalInfo)
                .await
                .unwrap(),
            StageEntry::Redirect(Route::Profile)
        ));
        assert!(matches!(
            c.enter(&AuthSnapshot::anonymous(), Stage::Auth).await.unwrap(),
            StageEntry::Allowed(StageView { data: StageData::Auth, .. })
        ));
    }

    #[tokio::test]
    async fn first_visit_shows_empty_personal_info() {
        let (c, _) = controller_with(Stubs::default()).await;
        match c.enter(&applicant("a1"), Stage::PersonalInfo).await.unwrap() {
            StageEntry::Allowed(view) => {
                assert_eq!(view.position.stage, Stage::PersonalInfo);
                match view.data {
                    StageData::PersonalInfo { draft, errors } => {
                        assert_eq!(draft, PersonalInfoDraft::default());
                        assert_eq!(errors.len(), 2);
                    }
                    other => panic!("unexpected data {other:?}"),
                }
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreached_stage_redirects_to_current() {
        let (c, _) = controller_with(Stubs::default()).await;
        assert!(matches!(
            c.enter(&applicant("a1"), Stage::DocumentUpload).await.unwrap(),
            StageEntry::Redirect(Route::Stage(Stage::PersonalInfo))
        ));
    }

    #[tokio::test]
    async fn invalid_personal_info_blocks_advance() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        let report = c
            .save_personal_info(
                "a1",
                PersonalInfoDraft {
                    first_name: "An".into(),
                    phone: "123".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!report.complete);

        let err = c.advance("a1").await.unwrap_err();
        match err {
            Error::Onboarding(OnboardingError::Validation(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, vec!["city", "phone"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(stubs.profiles.lock().unwrap().is_empty());
        // The invalid draft is still saved as typed.
        let status = c.status("a1").await.unwrap();
        assert_eq!(status.position.stage, Stage::PersonalInfo);
    }

    #[tokio::test]
    async fn valid_personal_info_advances_and_submits_profile() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;

        let status = c.status("a1").await.unwrap();
        assert_eq!(status.position.stage, Stage::PrerequisiteConsent);
        assert!(status.position.completed_stages.contains(&Stage::PersonalInfo));
        assert_eq!(stubs.profiles.lock().unwrap()[0].phone.as_deref(), Some("905123456"));
    }

    #[tokio::test]
    async fn locate_fills_address_or_leaves_it() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        let draft = c.locate("a1", 16.46, 107.59).await.unwrap();
        assert_eq!(draft.city, "Huế");

        stubs
            .geocoder_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        c.save_personal_info(
            "a1",
            PersonalInfoDraft {
                first_name: "An".into(),
                city: "Đà Nẵng".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let draft = c.locate("a1", 0.0, 0.0).await.unwrap();
        assert_eq!(draft.city, "Đà Nẵng");
    }

    #[tokio::test]
    async fn retreat_preserves_consent_progress() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;

        let outcome = c.answer_consent("a1", 0, true).await.unwrap();
        assert_eq!(outcome, ConsentOutcome::Accepted { next_question: 1 });

        let back = c.retreat("a1").await.unwrap();
        assert_eq!(
            back.retreat,
            Retreat::SubStep {
                stage: Stage::PrerequisiteConsent,
                sub_step: 0
            }
        );

        match c.enter(&applicant("a1"), Stage::PrerequisiteConsent).await.unwrap() {
            StageEntry::Allowed(StageView {
                data: StageData::PrerequisiteConsent { answers, .. },
                ..
            }) => assert!(answers.is_affirmed(0)),
            other => panic!("unexpected entry {other:?}"),
        }

        let forward = c.advance("a1").await.unwrap();
        assert!(forward.within_stage);
        assert_eq!(forward.position.sub_step, 1);
    }

    #[tokio::test]
    async fn revisiting_earlier_stage_keeps_consent_sub_step() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        c.answer_consent("a1", 0, true).await.unwrap();
        c.answer_consent("a1", 1, true).await.unwrap();

        // Jump back to an already reached stage, then forward again.
        assert!(matches!(
            c.enter(&applicant("a1"), Stage::PersonalInfo).await.unwrap(),
            StageEntry::Allowed(_)
        ));
        c.advance("a1").await.unwrap();

        let status = c.status("a1").await.unwrap();
        assert_eq!(status.position.stage, Stage::PrerequisiteConsent);
        assert_eq!(status.position.sub_step, 2);
        assert_eq!(status.furthest, Stage::PrerequisiteConsent);
    }

    #[tokio::test]
    async fn no_answer_holds_position() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        let outcome = c.answer_consent("a1", 0, false).await.unwrap();
        assert!(matches!(outcome, ConsentOutcome::Rejected { question: 0, .. }));
        assert!(c.advance("a1").await.is_err());
        assert_eq!(c.status("a1").await.unwrap().position.sub_step, 0);
    }

    #[tokio::test]
    async fn consent_failure_keeps_answers_and_retries() {
        let stubs = Stubs::default();
        stubs
            .consent_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (c, stubs) = controller_with(stubs).await;
        fill_personal_info(&c, "a1").await;
        for i in 0..4 {
            c.answer_consent("a1", i, true).await.unwrap();
        }

        assert!(matches!(c.submit_consent("a1").await, Err(Error::Remote(_))));
        assert!(c.advance("a1").await.is_err());

        stubs
            .consent_down
            .store(false, std::sync::atomic::Ordering::SeqCst);
        c.submit_consent("a1").await.unwrap();
        c.submit_consent("a1").await.unwrap();

        let sent = stubs.consent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags().len(), 4);
        assert!(sent[0].flags().values().all(|v| *v));
        drop(sent);

        assert!(matches!(
            c.answer_consent("a1", 3, false).await,
            Err(Error::Onboarding(OnboardingError::WrongQuestion { .. }))
                | Err(Error::Onboarding(OnboardingError::ConsentLocked))
        ));
    }

    #[tokio::test]
    async fn partial_consent_cannot_be_submitted() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        c.answer_consent("a1", 0, true).await.unwrap();
        assert!(matches!(
            c.submit_consent("a1").await,
            Err(Error::Onboarding(OnboardingError::ConsentIncomplete))
        ));
        assert!(stubs.consent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skill_toggles_persist_and_taxonomy_loads_once() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;

        c.toggle_skill("a1", "level_basic").await.unwrap();
        let toggle = c.toggle_skill("a1", "level_nurse").await.unwrap();
        assert!(toggle.selected);
        assert_eq!(toggle.selection.ids(), &["level_nurse".to_string()]);
        assert!(c.toggle_skill("a1", "unknown").await.is_err());

        match c.enter(&applicant("a1"), Stage::SkillSelection).await.unwrap() {
            StageEntry::Allowed(StageView {
                data: StageData::SkillSelection { selected, .. },
                ..
            }) => assert_eq!(selected.ids(), &["level_nurse".to_string()]),
            other => panic!("unexpected entry {other:?}"),
        }
        assert_eq!(
            stubs
                .taxonomy_loads
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_toggles_apply_in_order() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;
        c.taxonomy().await.unwrap();

        let (first, second) = tokio::join!(
            c.toggle_skill("a1", "cpr"),
            c.toggle_skill("a1", "bandaging")
        );
        assert_eq!(first.unwrap().selection.ids(), &["cpr".to_string()]);
        assert_eq!(
            second.unwrap().selection.ids(),
            &["cpr".to_string(), "bandaging".to_string()]
        );

        let (_, _, last) = tokio::join!(
            c.toggle_skill("a1", "level_basic"),
            c.toggle_skill("a1", "level_nurse"),
            c.toggle_skill("a1", "level_doctor")
        );
        assert_eq!(
            last.unwrap().selection.ids(),
            &["cpr".to_string(), "bandaging".to_string(), "level_doctor".to_string()]
        );

        let stored: SkillSelection = c.store("a1").load().await.unwrap();
        let levels = stored.ids().iter().filter(|id| id.starts_with("level_")).count();
        assert_eq!(levels, 1);
        assert_eq!(stored.ids().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_toggles_are_all_kept() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;

        let ids = ["cpr", "bandaging", "splinting", "swimming", "boat_handling"];
        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let c = Arc::clone(&c);
                tokio::spawn(async move { c.toggle_skill("a1", id).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored: SkillSelection = c.store("a1").load().await.unwrap();
        for id in ids {
            assert!(stored.contains(id), "{id} was lost");
        }
        assert_eq!(stored.ids().len(), ids.len());
    }

    #[tokio::test]
    async fn corrupt_session_restarts_wizard() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;

        let stored = c.db.get_draft("a1", "onboardingSession").await.unwrap().unwrap();
        let mut raw: serde_json::Value = serde_json::from_str(&stored.value).unwrap();
        raw["sequencer"]["current_stage_index"] = 9.into();
        c.db.put_draft("a1", "onboardingSession", &raw.to_string())
            .await
            .unwrap();

        let status = c.status("a1").await.unwrap();
        assert_eq!(status.position.stage, Stage::PersonalInfo);
        assert!(matches!(
            c.enter(&applicant("a1"), Stage::PersonalInfo).await.unwrap(),
            StageEntry::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn idle_applicant_locks_are_released() {
        let (c, _) = controller_with(Stubs::default()).await;
        for n in 0..20 {
            c.status(&format!("a{n}")).await.unwrap();
        }
        assert_eq!(c.locks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn upload_lifecycle_gates_commit() {
        let (c, stubs) = controller_with(Stubs {
            upload_gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
        .await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;
        pass_skills(&c, "a1").await;

        let mut events = c.subscribe();
        let entry = c
            .start_document_upload(
                "a1",
                "first_aid",
                DocumentFile {
                    file_name: "a.pdf".into(),
                    content_type: Some("application/pdf".into()),
                    bytes: vec![1, 2, 3],
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            c.commit_documents("a1", false).await,
            Err(Error::Onboarding(OnboardingError::UploadsOutstanding { count: 1 }))
        ));
        assert!(matches!(
            c.remove_document("a1", entry.id).await,
            Err(Error::Onboarding(OnboardingError::DocumentUploading(_)))
        ));

        stubs.upload_gate.as_ref().unwrap().add_permits(1);
        let updated = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(OnboardingEvent::DocumentUpdated { entry, .. }) = events.recv().await {
                    return entry;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated.id, entry.id);

        let payload = c.commit_documents("a1", false).await.unwrap();
        assert_eq!(payload.documents.len(), 1);
        assert_eq!(payload.documents[0].file_url, "https://files.example/a.pdf");
        assert_eq!(payload.documents[0].file_type_id, "first_aid");

        let done = c.advance("a1").await.unwrap();
        assert!(done.position.onboarding_complete);
        assert_eq!(stubs.skills.lock().unwrap()[0], vec!["cpr".to_string()]);
    }

    #[tokio::test]
    async fn failed_upload_removes_entry() {
        let (c, _) = controller_with(Stubs {
            upload_error: Some("file too large".into()),
            ..Default::default()
        })
        .await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;
        pass_skills(&c, "a1").await;

        let mut events = c.subscribe();
        let entry = c
            .start_document_upload(
                "a1",
                "lifeguard",
                DocumentFile {
                    file_name: "big.pdf".into(),
                    content_type: None,
                    bytes: vec![0; 8],
                },
            )
            .await
            .unwrap();

        let (failed, reason) = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(OnboardingEvent::DocumentFailed { entry, reason, .. }) = events.recv().await {
                    return (entry, reason);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed.id, entry.id);
        assert!(reason.contains("file too large"));

        match c.enter(&applicant("a1"), Stage::DocumentUpload).await.unwrap() {
            StageEntry::Allowed(StageView {
                data: StageData::DocumentUpload { entries, can_commit, .. },
                ..
            }) => {
                assert!(entries.entries().is_empty());
                assert!(can_commit);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_cert_type_rejected() {
        let (c, _) = controller_with(Stubs::default()).await;
        let err = c
            .start_document_upload(
                "a1",
                "pilot",
                DocumentFile {
                    file_name: "x.pdf".into(),
                    content_type: None,
                    bytes: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Onboarding(OnboardingError::UnknownCertType(_))));
    }

    #[tokio::test]
    async fn skipping_documents_completes_onboarding() {
        let (c, stubs) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;
        pass_skills(&c, "a1").await;

        let mut events = c.subscribe();
        assert!(c.advance("a1").await.is_err());
        let payload = c.commit_documents("a1", true).await.unwrap();
        assert!(payload.documents.is_empty());
        c.advance("a1").await.unwrap();

        let complete = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(OnboardingEvent::OnboardingComplete { applicant_id }) = events.recv().await {
                    return applicant_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(complete, "a1");
        assert_eq!(stubs.commits.lock().unwrap().len(), 1);

        // Locally recorded completion closes the wizard even if the oracle lags.
        assert!(matches!(
            c.enter(&applicant("a1"), Stage::SkillSelection).await.unwrap(),
            StageEntry::Redirect(Route::Profile)
        ));
        assert!(matches!(
            c.access(&applicant("a1"), Some(Stage::PersonalInfo)).await.unwrap(),
            Access::Refused(GateOutcome::RedirectTo(Route::Profile))
        ));
        assert!(matches!(
            c.restart("a1").await,
            Err(Error::Onboarding(OnboardingError::AlreadyComplete))
        ));
    }

    #[tokio::test]
    async fn session_resumes_across_controllers() {
        let db = memory_db().await;
        let stubs = Arc::new(Stubs::default());
        let first = OnboardingController::new(
            Arc::clone(&db),
            Catalog::default(),
            true,
            Collaborators::from_shared(Arc::clone(&stubs)),
        );
        fill_personal_info(&first, "a1").await;
        first.answer_consent("a1", 0, true).await.unwrap();

        let second = OnboardingController::new(
            db,
            Catalog::default(),
            true,
            Collaborators::from_shared(stubs),
        );
        let status = second.status("a1").await.unwrap();
        assert_eq!(status.position.stage, Stage::PrerequisiteConsent);
        assert_eq!(status.position.sub_step, 1);
    }

    #[tokio::test]
    async fn restart_clears_drafts() {
        let (c, _) = controller_with(Stubs::default()).await;
        fill_personal_info(&c, "a1").await;

        let position = c.restart("a1").await.unwrap();
        assert_eq!(position.stage, Stage::PersonalInfo);
        match c.enter(&applicant("a1"), Stage::PersonalInfo).await.unwrap() {
            StageEntry::Allowed(StageView {
                data: StageData::PersonalInfo { draft, .. },
                ..
            }) => assert_eq!(draft, PersonalInfoDraft::default()),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[tokio::test]
    async fn document_stage_can_be_disabled() {
        let stubs = Arc::new(Stubs::default());
        let c = OnboardingController::new(
            memory_db().await,
            Catalog::default(),
            false,
            Collaborators::from_shared(Arc::clone(&stubs)),
        );
        fill_personal_info(&c, "a1").await;
        pass_consent(&c, "a1").await;
        pass_skills(&c, "a1").await;

        let status = c.status("a1").await.unwrap();
        assert!(status.position.onboarding_complete);
        assert!(!status.position.stages.contains(&Stage::DocumentUpload));
    }

    #[tokio::test]
    async fn access_requires_applicant() {
        let (c, _) = controller_with(Stubs::default()).await;
        assert_eq!(
            c.access(&AuthSnapshot::anonymous(), Some(Stage::Auth)).await.unwrap(),
            Access::Refused(GateOutcome::RedirectTo(Route::Registration))
        );
        assert_eq!(
            c.access(&AuthSnapshot::pending(), None).await.unwrap(),
            Access::Refused(GateOutcome::Pending)
        );
        assert_eq!(
            c.access(&applicant("a1"), None).await.unwrap(),
            Access::Granted("a1".into())
        );
    }

    #[test]
    fn event_json_shape() {
        let event = OnboardingEvent::StageChanged {
            applicant_id: "a1".into(),
            stage: Stage::SkillSelection,
            sub_step: 1,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "type": "stage_changed",
                "applicantId": "a1",
                "stage": "skill_selection",
                "subStep": 1,
            })
        );
    }
}
