//! Remote collaborators: auth oracle, rescue API, geocoder.
//!
//! Each concern is a trait so the controller can be driven by stubs in tests.
//! `RescueApiClient` implements all of them over HTTP.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::{Error, RemoteError};
use crate::onboarding::consent::ConsentRecord;
use crate::onboarding::documents::DocumentCommit;
use crate::onboarding::gate::AuthState;
use crate::onboarding::model::{GeocodedAddress, ValidatedPersonalInfo};
use crate::onboarding::skills::SkillTaxonomy;

/// Who the caller is and what the oracle says about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub applicant_id: Option<String>,
    pub state: AuthState,
}

impl AuthSnapshot {
    pub fn pending() -> Self {
        Self {
            applicant_id: None,
            state: AuthState::loading(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            applicant_id: None,
            state: AuthState::anonymous(),
        }
    }

    pub fn authenticated(applicant_id: impl Into<String>, onboarding_complete: bool) -> Self {
        Self {
            applicant_id: Some(applicant_id.into()),
            state: AuthState::authenticated(onboarding_complete),
        }
    }
}

#[async_trait]
pub trait AuthOracle: Send + Sync {
    /// Resolve a bearer token. Never fails: an oracle that cannot answer
    /// reports a loading state.
    async fn resolve(&self, token: Option<&str>) -> AuthSnapshot;
}

#[async_trait]
pub trait ConsentApi: Send + Sync {
    async fn submit_consent(
        &self,
        applicant_id: &str,
        record: &ConsentRecord,
    ) -> Result<(), RemoteError>;
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait DocumentUploadApi: Send + Sync {
    /// Upload one file and return its URL.
    async fn upload(&self, applicant_id: &str, file: DocumentFile) -> Result<String, RemoteError>;
}

#[async_trait]
pub trait DocumentCommitApi: Send + Sync {
    async fn commit_documents(
        &self,
        applicant_id: &str,
        commit: &DocumentCommit,
    ) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait SkillTaxonomyLoader: Send + Sync {
    async fn load(&self) -> Result<SkillTaxonomy, Error>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(&self, lat: f64, lon: f64) -> Result<GeocodedAddress, RemoteError>;
}

/// Profile checkpoints sent when leaving the personal-info and skill stages.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn submit_personal_info(
        &self,
        applicant_id: &str,
        info: &ValidatedPersonalInfo,
    ) -> Result<(), RemoteError>;

    async fn submit_skills(&self, applicant_id: &str, skill_ids: &[String])
    -> Result<(), RemoteError>;
}

const RESCUE_API: &str = "rescue-api";
const AUTH: &str = "auth";
const GEOCODER: &str = "geocoder";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    id: String,
    #[serde(default)]
    onboarding_complete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_url: String,
}

/// HTTP client for the rescue service and the reverse geocoder.
pub struct RescueApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
    geocode_base_url: Option<String>,
}

impl RescueApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        geocode_base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            geocode_base_url: geocode_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.geocode_base_url.clone(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `{base}/rescuers/{applicant_id}/{tail..}`, with every part
    /// percent-encoded as a single path segment.
    fn rescuer_url(&self, applicant_id: &str, tail: &[&str]) -> Result<Url, RemoteError> {
        let invalid = |reason: String| RemoteError::RequestFailed {
            service: RESCUE_API.to_string(),
            reason,
        };
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("invalid base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("base URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("rescuers")
            .push(applicant_id)
            .extend(tail);
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        service: &str,
    ) -> Result<Response, RemoteError> {
        let resp = req.send().await.map_err(|e| RemoteError::RequestFailed {
            service: service.to_string(),
            reason: e.to_string(),
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::AuthFailed {
                service: service.to_string(),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::Rejected {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        resp: Response,
        service: &str,
    ) -> Result<T, RemoteError> {
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse {
                service: service.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl AuthOracle for RescueApiClient {
    async fn resolve(&self, token: Option<&str>) -> AuthSnapshot {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return AuthSnapshot::anonymous();
        };
        let req = self.client.get(self.url("/auth/me")).bearer_auth(token);
        match self.send(req, AUTH).await {
            Ok(resp) => match Self::json::<MeResponse>(resp, AUTH).await {
                Ok(me) => AuthSnapshot::authenticated(me.id, me.onboarding_complete),
                Err(e) => {
                    tracing::warn!(error = %e, "Auth oracle returned an unreadable answer");
                    AuthSnapshot::pending()
                }
            },
            Err(RemoteError::AuthFailed { .. }) => AuthSnapshot::anonymous(),
            Err(e) => {
                tracing::warn!(error = %e, "Auth oracle unavailable, reporting pending");
                AuthSnapshot::pending()
            }
        }
    }
}

#[async_trait]
impl ConsentApi for RescueApiClient {
    async fn submit_consent(
        &self,
        applicant_id: &str,
        record: &ConsentRecord,
    ) -> Result<(), RemoteError> {
        let req = self
            .client
            .post(self.rescuer_url(applicant_id, &["prerequisites"])?)
            .json(record);
        self.send(self.authorized(req), RESCUE_API).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentUploadApi for RescueApiClient {
    async fn upload(&self, applicant_id: &str, file: DocumentFile) -> Result<String, RemoteError> {
        let mut part = Part::bytes(file.bytes).file_name(file.file_name.clone());
        if let Some(mime) = &file.content_type {
            part = part
                .mime_str(mime)
                .map_err(|e| RemoteError::RequestFailed {
                    service: RESCUE_API.to_string(),
                    reason: format!("invalid content type {mime}: {e}"),
                })?;
        }
        let form = Form::new().part("file", part);
        let req = self
            .client
            .post(self.rescuer_url(applicant_id, &["documents", "files"])?)
            .multipart(form);
        let resp = self.send(self.authorized(req), RESCUE_API).await?;
        let uploaded: UploadResponse = Self::json(resp, RESCUE_API).await?;
        tracing::debug!(file = %file.file_name, "Document uploaded");
        Ok(uploaded.file_url)
    }
}

#[async_trait]
impl DocumentCommitApi for RescueApiClient {
    async fn commit_documents(
        &self,
        applicant_id: &str,
        commit: &DocumentCommit,
    ) -> Result<(), RemoteError> {
        let req = self
            .client
            .post(self.rescuer_url(applicant_id, &["documents"])?)
            .json(commit);
        self.send(self.authorized(req), RESCUE_API).await?;
        Ok(())
    }
}

#[async_trait]
impl SkillTaxonomyLoader for RescueApiClient {
    async fn load(&self) -> Result<SkillTaxonomy, Error> {
        let req = self.client.get(self.url("/skills/taxonomy"));
        let resp = self.send(self.authorized(req), RESCUE_API).await?;
        let taxonomy: SkillTaxonomy = Self::json(resp, RESCUE_API).await?;
        tracing::info!(categories = taxonomy.category_count(), "Loaded skill taxonomy");
        Ok(taxonomy)
    }
}

#[async_trait]
impl Geocoder for RescueApiClient {
    async fn reverse(&self, lat: f64, lon: f64) -> Result<GeocodedAddress, RemoteError> {
        let Some(base) = &self.geocode_base_url else {
            return Err(RemoteError::RequestFailed {
                service: GEOCODER.to_string(),
                reason: "no geocoder configured".to_string(),
            });
        };
        let req = self
            .client
            .get(format!("{base}/reverse"))
            .query(&[("lat", lat), ("lon", lon)]);
        let resp = self.send(req, GEOCODER).await?;
        Self::json(resp, GEOCODER).await
    }
}

#[async_trait]
impl ProfileApi for RescueApiClient {
    async fn submit_personal_info(
        &self,
        applicant_id: &str,
        info: &ValidatedPersonalInfo,
    ) -> Result<(), RemoteError> {
        let req = self
            .client
            .put(self.rescuer_url(applicant_id, &["profile"])?)
            .json(info);
        self.send(self.authorized(req), RESCUE_API).await?;
        Ok(())
    }

    async fn submit_skills(
        &self,
        applicant_id: &str,
        skill_ids: &[String],
    ) -> Result<(), RemoteError> {
        let req = self
            .client
            .put(self.rescuer_url(applicant_id, &["skills"])?)
            .json(&serde_json::json!({ "skillIds": skill_ids }));
        self.send(self.authorized(req), RESCUE_API).await?;
        Ok(())
    }
}
