//! Applicant session and personal-info data models.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::consent::ConsentAnswers;
use super::state::StepSequencer;
use crate::error::FieldError;

/// Characters people type between phone digits.
static PHONE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-.()]").expect("phone separator pattern"));

static NINE_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{9}$").expect("nine digit pattern"));

/// The applicant's personal profile as typed so far.
///
/// Persisted under the `personalInfo` namespace. Every field defaults to the
/// empty string so a partially written draft loads cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonalInfoDraft {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub address: String,
    pub ward: String,
    pub district: String,
    pub city: String,
}

/// A personal-info draft that passed validation, phone normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedPersonalInfo {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub address: String,
    pub ward: String,
    pub district: String,
    pub city: String,
}

/// Result of a reverse-geocoding lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodedAddress {
    pub address: String,
    pub ward: String,
    pub district: String,
    pub city: String,
}

/// Normalize a phone number to its 9 significant digits.
///
/// Separators, a `+84` country prefix and leading zeros are stripped.
/// Returns `None` when what remains is not exactly 9 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let compact = PHONE_SEPARATORS.replace_all(raw.trim(), "");
    let local = compact.strip_prefix("+84").unwrap_or(compact.as_ref());
    let significant = local.trim_start_matches('0');
    NINE_DIGITS
        .is_match(significant)
        .then(|| significant.to_string())
}

impl PersonalInfoDraft {
    /// Check the stage's completion predicate. Reports every failing field.
    pub fn validate(&self) -> Result<ValidatedPersonalInfo, Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.first_name.trim().is_empty() {
            errors.push(FieldError::new("firstName", "First name is required"));
        }
        if self.city.trim().is_empty() {
            errors.push(FieldError::new("city", "City is required"));
        }

        let phone = if self.phone.trim().is_empty() {
            None
        } else {
            match normalize_phone(&self.phone) {
                Some(p) => Some(p),
                None => {
                    errors.push(FieldError::new(
                        "phone",
                        "Phone number must have exactly 9 digits after the leading zero",
                    ));
                    None
                }
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidatedPersonalInfo {
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            phone,
            address: self.address.trim().to_string(),
            ward: self.ward.trim().to_string(),
            district: self.district.trim().to_string(),
            city: self.city.trim().to_string(),
        })
    }

    /// Fill address fields from a geocoding result. Blank results leave the
    /// existing value alone.
    pub fn apply_geocode(&mut self, found: &GeocodedAddress) {
        let pairs = [
            (&mut self.address, &found.address),
            (&mut self.ward, &found.ward),
            (&mut self.district, &found.district),
            (&mut self.city, &found.city),
        ];
        for (field, value) in pairs {
            if !value.trim().is_empty() {
                *field = value.trim().to_string();
            }
        }
    }
}

/// One applicant's pass through the wizard.
///
/// Persisted under the `onboardingSession` namespace and rewritten after every
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingSession {
    pub applicant_id: String,
    pub sequencer: StepSequencer,
    pub consent: ConsentAnswers,
    #[serde(default)]
    pub consent_submitted: bool,
    #[serde(default)]
    pub documents_committed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingSession {
    /// Create the session on an applicant's first authenticated visit.
    pub fn start(applicant_id: &str, include_documents: bool, question_count: usize) -> Self {
        let now = Utc::now();
        Self {
            applicant_id: applicant_id.to_string(),
            sequencer: StepSequencer::for_authenticated(include_documents),
            consent: ConsentAnswers::new(question_count),
            consent_submitted: false,
            documents_committed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sequencer.is_complete()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
