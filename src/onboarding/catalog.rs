//! Static onboarding content: prerequisite questions and certificate types.

use serde::{Deserialize, Serialize};

/// A yes/no prerequisite an applicant must affirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteQuestion {
    /// Flag name used in the consent payload.
    pub id: String,
    pub prompt: String,
    /// Shown when the applicant answers "no".
    pub rejection_message: String,
}

/// A kind of certificate an applicant can upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertType {
    pub id: String,
    pub label: String,
}

/// Question list and certificate types for the wizard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub questions: Vec<PrerequisiteQuestion>,
    pub cert_types: Vec<CertType>,
}

impl Catalog {
    pub fn cert_type(&self, id: &str) -> Option<&CertType> {
        self.cert_types.iter().find(|c| c.id == id)
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }
}

fn question(id: &str, prompt: &str, rejection_message: &str) -> PrerequisiteQuestion {
    PrerequisiteQuestion {
        id: id.to_string(),
        prompt: prompt.to_string(),
        rejection_message: rejection_message.to_string(),
    }
}

fn cert(id: &str, label: &str) -> CertType {
    CertType {
        id: id.to_string(),
        label: label.to_string(),
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            questions: vec![
                question(
                    "isAdult",
                    "Are you at least 18 years old?",
                    "Rescuers must be adults. You can come back once you turn 18.",
                ),
                question(
                    "isHealthy",
                    "Are you in good health to take part in field rescue work?",
                    "Field rescue work is physically demanding. Please talk to us about support roles instead.",
                ),
                question(
                    "acceptsTraining",
                    "Do you agree to complete the mandatory safety training?",
                    "Safety training is required before joining any rescue.",
                ),
                question(
                    "acceptsCodeOfConduct",
                    "Do you agree to follow the rescuer code of conduct?",
                    "Every rescuer must follow the code of conduct.",
                ),
            ],
            cert_types: vec![
                cert("first_aid", "First aid certificate"),
                cert("lifeguard", "Lifeguard certificate"),
                cert("medical_license", "Medical practice license"),
                cert("driving_license", "Driving license"),
                cert("other", "Other certificate"),
            ],
        }
    }
}
