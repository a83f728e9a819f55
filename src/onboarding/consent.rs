//! Prerequisite consent answers and the atomic submission.
//!
//! A question is only passed with a "yes". A "no" keeps the applicant on that
//! question and shows its rejection message. Once every answer is "yes" the
//! answers can be sealed into a [`ConsentRecord`], the only thing the
//! submitter accepts, so a partial consent can never be transmitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::catalog::PrerequisiteQuestion;
use crate::error::{OnboardingError, RemoteError};
use crate::remote::ConsentApi;

/// One boolean per prerequisite question; `true` means affirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsentAnswers {
    answers: Vec<bool>,
}

/// What happened after answering a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsentOutcome {
    /// Answer recorded; the applicant moves to `next_question`.
    Accepted { next_question: usize },
    /// Every question is affirmed; the completion screen is shown.
    Completed,
    /// The applicant answered "no" and stays on `question`.
    Rejected { question: usize, message: String },
}

impl ConsentOutcome {
    /// Within-stage index the applicant should be on after this outcome,
    /// or `None` when it does not move.
    pub fn next_sub_step(&self, question_count: usize) -> Option<usize> {
        match self {
            Self::Accepted { next_question } => Some(*next_question),
            Self::Completed => Some(question_count),
            Self::Rejected { .. } => None,
        }
    }
}

/// The all-affirmative consent payload. Only [`ConsentAnswers::seal`] builds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConsentRecord {
    flags: BTreeMap<String, bool>,
}

impl ConsentRecord {
    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }
}

impl ConsentAnswers {
    pub fn new(question_count: usize) -> Self {
        Self {
            answers: vec![false; question_count],
        }
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn is_affirmed(&self, index: usize) -> bool {
        self.answers.get(index).copied().unwrap_or(false)
    }

    pub fn all_affirmed(&self) -> bool {
        self.answers.iter().all(|a| *a)
    }

    pub fn first_unaffirmed(&self) -> Option<usize> {
        self.answers.iter().position(|a| !*a)
    }

    /// Answer the question the applicant is currently on.
    ///
    /// `current` is the stage's within-stage index. A "no" only clears the
    /// answered question; the other questions keep their answers.
    pub fn answer(
        &mut self,
        current: usize,
        index: usize,
        yes: bool,
        questions: &[PrerequisiteQuestion],
    ) -> Result<ConsentOutcome, OnboardingError> {
        if index != current || index >= self.answers.len() {
            return Err(OnboardingError::WrongQuestion { index, current });
        }

        if !yes {
            self.answers[index] = false;
            let message = questions
                .get(index)
                .map(|q| q.rejection_message.clone())
                .unwrap_or_default();
            return Ok(ConsentOutcome::Rejected {
                question: index,
                message,
            });
        }

        self.answers[index] = true;
        let next = index + 1;
        if next < self.answers.len() {
            return Ok(ConsentOutcome::Accepted {
                next_question: next,
            });
        }
        match self.first_unaffirmed() {
            None => Ok(ConsentOutcome::Completed),
            Some(open) => Ok(ConsentOutcome::Accepted {
                next_question: open,
            }),
        }
    }

    /// Build the submission payload if, and only if, every answer is "yes".
    pub fn seal(&self, questions: &[PrerequisiteQuestion]) -> Option<ConsentRecord> {
        if questions.len() != self.answers.len() || !self.all_affirmed() {
            return None;
        }
        let flags = questions.iter().map(|q| (q.id.clone(), true)).collect();
        Some(ConsentRecord { flags })
    }
}

/// Commits a sealed consent record to the remote service.
pub struct ConsentSubmitter {
    api: Arc<dyn ConsentApi>,
}

impl ConsentSubmitter {
    pub fn new(api: Arc<dyn ConsentApi>) -> Self {
        Self { api }
    }

    /// Send the record. A failure leaves every local answer untouched.
    pub async fn submit(&self, applicant_id: &str, record: &ConsentRecord) -> Result<(), RemoteError> {
        match self.api.submit_consent(applicant_id, record).await {
            Ok(()) => {
                info!(applicant = %applicant_id, flags = record.flags().len(), "Consent submitted");
                Ok(())
            }
            Err(e) => {
                warn!(applicant = %applicant_id, error = %e, "Consent submission failed");
                Err(e)
            }
        }
    }
}
