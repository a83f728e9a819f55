//! Onboarding state machine: which stage the applicant is in.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::OnboardingError;

/// The stages of the rescuer onboarding wizard.
///
/// Progresses linearly: Auth → PersonalInfo → PrerequisiteConsent →
/// SkillSelection → [DocumentUpload] → Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Auth,
    PersonalInfo,
    PrerequisiteConsent,
    SkillSelection,
    DocumentUpload,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Auth,
        Stage::PersonalInfo,
        Stage::PrerequisiteConsent,
        Stage::SkillSelection,
        Stage::DocumentUpload,
        Stage::Complete,
    ];

    /// Whether entering this stage requires an authenticated applicant.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Auth)
    }

    /// Whether this stage is part of the wizard proper (everything but the
    /// terminal screen).
    pub fn is_onboarding_stage(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether this stage is terminal (onboarding is done).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Whether the stage carries a secondary within-stage index.
    pub fn has_sub_steps(&self) -> bool {
        matches!(self, Self::PrerequisiteConsent | Self::SkillSelection)
    }

    /// URL slug used by the HTTP surface.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::PersonalInfo => "personal-info",
            Self::PrerequisiteConsent => "prerequisites",
            Self::SkillSelection => "skills",
            Self::DocumentUpload => "documents",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::PersonalInfo => "personal_info",
            Self::PrerequisiteConsent => "prerequisite_consent",
            Self::SkillSelection => "skill_selection",
            Self::DocumentUpload => "document_upload",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Stage {
    type Err = OnboardingError;

    /// Accepts both the slug and the snake_case name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.slug() == s || stage.to_string() == s)
            .ok_or_else(|| OnboardingError::UnknownStage(s.to_string()))
    }
}

/// Whether the current stage's completion predicate holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCompletion {
    Ready,
    Blocked(String),
}

/// Outcome of a `retreat()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Retreat {
    /// Moved back inside the current stage.
    SubStep { stage: Stage, sub_step: usize },
    /// Moved to the previous stage.
    Stage { stage: Stage, sub_step: usize },
    /// Backed out of the first stage; the wizard is left entirely.
    Exited,
}

/// Ordered stage list plus the transition function.
///
/// Serialized as part of the applicant's session so that the wizard position
/// survives reloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSequencer {
    stages: Vec<Stage>,
    current_stage_index: usize,
    /// Furthest stage index ever reached.
    furthest_index: usize,
    completed_stages: BTreeSet<Stage>,
    visited: BTreeSet<Stage>,
    sub_steps: BTreeMap<Stage, usize>,
}

impl StepSequencer {
    /// Start a new wizard at the `Auth` stage.
    pub fn new(include_documents: bool) -> Self {
        let stages: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| include_documents || *s != Stage::DocumentUpload)
            .collect();
        Self {
            stages,
            current_stage_index: 0,
            furthest_index: 0,
            completed_stages: BTreeSet::new(),
            visited: BTreeSet::from([Stage::Auth]),
            sub_steps: BTreeMap::new(),
        }
    }

    /// Start a wizard for an applicant whose account already exists: `Auth`
    /// is completed and the applicant lands on `PersonalInfo`.
    pub fn for_authenticated(include_documents: bool) -> Self {
        let mut seq = Self::new(include_documents);
        seq.move_forward();
        seq
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn current(&self) -> Stage {
        self.stages[self.current_stage_index]
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn completed_stages(&self) -> &BTreeSet<Stage> {
        &self.completed_stages
    }

    pub fn includes(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_complete(&self) -> bool {
        self.current().is_terminal()
    }

    /// Furthest stage the applicant has reached.
    pub fn furthest(&self) -> Stage {
        self.stages[self.furthest_index]
    }

    /// Within-stage index for the current stage.
    pub fn sub_step(&self) -> usize {
        self.sub_step_of(self.current())
    }

    pub fn sub_step_of(&self, stage: Stage) -> usize {
        self.sub_steps.get(&stage).copied().unwrap_or(0)
    }

    /// Move the within-stage index of the current stage.
    pub fn set_sub_step(&mut self, sub_step: usize) {
        let stage = self.current();
        if stage.has_sub_steps() {
            self.sub_steps.insert(stage, sub_step);
        }
    }

    /// Move one stage forward if the completion predicate holds.
    pub fn advance(&mut self, completion: StageCompletion) -> Result<Stage, OnboardingError> {
        let current = self.current();
        if current.is_terminal() {
            return Err(OnboardingError::AlreadyComplete);
        }
        if let StageCompletion::Blocked(reason) = completion {
            return Err(OnboardingError::TransitionBlocked {
                stage: current,
                reason,
            });
        }
        Ok(self.move_forward())
    }

    fn move_forward(&mut self) -> Stage {
        let left = self.current();
        self.completed_stages.insert(left);
        self.current_stage_index += 1;
        self.furthest_index = self.furthest_index.max(self.current_stage_index);

        let entered = self.current();
        if self.visited.insert(entered) {
            self.sub_steps.remove(&entered);
        }
        entered
    }

    /// Step back: within the stage first, then to the previous stage.
    pub fn retreat(&mut self) -> Result<Retreat, OnboardingError> {
        let current = self.current();
        if current.is_terminal() {
            return Err(OnboardingError::AlreadyComplete);
        }

        let sub_step = self.sub_step();
        if current.has_sub_steps() && sub_step > 0 {
            self.sub_steps.insert(current, sub_step - 1);
            return Ok(Retreat::SubStep {
                stage: current,
                sub_step: sub_step - 1,
            });
        }

        if self.current_stage_index == 0 {
            return Ok(Retreat::Exited);
        }

        self.current_stage_index -= 1;
        let stage = self.current();
        Ok(Retreat::Stage {
            stage,
            sub_step: self.sub_step_of(stage),
        })
    }

    /// Jump to a stage the applicant has already reached.
    pub fn jump_to(&mut self, target: Stage) -> Result<(), OnboardingError> {
        if self.is_complete() {
            return Err(OnboardingError::AlreadyComplete);
        }
        let index = self
            .stages
            .iter()
            .position(|s| *s == target)
            .ok_or_else(|| OnboardingError::UnknownStage(target.to_string()))?;
        if index > self.furthest_index {
            return Err(OnboardingError::StageNotReached {
                current: self.current(),
                target,
            });
        }
        self.current_stage_index = index;
        Ok(())
    }

    /// Reject a sequencer whose indices or stage list could not have been
    /// produced by the transitions above.
    pub fn check(&self) -> Result<(), String> {
        match (self.stages.first(), self.stages.last()) {
            (Some(Stage::Auth), Some(Stage::Complete)) => {}
            _ => return Err(format!("stage list {:?} must run from auth to complete", self.stages)),
        }
        if !self.stages.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(format!("stage list {:?} is out of order", self.stages));
        }
        if self.furthest_index >= self.stages.len() {
            return Err(format!(
                "furthest index {} is past {} stages",
                self.furthest_index,
                self.stages.len()
            ));
        }
        if self.current_stage_index > self.furthest_index {
            return Err(format!(
                "current index {} is ahead of furthest index {}",
                self.current_stage_index, self.furthest_index
            ));
        }
        Ok(())
    }
}
