//! Rescuer onboarding: the staged wizard an applicant completes before
//! joining rescues.
//!
//! Stages run in a fixed order: account, personal info, prerequisite consent,
//! skill self-assessment and an optional document upload. Every stage's
//! draft is persisted as it changes so the wizard can be resumed later.

pub mod catalog;
pub mod consent;
pub mod documents;
pub mod gate;
pub mod manager;
pub mod model;
pub mod progress;
pub mod routes;
pub mod skills;
pub mod state;

pub use gate::{AuthState, GateOutcome, Route, evaluate};
pub use manager::{Collaborators, OnboardingController, OnboardingEvent, StageEntry};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use state::{Stage, StepSequencer};
