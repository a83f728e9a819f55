//! Stage gate. Decides whether a stage may be entered or must redirect.
//!
//! Every stage consults the same `evaluate` function. While the auth state is
//! still resolving the outcome is `Pending`: nothing is rendered and nothing
//! redirects until the oracle has answered.

use serde::{Deserialize, Serialize};

use super::state::Stage;

/// Claims about the caller, as reported by the auth oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub is_authenticated: bool,
    pub onboarding_complete: bool,
    pub is_loading: bool,
}

impl AuthState {
    /// State reported while the oracle has not answered yet.
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(onboarding_complete: bool) -> Self {
        Self {
            is_authenticated: true,
            onboarding_complete,
            is_loading: false,
        }
    }
}

/// Where a redirect sends the applicant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Registration,
    Profile,
    /// A specific wizard stage (used when the applicant asks for a stage they
    /// have not reached yet).
    Stage(Stage),
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Self::Registration => "/register".to_string(),
            Self::Profile => "/profile".to_string(),
            Self::Stage(stage) => format!("/onboarding/{}", stage.slug()),
        }
    }
}

/// Outcome of a gate evaluation. Exactly one applies to every input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Auth is still resolving: neither render nor redirect.
    Pending,
    Allow,
    RedirectTo(Route),
}

impl GateOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Evaluate the gate for `stage`. Pure and total.
pub fn evaluate(stage: Stage, auth: &AuthState) -> GateOutcome {
    if auth.is_loading {
        return GateOutcome::Pending;
    }
    if !auth.is_authenticated && stage.requires_auth() {
        return GateOutcome::RedirectTo(Route::Registration);
    }
    if auth.onboarding_complete && stage.is_onboarding_stage() {
        return GateOutcome::RedirectTo(Route::Profile);
    }
    GateOutcome::Allow
}
