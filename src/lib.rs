//! Rescue Onboard: rescuer applicant onboarding service.

pub mod config;
pub mod error;
pub mod onboarding;
pub mod remote;
pub mod store;
