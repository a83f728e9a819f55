//! Configuration types.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Service configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port for the HTTP/WebSocket server.
    pub port: u16,
    /// Path of the libSQL database file holding drafts and sessions.
    pub db_path: PathBuf,
    /// Base URL of the rescue service (consent, documents, skills, auth).
    pub api_base_url: String,
    /// Service token sent as a bearer credential on outbound calls.
    pub api_token: Option<SecretString>,
    /// Base URL of the reverse-geocoding service. Geocoding is disabled when unset.
    pub geocode_base_url: Option<String>,
    /// Local JSON file overriding the remote skill taxonomy.
    pub skill_taxonomy_path: Option<PathBuf>,
    /// Whether the flow includes the optional document upload stage.
    pub include_document_stage: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/rescue-onboard.db"),
            api_base_url: "http://127.0.0.1:3000".to_string(),
            api_token: None,
            geocode_base_url: None,
            skill_taxonomy_path: None,
            include_document_stage: true,
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("RESCUE_ONBOARD_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "RESCUE_ONBOARD_PORT".to_string(),
                message: format!("'{raw}' is not a valid port"),
            })?,
            None => defaults.port,
        };

        let db_path = lookup("RESCUE_ONBOARD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let api_base_url = lookup("RESCUE_API_BASE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("RESCUE_API_BASE_URL".to_string()))?;

        let api_token = lookup("RESCUE_API_TOKEN")
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let geocode_base_url = lookup("RESCUE_GEOCODE_BASE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let skill_taxonomy_path = lookup("RESCUE_SKILL_TAXONOMY_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let include_document_stage = match lookup("ONBOARDING_DOCUMENT_STAGE") {
            Some(raw) => parse_bool("ONBOARDING_DOCUMENT_STAGE", &raw)?,
            None => defaults.include_document_stage,
        };

        Ok(Self {
            port,
            db_path,
            api_base_url,
            api_token,
            geocode_base_url,
            skill_taxonomy_path,
            include_document_stage,
        })
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config =
            AppConfig::from_lookup(lookup_from(&[("RESCUE_API_BASE_URL", "https://api.test/")]))
                .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_base_url, "https://api.test");
        assert!(config.api_token.is_none());
        assert!(config.geocode_base_url.is_none());
        assert!(config.include_document_stage);
    }

    #[test]
    fn missing_base_url_is_an_error() {
        let err = AppConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "RESCUE_API_BASE_URL"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("RESCUE_API_BASE_URL", "https://api.test"),
            ("RESCUE_ONBOARD_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn document_stage_can_be_disabled() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("RESCUE_API_BASE_URL", "https://api.test"),
            ("ONBOARDING_DOCUMENT_STAGE", "off"),
            ("RESCUE_GEOCODE_BASE_URL", "https://geo.test/"),
        ]))
        .unwrap();
        assert!(!config.include_document_stage);
        assert_eq!(config.geocode_base_url.as_deref(), Some("https://geo.test"));
    }

    #[test]
    fn bad_boolean_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("RESCUE_API_BASE_URL", "https://api.test"),
            ("ONBOARDING_DOCUMENT_STAGE", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
