use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("At least one project must be configured")]
    NoProjects,

    #[error("Duplicate project {project_id} for instance {host}")]
    DuplicateProject { host: String, project_id: u32 },

    #[error("REDCap URL has no host: {0}")]
    MissingHost(Url),

    #[error("Empty {field} for project {project_id}")]
    EmptyProjectField {
        project_id: u32,
        field: &'static str,
    },

    #[error("Empty OAuth client id")]
    EmptyClientId,

    #[error("Trigger path must start with '/': {0}")]
    InvalidTriggerPath(String),
}

/// What the pipeline does when the record fetch from REDCap fails.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailurePolicy {
    /// Log the failure and continue with no attributes and no existing subject id.
    #[default]
    Lenient,
    /// Abort the pipeline with a server error.
    Strict,
}

/// Integrator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener receiving the REDCap data entry triggers
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    /// Path the data entry trigger is posted to
    #[serde(default = "default_trigger_path")]
    pub trigger_path: String,
    /// Timeout applied to every outbound HTTP call
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub fetch_failure_policy: FetchFailurePolicy,
    pub management_portal: ManagementPortalConfig,
    pub projects: Vec<ProjectInfo>,
}

fn default_trigger_path() -> String {
    "/redcap/trigger".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Validates the integrator configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if !self.trigger_path.starts_with('/') {
            return Err(ValidationError::InvalidTriggerPath(
                self.trigger_path.clone(),
            ));
        }

        self.management_portal.validate()?;

        if self.projects.is_empty() {
            return Err(ValidationError::NoProjects);
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            project.validate()?;

            let key = project.redcap_info.instance_key()?;
            if !seen.insert(key.clone()) {
                return Err(ValidationError::DuplicateProject {
                    host: key.0,
                    project_id: key.1,
                });
            }
        }

        Ok(())
    }

    /// Logs a warning for every endpoint not using an encrypted connection.
    pub fn warn_insecure_urls(&self) {
        if self.management_portal.url.scheme() != "https" {
            tracing::warn!(
                url = %self.management_portal.url,
                "The Management Portal instance is not using an encrypted connection"
            );
        }
        for project in &self.projects {
            if project.redcap_info.url.scheme() != "https" {
                tracing::warn!(
                    url = %project.redcap_info.url,
                    project_id = project.redcap_info.project_id,
                    "The REDCap instance is not using an encrypted connection"
                );
            }
        }
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Management Portal instance and the OAuth client used to talk to it
#[derive(Clone, Deserialize, PartialEq)]
pub struct ManagementPortalConfig {
    pub url: Url,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_subject_endpoint")]
    pub subject_endpoint: String,
}

fn default_token_endpoint() -> String {
    "oauth/token".to_string()
}

fn default_subject_endpoint() -> String {
    "api/subjects".to_string()
}

impl ManagementPortalConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.oauth_client_id.is_empty() {
            return Err(ValidationError::EmptyClientId);
        }
        Ok(())
    }
}

impl fmt::Debug for ManagementPortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementPortalConfig")
            .field("url", &self.url.as_str())
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_client_secret", &"<redacted>")
            .field("token_endpoint", &self.token_endpoint)
            .field("subject_endpoint", &self.subject_endpoint)
            .finish()
    }
}

/// One REDCap project paired with its Management Portal project
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProjectInfo {
    pub redcap_info: RedCapInfo,
    pub mp_info: MpInfo,
}

impl ProjectInfo {
    fn validate(&self) -> Result<(), ValidationError> {
        let project_id = self.redcap_info.project_id;
        let required = [
            ("token", &self.redcap_info.token),
            ("enrolment_event", &self.redcap_info.enrolment_event),
            ("integration_form", &self.redcap_info.integration_form),
            ("project_name", &self.mp_info.project_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyProjectField { project_id, field });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, PartialEq)]
pub struct RedCapInfo {
    /// Base URL of the REDCap instance, e.g. `https://redcap.example.org/redcap/`
    pub url: Url,
    pub project_id: u32,
    pub token: String,
    pub enrolment_event: String,
    pub integration_form: String,
    #[serde(default)]
    pub attributes: BTreeSet<AttributeMapping>,
}

impl RedCapInfo {
    /// The `(host, project_id)` pair this project is looked up by.
    pub fn instance_key(&self) -> Result<(String, u32), ValidationError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| ValidationError::MissingHost(self.url.clone()))?;
        Ok((host.to_ascii_lowercase(), self.project_id))
    }
}

impl fmt::Debug for RedCapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedCapInfo")
            .field("url", &self.url.as_str())
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .field("enrolment_event", &self.enrolment_event)
            .field("integration_form", &self.integration_form)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Maps a REDCap field onto a Management Portal subject attribute.
///
/// Equality and hashing are structural over both names, so a set of mappings
/// never yields the same field/attribute pair twice.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeMapping {
    pub field_name: String,
    pub attribute_key: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MpInfo {
    pub project_name: String,
}
