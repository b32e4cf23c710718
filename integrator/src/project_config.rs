//! Lookup of per-project processing rules.
//!
//! The table is built once from the loaded configuration and is read-only
//! afterwards, so it can be shared across requests behind an `Arc`.

use crate::config::{AttributeMapping, ProjectInfo, ValidationError};
use crate::trigger::Trigger;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error(
        "no project {project_id} configured for instance {}",
        .host.as_deref().unwrap_or("<unknown>")
    )]
    ConfigNotFound {
        host: Option<String>,
        project_id: u32,
    },

    #[error("trigger carries no project id")]
    MissingProjectId,
}

/// Processing rules for one REDCap project
#[derive(Clone, PartialEq)]
pub struct ProjectConfig {
    pub source_url: Url,
    pub project_id: u32,
    pub token: String,
    pub enrolment_event_name: String,
    pub integration_form_name: String,
    pub attribute_mappings: BTreeSet<AttributeMapping>,
    /// Management Portal project the subjects are registered in
    pub target_project: String,
}

impl From<&ProjectInfo> for ProjectConfig {
    fn from(info: &ProjectInfo) -> Self {
        let redcap = &info.redcap_info;
        ProjectConfig {
            source_url: redcap.url.clone(),
            project_id: redcap.project_id,
            token: redcap.token.clone(),
            enrolment_event_name: redcap.enrolment_event.clone(),
            integration_form_name: redcap.integration_form.clone(),
            attribute_mappings: redcap.attributes.clone(),
            target_project: info.mp_info.project_name.clone(),
        }
    }
}

impl fmt::Debug for ProjectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectConfig")
            .field("source_url", &self.source_url.as_str())
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .field("enrolment_event_name", &self.enrolment_event_name)
            .field("integration_form_name", &self.integration_form_name)
            .field("attribute_mappings", &self.attribute_mappings)
            .field("target_project", &self.target_project)
            .finish()
    }
}

/// Resolves `(host, project_id)` pairs to project configurations
#[derive(Clone, Debug, Default)]
pub struct ProjectConfigResolver {
    projects: HashMap<(String, u32), Arc<ProjectConfig>>,
}

impl ProjectConfigResolver {
    /// Builds the lookup table. Fails if two projects share a `(host, project_id)` pair.
    pub fn new(projects: &[ProjectInfo]) -> Result<Self, ValidationError> {
        let mut table = HashMap::with_capacity(projects.len());
        for info in projects {
            let key = info.redcap_info.instance_key()?;
            if table.contains_key(&key) {
                return Err(ValidationError::DuplicateProject {
                    host: key.0,
                    project_id: key.1,
                });
            }
            table.insert(key, Arc::new(ProjectConfig::from(info)));
        }
        Ok(Self { projects: table })
    }

    pub fn resolve(&self, host: &str, project_id: u32) -> Result<Arc<ProjectConfig>, ResolveError> {
        self.projects
            .get(&(host.to_ascii_lowercase(), project_id))
            .cloned()
            .ok_or_else(|| ResolveError::ConfigNotFound {
                host: Some(host.to_string()),
                project_id,
            })
    }

    /// Resolves the project a trigger belongs to.
    ///
    /// A trigger without any REDCap URL is matched on project id alone, and
    /// only when exactly one configured instance has that id.
    pub fn resolve_trigger(&self, trigger: &Trigger) -> Result<Arc<ProjectConfig>, ResolveError> {
        let project_id = trigger.project_id.ok_or(ResolveError::MissingProjectId)?;

        if let Some(host) = trigger.source_host() {
            return self.resolve(&host, project_id);
        }

        let mut candidates = self
            .projects
            .iter()
            .filter(|((_, id), _)| *id == project_id)
            .map(|(_, config)| config);

        match (candidates.next(), candidates.next()) {
            (Some(config), None) => Ok(config.clone()),
            _ => Err(ResolveError::ConfigNotFound {
                host: None,
                project_id,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}
