use crate::management_portal::{Subject, TargetError};
use crate::project_config::ResolveError;
use crate::redcap::SourceError;
use crate::trigger::TriggerError;
use http::StatusCode;
use thiserror::Error;

/// Result type alias for integrator operations
pub type Result<T, E = IntegratorError> = std::result::Result<T, E>;

/// Errors raised while serving HTTP, outside of any single pipeline run
#[derive(Error, Debug)]
pub enum IntegratorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("Management Portal client error: {0}")]
    ManagementPortal(#[from] TargetError),
}

/// A required value was missing before any remote call was made
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("trigger carries no record id")]
    MissingRecord,

    #[error("trigger carries no event name")]
    MissingEventName,

    #[error("project {0} has no enrolment event configured")]
    MissingEnrolmentEvent(u32),

    #[error("project {0} has no integration form configured")]
    MissingIntegrationForm(u32),
}

/// Every way a single trigger can fail to run through the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed trigger: {0}")]
    MalformedTrigger(#[from] TriggerError),

    #[error(transparent)]
    ConfigNotFound(#[from] ResolveError),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Only raised under the strict fetch failure policy
    #[error("could not fetch record {record_id} from REDCap: {source}")]
    SourceFetch {
        record_id: u32,
        #[source]
        source: SourceError,
    },

    #[error("Management Portal rejected the subject operation for record {record_id}")]
    TargetOperation { record_id: u32 },

    #[error("could not reach the Management Portal: {0}")]
    TargetTransport(#[from] TargetError),

    /// The subject was created or updated but the confirmation never reached REDCap
    #[error("subject {subject} was synchronized but the REDCap write-back failed: {source}")]
    WriteBack {
        subject: Subject,
        #[source]
        source: SourceError,
    },
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::MalformedTrigger(_)
            | PipelineError::Validation(_)
            | PipelineError::ConfigNotFound(ResolveError::MissingProjectId) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::SourceFetch { .. }
            | PipelineError::TargetOperation { .. }
            | PipelineError::TargetTransport(_)
            | PipelineError::WriteBack { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the identity service was mutated before the error occurred.
    pub fn subject_synchronized(&self) -> bool {
        matches!(self, PipelineError::WriteBack { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management_portal::SubjectOperationStatus;

    #[test]
    fn test_client_errors() {
        let err = PipelineError::from(ValidationError::MissingRecord);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.subject_synchronized());

        let err = PipelineError::from(TriggerError::UnknownParameter("foo".to_string()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = PipelineError::from(ResolveError::ConfigNotFound {
            host: Some("redcap.example.org".to_string()),
            project_id: 3,
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_write_back_error_reports_synchronized_subject() {
        let subject = Subject::new(Some("S1".to_string()), SubjectOperationStatus::Created);
        let err = PipelineError::WriteBack {
            subject,
            source: SourceError::MalformedResponse("connection reset".to_string()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.subject_synchronized());
        assert!(err.to_string().contains("subject S1 was synchronized"));
    }
}
