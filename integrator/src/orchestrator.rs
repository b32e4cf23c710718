//! The per-trigger pipeline.
//!
//! A trigger moves through `received -> validated -> attributes resolved ->
//! subject resolved` and ends either written back, skipped or failed. Every
//! step short-circuits on error and nothing is retried.

use crate::config::{AttributeMapping, FetchFailurePolicy};
use crate::errors::{PipelineError, ValidationError};
use crate::management_portal::{
    AttributeMap, Subject, SubjectOperationStatus, SubjectRequest, TargetSystem,
};
use crate::metrics_defs::{
    PIPELINE_DURATION, SOURCE_FETCH_FAILED, SUBJECT_OPERATION, TRIGGER_RECEIVED,
};
use crate::project_config::{ProjectConfig, ProjectConfigResolver};
use crate::record_lock::RecordLocks;
use crate::redcap::{SUBJECT_ID_FIELD, SourceConnector, SourceSystem, WriteBackOutcome};
use crate::trigger::Trigger;
use shared::{counter, histogram};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Successful end of a pipeline run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineResult {
    pub success: bool,
    pub write_back_attempted: bool,
    pub write_back_succeeded: bool,
    /// REDCap accepted the write-back but reported no record changed
    pub write_back_no_effect: bool,
    /// Absent when the trigger was skipped before reaching the Management Portal
    pub subject: Option<Subject>,
}

impl PipelineResult {
    /// The trigger needed no processing.
    pub fn skipped() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn unchanged(subject: Subject) -> Self {
        Self {
            success: true,
            subject: Some(subject),
            ..Default::default()
        }
    }

    fn written_back(subject: Subject, outcome: WriteBackOutcome) -> Self {
        Self {
            success: true,
            write_back_attempted: true,
            write_back_succeeded: outcome.succeeded(),
            write_back_no_effect: outcome == WriteBackOutcome::NoEffect,
            subject: Some(subject),
        }
    }

    /// Short label used to tag metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self { subject: None, .. } => "skipped",
            Self {
                write_back_attempted: false,
                ..
            } => "unchanged",
            Self {
                write_back_succeeded: true,
                ..
            } => "written_back",
            Self {
                write_back_no_effect: true,
                ..
            } => "no_effect",
            _ => "write_back_rejected",
        }
    }
}

pub struct Orchestrator {
    resolver: Arc<ProjectConfigResolver>,
    sources: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetSystem>,
    fetch_failure_policy: FetchFailurePolicy,
    record_locks: RecordLocks,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<ProjectConfigResolver>,
        sources: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetSystem>,
        fetch_failure_policy: FetchFailurePolicy,
    ) -> Self {
        Self {
            resolver,
            sources,
            target,
            fetch_failure_policy,
            record_locks: RecordLocks::new(),
        }
    }

    /// Parses a raw urlencoded trigger body and runs it through the pipeline.
    pub async fn handle_body(&self, raw: &str) -> Result<PipelineResult, PipelineError> {
        counter!(TRIGGER_RECEIVED).increment(1);
        let trigger = Trigger::parse(raw)?;
        self.handle_trigger(&trigger).await
    }

    pub async fn handle_trigger(&self, trigger: &Trigger) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();
        let result = self.resolve_and_run(trigger).await;

        let outcome = match &result {
            Ok(result) => result.outcome(),
            Err(_) => "error",
        };
        histogram!(PIPELINE_DURATION, "outcome" => outcome).record(start.elapsed().as_secs_f64());

        result
    }

    async fn resolve_and_run(&self, trigger: &Trigger) -> Result<PipelineResult, PipelineError> {
        let project = self.resolver.resolve_trigger(trigger)?;

        let _guard = match trigger.record {
            Some(record_id) => Some(self.record_locks.lock(project.project_id, record_id).await),
            None => None,
        };

        let source = self.sources.connect(&project);
        self.run_pipeline(trigger, &project, source.as_ref()).await
    }

    /// Runs a trigger against an already resolved project.
    pub async fn run_pipeline(
        &self,
        trigger: &Trigger,
        project: &ProjectConfig,
        source: &dyn SourceSystem,
    ) -> Result<PipelineResult, PipelineError> {
        let (record_id, event_name) = validate(trigger, project)?;
        let project_id = project.project_id;

        if !event_name.eq_ignore_ascii_case(&project.enrolment_event_name) {
            tracing::info!(project_id, record_id, event_name, "Not the enrolment event, skipping");
            return Ok(PipelineResult::skipped());
        }

        let fields = attribute_fields(&project.attribute_mappings);
        let mut record = self.fetch_record(source, &fields, record_id).await?;

        let existing_external_id = record
            .remove(SUBJECT_ID_FIELD)
            .filter(|id| !id.trim().is_empty());
        let attributes = map_attributes(&project.attribute_mappings, &record);

        let subject = self
            .target
            .upsert_subject(SubjectRequest {
                source_url: &project.source_url,
                project_id,
                record_id,
                target_project: &project.target_project,
                attributes: &attributes,
                existing_external_id: existing_external_id.as_deref(),
            })
            .await?;

        let status = subject.operation_status;
        counter!(SUBJECT_OPERATION, "status" => status.as_str()).increment(1);
        tracing::info!(
            project_id,
            record_id,
            %subject,
            status = status.as_str(),
            "Subject resolved"
        );

        match status {
            SubjectOperationStatus::Failed => Err(PipelineError::TargetOperation { record_id }),
            SubjectOperationStatus::Unchanged => Ok(PipelineResult::unchanged(subject)),
            SubjectOperationStatus::Created | SubjectOperationStatus::Updated => {
                // REDCap event names are case-sensitive; write to the configured spelling.
                match source
                    .write_back(
                        &subject,
                        record_id,
                        &project.enrolment_event_name,
                        &project.integration_form_name,
                    )
                    .await
                {
                    Ok(outcome) => Ok(PipelineResult::written_back(subject, outcome)),
                    Err(source) => Err(PipelineError::WriteBack { subject, source }),
                }
            }
        }
    }

    async fn fetch_record(
        &self,
        source: &dyn SourceSystem,
        fields: &BTreeSet<String>,
        record_id: u32,
    ) -> Result<HashMap<String, String>, PipelineError> {
        match source.fetch_attributes(fields, record_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                counter!(SOURCE_FETCH_FAILED).increment(1);
                match self.fetch_failure_policy {
                    FetchFailurePolicy::Lenient => {
                        tracing::warn!(
                            record_id,
                            error = %e,
                            "Could not fetch record, continuing without attributes"
                        );
                        Ok(HashMap::new())
                    }
                    FetchFailurePolicy::Strict => {
                        Err(PipelineError::SourceFetch { record_id, source: e })
                    }
                }
            }
        }
    }
}

/// Checks the values the pipeline cannot run without. Makes no remote calls.
fn validate<'a>(
    trigger: &'a Trigger,
    project: &ProjectConfig,
) -> Result<(u32, &'a str), ValidationError> {
    let record_id = trigger.record.ok_or(ValidationError::MissingRecord)?;
    let event_name = trigger
        .event_name
        .as_deref()
        .ok_or(ValidationError::MissingEventName)?;

    if project.enrolment_event_name.is_empty() {
        return Err(ValidationError::MissingEnrolmentEvent(project.project_id));
    }
    if project.integration_form_name.is_empty() {
        return Err(ValidationError::MissingIntegrationForm(project.project_id));
    }

    Ok((record_id, event_name))
}

/// Mapped REDCap fields plus the subject id field.
fn attribute_fields(mappings: &BTreeSet<AttributeMapping>) -> BTreeSet<String> {
    mappings
        .iter()
        .map(|mapping| mapping.field_name.clone())
        .chain([SUBJECT_ID_FIELD.to_string()])
        .collect()
}

/// Renames fetched fields to their attribute keys. Fields REDCap did not
/// return are left out.
fn map_attributes(
    mappings: &BTreeSet<AttributeMapping>,
    record: &HashMap<String, String>,
) -> AttributeMap {
    mappings
        .iter()
        .filter_map(|mapping| {
            record
                .get(&mapping.field_name)
                .map(|value| (mapping.attribute_key.clone(), value.clone()))
        })
        .collect()
}
