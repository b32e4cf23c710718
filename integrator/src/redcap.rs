//! Client for the REDCap record API.
//!
//! Every call is a form-encoded `POST` to `/redcap/api/` on the configured
//! instance, authenticated by the project token carried in the body.

use crate::management_portal::Subject;
use crate::project_config::ProjectConfig;
use crate::trigger::{InstrumentStatus, status_field};
use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

const API_ROOT: &str = "/redcap/api/";
const TOKEN_LABEL: &str = "token";
const DATA_LABEL: &str = "data";
const FIELDS_LABEL: &str = "fields";
const RECORDS_LABEL: &str = "records";

/// REDCap field holding the Management Portal identifier of the subject.
///
/// It is fetched along with the mapped fields so an existing subject can be
/// found, and it is the field the identifier is written back to.
pub const SUBJECT_ID_FIELD: &str = "subjectId";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("REDCap request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("REDCap answered with status {0}")]
    Status(StatusCode),

    #[error("unexpected REDCap response: {0}")]
    MalformedResponse(String),

    #[error("could not encode REDCap payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of posting the integration form back to REDCap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteBackOutcome {
    /// REDCap accepted the update.
    Written,
    /// REDCap accepted the request but reported that no record changed.
    NoEffect,
    /// REDCap refused the update.
    Rejected(StatusCode),
}

impl WriteBackOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, WriteBackOutcome::Written)
    }
}

/// The record API of the platform that fired the trigger
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Fetches the flat values of `fields` for a single record.
    async fn fetch_attributes(
        &self,
        fields: &BTreeSet<String>,
        record_id: u32,
    ) -> Result<HashMap<String, String>, SourceError>;

    /// Writes the subject identifier and a completed status into `form_name`.
    ///
    /// Only transport failures are errors; a refused update is reported
    /// through the returned outcome.
    async fn write_back(
        &self,
        subject: &Subject,
        record_id: u32,
        event_name: &str,
        form_name: &str,
    ) -> Result<WriteBackOutcome, SourceError>;
}

/// Creates the source client for a resolved project
pub trait SourceConnector: Send + Sync {
    fn connect(&self, project: &ProjectConfig) -> Arc<dyn SourceSystem>;
}

/// Connects to REDCap instances through one shared HTTP client
#[derive(Clone)]
pub struct RedcapConnector {
    http: reqwest::Client,
}

impl RedcapConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl SourceConnector for RedcapConnector {
    fn connect(&self, project: &ProjectConfig) -> Arc<dyn SourceSystem> {
        Arc::new(RedcapClient::new(
            self.http.clone(),
            &project.source_url,
            project.token.clone(),
        ))
    }
}

#[derive(Serialize)]
struct EavEntry<'a> {
    record: String,
    redcap_event_name: &'a str,
    field: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct ImportCount {
    count: u64,
}

#[derive(Clone)]
pub struct RedcapClient {
    http: reqwest::Client,
    api_url: Url,
    token: String,
}

impl fmt::Debug for RedcapClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedcapClient")
            .field("api_url", &self.api_url.as_str())
            .finish_non_exhaustive()
    }
}

impl RedcapClient {
    pub fn new(http: reqwest::Client, instance_url: &Url, token: String) -> Self {
        let mut api_url = instance_url.clone();
        api_url.set_path(API_ROOT);
        api_url.set_query(None);
        api_url.set_fragment(None);

        Self {
            http,
            api_url,
            token,
        }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    async fn post(
        &self,
        mut params: Vec<(String, String)>,
    ) -> Result<reqwest::Response, SourceError> {
        params.push((TOKEN_LABEL.to_string(), self.token.clone()));
        let response = self
            .http
            .post(self.api_url.clone())
            .form(&params)
            .send()
            .await?;
        Ok(response)
    }
}

fn fetch_parameters(fields: &BTreeSet<String>, record_id: u32) -> Vec<(String, String)> {
    let mut params = vec![
        ("content".to_string(), "record".to_string()),
        ("format".to_string(), "json".to_string()),
        ("type".to_string(), "flat".to_string()),
        ("rawOrLabel".to_string(), "label".to_string()),
    ];
    params.extend(encode_list(FIELDS_LABEL, fields.iter().cloned()));
    params.extend(encode_list(RECORDS_LABEL, [record_id.to_string()]));
    params
}

fn write_back_parameters(data: String) -> Vec<(String, String)> {
    vec![
        (DATA_LABEL.to_string(), data),
        ("content".to_string(), "record".to_string()),
        ("format".to_string(), "json".to_string()),
        ("type".to_string(), "eav".to_string()),
        ("overwriteBehavior".to_string(), "overwrite".to_string()),
        ("returnContent".to_string(), "count".to_string()),
        ("returnFormat".to_string(), "json".to_string()),
    ]
}

fn encode_list(
    label: &str,
    values: impl IntoIterator<Item = String>,
) -> impl Iterator<Item = (String, String)> {
    values
        .into_iter()
        .enumerate()
        .map(move |(index, value)| (format!("{label}[{index}]"), value))
}

fn eav_entries<'a>(
    subject: &Subject,
    record_id: u32,
    event_name: &'a str,
    status_field: &'a str,
) -> Vec<EavEntry<'a>> {
    let mut entries = Vec::with_capacity(2);
    if let Some(identifier) = &subject.identifier {
        entries.push(EavEntry {
            record: record_id.to_string(),
            redcap_event_name: event_name,
            field: SUBJECT_ID_FIELD,
            value: identifier.clone(),
        });
    }
    entries.push(EavEntry {
        record: record_id.to_string(),
        redcap_event_name: event_name,
        field: status_field,
        value: InstrumentStatus::Complete.code().to_string(),
    });
    entries
}

#[async_trait]
impl SourceSystem for RedcapClient {
    async fn fetch_attributes(
        &self,
        fields: &BTreeSet<String>,
        record_id: u32,
    ) -> Result<HashMap<String, String>, SourceError> {
        let response = self.post(fetch_parameters(fields, record_id)).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body = response.bytes().await?;
        let records: Vec<HashMap<String, String>> = serde_json::from_slice(&body)
            .map_err(|e| SourceError::MalformedResponse(e.to_string()))?;

        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| {
                SourceError::MalformedResponse(format!("record {record_id} not found"))
            })?;

        tracing::info!(record_id, fields = record.len(), "Fetched record from REDCap");
        Ok(record)
    }

    async fn write_back(
        &self,
        subject: &Subject,
        record_id: u32,
        event_name: &str,
        form_name: &str,
    ) -> Result<WriteBackOutcome, SourceError> {
        let status_field = status_field(form_name);
        let entries = eav_entries(subject, record_id, event_name, &status_field);
        let data = serde_json::to_string(&entries)?;

        let response = self.post(write_back_parameters(data)).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                record_id,
                %status,
                body = %body,
                "REDCap refused the integration form update"
            );
            return Ok(WriteBackOutcome::Rejected(status));
        }

        let body = response.bytes().await?;
        match serde_json::from_slice::<ImportCount>(&body) {
            Ok(ImportCount { count: 0 }) => {
                tracing::warn!(record_id, form_name, "REDCap reported no record updated");
                Ok(WriteBackOutcome::NoEffect)
            }
            Ok(_) => {
                tracing::info!(record_id, form_name, "Successful update of integration form");
                Ok(WriteBackOutcome::Written)
            }
            Err(e) => {
                tracing::debug!(record_id, error = %e, "Unrecognized REDCap import response");
                Ok(WriteBackOutcome::Written)
            }
        }
    }
}
