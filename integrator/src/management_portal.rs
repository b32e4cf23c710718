//! Subject registration in the Management Portal.
//!
//! The pipeline only depends on [`TargetSystem`]; [`ManagementPortalClient`]
//! is the HTTP implementation. It authenticates with the OAuth2 client
//! credentials grant and caches the access token until shortly before it
//! expires. Refreshes are serialized so concurrent triggers share one token
//! request.

use crate::config::ManagementPortalConfig;
use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use url::Url;

/// Seconds shaved off the advertised token lifetime
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 30;

/// Attribute key to value, unique keys
pub type AttributeMap = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectOperationStatus {
    Created,
    Updated,
    Unchanged,
    Failed,
}

impl SubjectOperationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SubjectOperationStatus::Created => "created",
            SubjectOperationStatus::Updated => "updated",
            SubjectOperationStatus::Unchanged => "unchanged",
            SubjectOperationStatus::Failed => "failed",
        }
    }
}

/// Outcome of a subject upsert
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    /// Identifier of the subject in the Management Portal
    pub identifier: Option<String>,
    pub operation_status: SubjectOperationStatus,
}

impl Subject {
    pub fn new(identifier: Option<String>, operation_status: SubjectOperationStatus) -> Self {
        Self {
            identifier,
            operation_status,
        }
    }

    pub fn failed() -> Self {
        Self::new(None, SubjectOperationStatus::Failed)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier.as_deref().unwrap_or("<unassigned>"))
    }
}

/// Everything the identity service needs to create or update one subject
#[derive(Clone, Copy, Debug)]
pub struct SubjectRequest<'a> {
    pub source_url: &'a Url,
    pub project_id: u32,
    pub record_id: u32,
    /// Management Portal project the subject belongs to
    pub target_project: &'a str,
    pub attributes: &'a AttributeMap,
    pub existing_external_id: Option<&'a str>,
}

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Management Portal request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not obtain an access token: {0}")]
    Token(String),

    #[error("invalid Management Portal URL: {0}")]
    InvalidUrl(String),
}

impl From<url::ParseError> for TargetError {
    fn from(e: url::ParseError) -> Self {
        TargetError::InvalidUrl(e.to_string())
    }
}

/// The identity service subjects are registered in
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Updates the subject named by `existing_external_id` when it exists,
    /// otherwise creates one for the record.
    ///
    /// A refusal by the service is reported as a `Failed` subject; only
    /// transport failures are errors.
    async fn upsert_subject(&self, request: SubjectRequest<'_>) -> Result<Subject, TargetError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct MpSubject {
    #[serde(skip_serializing_if = "Option::is_none")]
    login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<MpProject>,
    #[serde(default)]
    attributes: AttributeMap,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct MpProject {
    project_name: String,
}

enum Lookup {
    Found(MpSubject),
    Missing,
    Refused(StatusCode),
}

pub struct ManagementPortalClient {
    http: reqwest::Client,
    token_url: Url,
    subjects_url: Url,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl fmt::Debug for ManagementPortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementPortalClient")
            .field("token_url", &self.token_url.as_str())
            .field("subjects_url", &self.subjects_url.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ManagementPortalClient {
    pub fn new(
        http: reqwest::Client,
        config: &ManagementPortalConfig,
    ) -> Result<Self, TargetError> {
        let token_url = config.url.join(&config.token_endpoint)?;
        let subjects_url = config
            .url
            .join(config.subject_endpoint.trim_end_matches('/'))?;

        Ok(Self {
            http,
            token_url,
            subjects_url,
            client_id: config.oauth_client_id.clone(),
            client_secret: config.oauth_client_secret.clone(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, TargetError> {
        // Held for the whole refresh: later callers wait and reuse the new token.
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<AccessToken, TargetError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TargetError::Token(format!("token endpoint answered {status}")));
        }

        let body = response.bytes().await?;
        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| TargetError::Token(e.to_string()))?;

        let lifetime = token.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        tracing::info!(valid_for_secs = lifetime, "Refreshed Management Portal access token");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        })
    }

    /// Drops the cached token after the portal rejected it, so the next
    /// call fetches a fresh one instead of waiting for it to expire.
    async fn forget_rejected_token(&self, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("Management Portal rejected the access token, discarding it");
            *self.token.lock().await = None;
        }
    }

    fn subject_url(&self, login: &str) -> Result<Url, TargetError> {
        let mut url = self.subjects_url.clone();
        url.path_segments_mut()
            .map_err(|_| TargetError::InvalidUrl(self.subjects_url.to_string()))?
            .push(login);
        Ok(url)
    }

    async fn get_subject(&self, token: &str, login: &str) -> Result<Lookup, TargetError> {
        let response = self
            .http
            .get(self.subject_url(login)?)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Lookup::Missing),
            status if status.is_success() => {
                let body = response.bytes().await?;
                match serde_json::from_slice(&body) {
                    Ok(subject) => Ok(Lookup::Found(subject)),
                    Err(e) => {
                        tracing::error!(
                            login,
                            error = %e,
                            "Unreadable subject from Management Portal"
                        );
                        Ok(Lookup::Refused(status))
                    }
                }
            }
            status => {
                self.forget_rejected_token(status).await;
                Ok(Lookup::Refused(status))
            }
        }
    }

    async fn create_subject(
        &self,
        token: &str,
        request: &SubjectRequest<'_>,
    ) -> Result<Subject, TargetError> {
        let body = MpSubject {
            login: None,
            external_id: Some(request.record_id.to_string()),
            external_link: Some(record_link(request)?.to_string()),
            project: Some(MpProject {
                project_name: request.target_project.to_string(),
            }),
            attributes: request.attributes.clone(),
        };

        let response = self
            .http
            .post(self.subjects_url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.forget_rejected_token(status).await;
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                record_id = request.record_id,
                %status,
                body = %body,
                "Management Portal refused subject creation"
            );
            return Ok(Subject::failed());
        }

        let body = response.bytes().await?;
        let login = serde_json::from_slice::<MpSubject>(&body)
            .ok()
            .and_then(|created| created.login);
        if login.is_none() {
            tracing::warn!(
                record_id = request.record_id,
                "Created subject response carries no login"
            );
        }

        Ok(Subject::new(login, SubjectOperationStatus::Created))
    }

    async fn update_subject(
        &self,
        token: &str,
        existing: MpSubject,
        attributes: &AttributeMap,
    ) -> Result<Subject, TargetError> {
        let mut merged = existing.attributes.clone();
        merged.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));

        let login = existing.login.clone();
        if merged == existing.attributes {
            return Ok(Subject::new(login, SubjectOperationStatus::Unchanged));
        }

        let body = MpSubject {
            attributes: merged,
            ..existing
        };
        let response = self
            .http
            .put(self.subjects_url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.forget_rejected_token(status).await;
            tracing::error!(login = ?login, %status, "Management Portal refused subject update");
            return Ok(Subject::failed());
        }

        Ok(Subject::new(login, SubjectOperationStatus::Updated))
    }
}

/// Link back to the record's home page in REDCap.
fn record_link(request: &SubjectRequest<'_>) -> Result<Url, TargetError> {
    let mut link = request.source_url.join("DataEntry/record_home.php")?;
    link.query_pairs_mut()
        .append_pair("pid", &request.project_id.to_string())
        .append_pair("id", &request.record_id.to_string());
    Ok(link)
}

#[async_trait]
impl TargetSystem for ManagementPortalClient {
    async fn upsert_subject(&self, request: SubjectRequest<'_>) -> Result<Subject, TargetError> {
        let token = self.access_token().await?;

        if let Some(login) = request.existing_external_id {
            match self.get_subject(&token, login).await? {
                Lookup::Found(existing) => {
                    return self.update_subject(&token, existing, request.attributes).await;
                }
                Lookup::Missing => {
                    tracing::info!(login, "Subject unknown to the Management Portal, creating it");
                }
                Lookup::Refused(status) => {
                    tracing::error!(login, %status, "Management Portal refused subject lookup");
                    return Ok(Subject::failed());
                }
            }
        }

        self.create_subject(&token, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{RecordedRequest, TestServer};
    use hyper::Method;
    use hyper::header::AUTHORIZATION;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN_BODY: &str =
        r#"{"access_token": "tok", "expires_in": 3600, "token_type": "bearer"}"#;

    fn portal_config(url: &Url) -> ManagementPortalConfig {
        ManagementPortalConfig {
            url: url.join("managementportal/").unwrap(),
            oauth_client_id: "redcap_integrator".to_string(),
            oauth_client_secret: "secret".to_string(),
            token_endpoint: "oauth/token".to_string(),
            subject_endpoint: "api/subjects".to_string(),
        }
    }

    fn portal_client(url: &Url) -> ManagementPortalClient {
        ManagementPortalClient::new(reqwest::Client::new(), &portal_config(url)).unwrap()
    }

    /// Management Portal knowing subject `known` with `{attrAge: 30}`.
    fn portal(request: &RecordedRequest) -> (StatusCode, String) {
        match (request.method.clone(), request.path.as_str()) {
            (Method::POST, "/managementportal/oauth/token") => {
                (StatusCode::OK, TOKEN_BODY.to_string())
            }
            (Method::GET, "/managementportal/api/subjects/known") => (
                StatusCode::OK,
                r#"{"login": "known", "externalId": "5", "attributes": {"attrAge": "30"}}"#
                    .to_string(),
            ),
            (Method::GET, "/managementportal/api/subjects/broken") => {
                (StatusCode::FORBIDDEN, String::new())
            }
            (Method::GET, _) => (StatusCode::NOT_FOUND, String::new()),
            (Method::POST, "/managementportal/api/subjects")
                if request.body.contains("\"conflict\"") =>
            {
                (StatusCode::CONFLICT, r#"{"message": "exists"}"#.to_string())
            }
            (Method::POST, "/managementportal/api/subjects") => {
                (StatusCode::CREATED, r#"{"login": "S1", "externalId": "5"}"#.to_string())
            }
            (Method::PUT, "/managementportal/api/subjects") => (StatusCode::OK, String::new()),
            _ => (StatusCode::NOT_FOUND, String::new()),
        }
    }

    fn request<'a>(
        source_url: &'a Url,
        attributes: &'a AttributeMap,
        existing: Option<&'a str>,
    ) -> SubjectRequest<'a> {
        SubjectRequest {
            source_url,
            project_id: 12,
            record_id: 5,
            target_project: "radar",
            attributes,
            existing_external_id: existing,
        }
    }

    fn attributes(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_subject() {
        let server = TestServer::start(portal).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = attributes(&[("attrAge", "40")]);

        let subject = client
            .upsert_subject(request(&source_url, &attrs, None))
            .await
            .unwrap();
        assert_eq!(
            subject,
            Subject::new(Some("S1".to_string()), SubjectOperationStatus::Created)
        );

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].form()["grant_type"], "client_credentials");
        assert!(requests[0].headers.contains_key(AUTHORIZATION));

        assert_eq!(requests[1].headers[AUTHORIZATION], "Bearer tok");
        let created: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(created["externalId"], "5");
        assert_eq!(created["project"]["projectName"], "radar");
        assert_eq!(created["attributes"]["attrAge"], "40");
        assert_eq!(
            created["externalLink"],
            "https://redcap.example.org/redcap/DataEntry/record_home.php?pid=12&id=5"
        );
    }

    #[tokio::test]
    async fn test_token_is_reused() {
        let server = TestServer::start(portal).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = attributes(&[("attrAge", "40")]);

        for _ in 0..3 {
            client
                .upsert_subject(request(&source_url, &attrs, None))
                .await
                .unwrap();
        }

        let token_requests = server
            .requests()
            .iter()
            .filter(|r| r.path.ends_with("/oauth/token"))
            .count();
        assert_eq!(token_requests, 1);
    }

    #[tokio::test]
    async fn test_update_and_unchanged() {
        let server = TestServer::start(portal).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();

        let attrs = attributes(&[("attrAge", "31")]);
        let subject = client
            .upsert_subject(request(&source_url, &attrs, Some("known")))
            .await
            .unwrap();
        assert_eq!(
            subject,
            Subject::new(Some("known".to_string()), SubjectOperationStatus::Updated)
        );
        let put = server
            .requests()
            .into_iter()
            .find(|r| r.method == Method::PUT)
            .unwrap();
        let updated: serde_json::Value = serde_json::from_str(&put.body).unwrap();
        assert_eq!(updated["login"], "known");
        assert_eq!(updated["attributes"]["attrAge"], "31");

        let attrs = attributes(&[("attrAge", "30")]);
        let subject = client
            .upsert_subject(request(&source_url, &attrs, Some("known")))
            .await
            .unwrap();
        assert_eq!(subject.operation_status, SubjectOperationStatus::Unchanged);
        let puts = server
            .requests()
            .iter()
            .filter(|r| r.method == Method::PUT)
            .count();
        assert_eq!(puts, 1);
    }

    #[tokio::test]
    async fn test_unknown_existing_id_creates() {
        let server = TestServer::start(portal).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = AttributeMap::new();

        let subject = client
            .upsert_subject(request(&source_url, &attrs, Some("gone")))
            .await
            .unwrap();
        assert_eq!(subject.operation_status, SubjectOperationStatus::Created);
    }

    #[tokio::test]
    async fn test_refusals_fail() {
        let server = TestServer::start(portal).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();

        let attrs = attributes(&[("attrAge", "conflict")]);
        let subject = client
            .upsert_subject(request(&source_url, &attrs, None))
            .await
            .unwrap();
        assert_eq!(subject, Subject::failed());

        let attrs = AttributeMap::new();
        let subject = client
            .upsert_subject(request(&source_url, &attrs, Some("broken")))
            .await
            .unwrap();
        assert_eq!(subject, Subject::failed());
    }

    #[tokio::test]
    async fn test_token_refused() {
        let server = TestServer::start(|_| (StatusCode::UNAUTHORIZED, String::new())).await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = AttributeMap::new();

        assert!(matches!(
            client.upsert_subject(request(&source_url, &attrs, None)).await,
            Err(TargetError::Token(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed() {
        let subject_calls = Arc::new(AtomicUsize::new(0));
        let server = TestServer::start({
            let subject_calls = subject_calls.clone();
            move |request: &RecordedRequest| {
                if request.path.ends_with("/oauth/token") {
                    return portal(request);
                }
                // The portal restarted and forgot the first token
                if subject_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return (StatusCode::UNAUTHORIZED, String::new());
                }
                portal(request)
            }
        })
        .await;
        let client = portal_client(&server.url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = attributes(&[("attrAge", "40")]);

        let subject = client
            .upsert_subject(request(&source_url, &attrs, None))
            .await
            .unwrap();
        assert_eq!(subject, Subject::failed());

        let subject = client
            .upsert_subject(request(&source_url, &attrs, None))
            .await
            .unwrap();
        assert_eq!(subject.operation_status, SubjectOperationStatus::Created);

        let token_requests = server
            .requests()
            .iter()
            .filter(|r| r.path.ends_with("/oauth/token"))
            .count();
        assert_eq!(token_requests, 2);
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let client = portal_client(&url);
        let source_url = Url::parse("https://redcap.example.org/redcap/").unwrap();
        let attrs = AttributeMap::new();

        assert!(matches!(
            client.upsert_subject(request(&source_url, &attrs, None)).await,
            Err(TargetError::Transport(_))
        ));
    }

    #[test]
    fn test_subject_display() {
        let subject = Subject::new(Some("S1".to_string()), SubjectOperationStatus::Created);
        assert_eq!(subject.to_string(), "S1");
        assert_eq!(Subject::failed().to_string(), "<unassigned>");
        assert_eq!(SubjectOperationStatus::Unchanged.as_str(), "unchanged");
    }
}
