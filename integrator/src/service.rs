use crate::errors::{IntegratorError, PipelineError};
use crate::orchestrator::{Orchestrator, PipelineResult};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_boxed_error_response, make_text_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Receives REDCap data entry triggers and answers once the pipeline finished.
pub struct TriggerService {
    orchestrator: Arc<Orchestrator>,
    trigger_path: String,
}

impl TriggerService {
    pub fn new(orchestrator: Arc<Orchestrator>, trigger_path: String) -> Self {
        Self {
            orchestrator,
            trigger_path,
        }
    }
}

impl<B> Service<Request<B>> for TriggerService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = IntegratorError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        if let Some(status) = reject(req.method(), req.uri().path(), &self.trigger_path) {
            return Box::pin(async move { Ok(make_boxed_error_response(status)) });
        }

        let orchestrator = self.orchestrator.clone();
        Box::pin(async move {
            let body = match read_body(req).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not read trigger body");
                    return Ok(make_boxed_error_response(StatusCode::BAD_REQUEST));
                }
            };

            let (status, message) = pipeline_response(orchestrator.handle_body(&body).await);
            Ok(make_text_response(status, message))
        })
    }
}

/// Status for requests that never reach the pipeline.
fn reject(method: &Method, path: &str, trigger_path: &str) -> Option<StatusCode> {
    if path != trigger_path {
        Some(StatusCode::NOT_FOUND)
    } else if method != Method::POST {
        Some(StatusCode::METHOD_NOT_ALLOWED)
    } else {
        None
    }
}

async fn read_body<B>(req: Request<B>) -> Result<String, IntegratorError>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| IntegratorError::RequestBodyError(e.to_string()))?
        .to_bytes();

    String::from_utf8(bytes.to_vec())
        .map_err(|e| IntegratorError::RequestBodyError(format!("body is not UTF-8: {e}")))
}

fn pipeline_response(result: Result<PipelineResult, PipelineError>) -> (StatusCode, String) {
    match result {
        Ok(result) if result.write_back_attempted && !result.write_back_succeeded => {
            let subject = result
                .subject
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            if result.write_back_no_effect {
                tracing::warn!(%subject, "Subject synchronized but REDCap updated no record");
                (StatusCode::OK, format!("{}\n", result.outcome()))
            } else {
                (
                    StatusCode::BAD_GATEWAY,
                    format!(
                        "subject {subject} was synchronized but REDCap refused the write-back\n"
                    ),
                )
            }
        }
        Ok(result) => (StatusCode::OK, format!("{}\n", result.outcome())),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                tracing::error!(
                    error = %e,
                    subject_synchronized = e.subject_synchronized(),
                    "Pipeline failed"
                );
            } else {
                tracing::warn!(error = %e, "Rejected trigger");
            }
            (status, format!("{e}\n"))
        }
    }
}
