pub mod config;
pub mod errors;
pub mod management_portal;
pub mod metrics_defs;
pub mod orchestrator;
pub mod project_config;
pub mod record_lock;
pub mod redcap;
pub mod service;
pub mod trigger;

#[cfg(test)]
mod testutils;

use errors::IntegratorError;
use management_portal::ManagementPortalClient;
use orchestrator::Orchestrator;
use project_config::ProjectConfigResolver;
use redcap::RedcapConnector;
use service::TriggerService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(config: config::Config) -> errors::Result<()> {
    config.validate()?;
    config.warn_insecure_urls();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let resolver = ProjectConfigResolver::new(&config.projects)?;
    tracing::info!(projects = resolver.len(), "Loaded project configurations");

    let target = ManagementPortalClient::new(http.clone(), &config.management_portal)?;

    let orchestrator = Orchestrator::new(
        Arc::new(resolver),
        Arc::new(RedcapConnector::new(http)),
        Arc::new(target),
        config.fetch_failure_policy,
    );

    let trigger_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        TriggerService::new(Arc::new(orchestrator), config.trigger_path.clone()),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, IntegratorError>::new(|| true),
    );

    tokio::try_join!(trigger_task, admin_task)?;
    Ok(())
}
