pub mod dispatch;
pub mod engine;
pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod retry;
pub mod sources;

use std::sync::Arc;

pub use engine::{CompletionService, InvocationError, LlmCompletion};
pub use orchestrator::{Orchestrator, RequestError, RunError, RunState};
pub use sources::{Collaborators, ContentSource, Report, ReportError, ReportSink, RuleSource};

use rulegate_core::{Settings, ValidationRequest, ValidationResponse};

/// Build an orchestrator wired to the collaborators and model provider named
/// in `settings`. Unusable settings are rejected here, before any fetch.
pub fn orchestrator_from_settings(settings: &Settings) -> Result<Orchestrator, String> {
    settings.validate().map_err(|e| e.to_string())?;
    let collaborators = Collaborators::from_settings(settings).map_err(|e| e.to_string())?;
    let completion = LlmCompletion::new(settings)?;
    Ok(Orchestrator::new(settings, collaborators, Arc::new(completion)))
}

/// Validate one repository with the configured collaborators. Never fails:
/// configuration problems come back as a failed response.
pub async fn validate_repository(settings: &Settings, request: ValidationRequest) -> ValidationResponse {
    tracing::info!(
        repository = %request.repository_url,
        user = %request.user_name,
        "validation requested"
    );

    match orchestrator_from_settings(settings) {
        Ok(orchestrator) => {
            let response = orchestrator.run(request).await;
            orchestrator
                .flush_reports(std::time::Duration::from_secs(10))
                .await;
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "validation is not configured");
            ValidationResponse::failed(format!("validation is not configured: {e}"))
        }
    }
}
