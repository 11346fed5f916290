use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rulegate_core::chunk::chunk_content;
use rulegate_core::consolidate::{consolidate, note_unread, ConsolidationPolicy};
use rulegate_core::rules::{classify, Classification};
use rulegate_core::select::{select_model, ModelCatalog};
use rulegate_core::workspace::service_id_from_url;
use rulegate_core::{
    ConfigurationError, ConsolidatedResult, Criticality, FetchError, RepositoryContent,
    RuleRecord, RuleVerdict, Scope, Settings, ValidationRequest, ValidationResponse, Verdict,
};

use crate::dispatch::{DispatchConfig, Dispatcher, ValidationTask};
use crate::engine::CompletionService;
use crate::prompt::fit_tree;
use crate::sources::{Collaborators, ContentSource, Report, ReportSink, RuleSource};

/// Stages of one validation run. `Error` is reachable from any stage before
/// `Dispatched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    RulesLoaded,
    ContentLoaded,
    Classified,
    Dispatched,
    Consolidated,
    Error,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("`{0}` is required")]
    Missing(&'static str),
    #[error("repository_url must be an http, https or file URL, got `{0}`")]
    UnsupportedUrl(String),
    #[error("repository_url `{0}` does not name a repository")]
    NoServiceId(String),
    #[error("user_email `{0}` is not a valid address")]
    InvalidEmail(String),
}

/// Anything that stops a run before rules are dispatched.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("could not load rules: {0}")]
    Rules(#[source] FetchError),
    #[error("could not load repository content: {0}")]
    Content(#[source] FetchError),
    #[error("invalid rule set: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Check the request and derive the service id the rules are keyed by.
pub fn validate_request(request: &ValidationRequest) -> Result<String, RequestError> {
    let url = request.repository_url.trim();
    if url.is_empty() {
        return Err(RequestError::Missing("repository_url"));
    }
    if request.user_name.trim().is_empty() {
        return Err(RequestError::Missing("user_name"));
    }
    if request.user_email.trim().is_empty() {
        return Err(RequestError::Missing("user_email"));
    }

    let supported = ["https://", "http://", "file://"]
        .iter()
        .any(|scheme| url.starts_with(scheme));
    if !supported {
        return Err(RequestError::UnsupportedUrl(url.to_string()));
    }
    if !plausible_email(request.user_email.trim()) {
        return Err(RequestError::InvalidEmail(request.user_email.clone()));
    }

    service_id_from_url(url).ok_or_else(|| RequestError::NoServiceId(url.to_string()))
}

fn plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// Every (rule, chunk) pair, rules in classification order and chunks in
/// content order. Each rule is chunked against its own scope and model budget;
/// the shared directory structure is cut to the catalog's tree bound.
pub fn plan_tasks(
    classification: &Classification,
    content: &RepositoryContent,
    catalog: &ModelCatalog,
) -> Vec<ValidationTask> {
    let fitted = fit_tree(&content.tree, catalog.max_tree_bytes);
    if fitted.len() < content.tree.len() {
        tracing::warn!(
            tree_bytes = content.tree.len(),
            max_tree_bytes = catalog.max_tree_bytes,
            "directory structure truncated for prompting"
        );
    }
    let tree: Arc<str> = Arc::from(fitted.as_ref());
    let mut tasks = Vec::new();

    for rule in &classification.rules {
        let choice = Arc::new(select_model(rule, catalog));
        let chunks = chunk_content(content, &rule.scope, choice.budget_bytes);
        let total_chunks = chunks.len();
        let rule = Arc::new(rule.clone());

        tracing::debug!(
            rule = %rule.id,
            model = %choice.primary,
            tier = ?choice.tier,
            chunks = total_chunks,
            "planned rule"
        );

        tasks.extend(chunks.into_iter().map(|chunk| ValidationTask {
            rule: Arc::clone(&rule),
            chunk,
            total_chunks,
            choice: Arc::clone(&choice),
            tree: Arc::clone(&tree),
        }));
    }

    tasks
}

/// Scopes the loaded rules look at, for sources that can skip unneeded
/// files. A record whose scope does not compile is left to classification.
fn wanted_scopes(records: &[RuleRecord]) -> Vec<Scope> {
    let scopes: Vec<Scope> = records
        .iter()
        .filter_map(|r| Scope::compile(r.id.as_deref().unwrap_or(""), &r.scope).ok())
        .collect();
    if scopes.iter().any(Scope::is_all) {
        Vec::new()
    } else {
        scopes
    }
}

fn advance(service: &str, state: RunState) {
    tracing::info!(service, state = ?state, "run state");
}

/// Runs one repository validation end to end.
pub struct Orchestrator {
    rules: Arc<dyn RuleSource>,
    content: Arc<dyn ContentSource>,
    report: Option<Arc<dyn ReportSink>>,
    dispatcher: Dispatcher,
    catalog: ModelCatalog,
    policy: ConsolidationPolicy,
    bucket: String,
    run_timeout: Duration,
    publishing: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        collaborators: Collaborators,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        tracing::debug!(
            economy = %settings.economy_model,
            premium = %settings.premium_model,
            region = %settings.bedrock_region,
            concurrency = settings.max_concurrency,
            "orchestrator configured"
        );
        Self {
            rules: collaborators.rules,
            content: collaborators.content,
            report: collaborators.report,
            dispatcher: Dispatcher::new(completion, DispatchConfig::from(settings)),
            catalog: ModelCatalog::from(settings),
            policy: ConsolidationPolicy::from(settings),
            bucket: settings.s3_bucket.clone(),
            run_timeout: Duration::from_secs(settings.run_timeout_secs.max(1)),
            publishing: TaskTracker::new(),
        }
    }

    /// Validate a repository and return the consolidated result. Fatal
    /// conditions return before any model is invoked.
    pub async fn evaluate(&self, request: &ValidationRequest) -> Result<ConsolidatedResult, RunError> {
        advance(&request.repository_url, RunState::Init);
        let service_id = validate_request(request)?;

        let records = self
            .rules
            .fetch_rules(&service_id)
            .await
            .map_err(RunError::Rules)?;
        if records.is_empty() {
            return Err(RunError::Rules(FetchError::NoRules(service_id)));
        }
        advance(&service_id, RunState::RulesLoaded);

        let content = self
            .content
            .fetch_for(request.repository_url.trim(), &wanted_scopes(&records))
            .await
            .map_err(RunError::Content)?;
        tracing::info!(
            service = %service_id,
            files = content.files.len(),
            unread = content.unread.len(),
            bytes = content.total_bytes(),
            "repository content loaded"
        );
        advance(&service_id, RunState::ContentLoaded);

        let classification = classify(records)?;
        tracing::info!(
            service = %service_id,
            rules = classification.len(),
            high = classification.ids_in(Criticality::High).len(),
            medium = classification.ids_in(Criticality::Medium).len(),
            low = classification.ids_in(Criticality::Low).len(),
            "rules classified"
        );
        advance(&service_id, RunState::Classified);

        let tasks = plan_tasks(&classification, &content, &self.catalog);
        tracing::info!(service = %service_id, tasks = tasks.len(), "dispatching validation tasks");

        let cancel = CancellationToken::new();
        let dispatch = self.dispatcher.dispatch(tasks, &cancel);
        tokio::pin!(dispatch);
        let verdicts = tokio::select! {
            verdicts = &mut dispatch => verdicts,
            _ = tokio::time::sleep(self.run_timeout) => {
                tracing::warn!(
                    service = %service_id,
                    timeout = ?self.run_timeout,
                    "run deadline reached, cancelling outstanding tasks"
                );
                cancel.cancel();
                dispatch.await
            }
        };
        advance(&service_id, RunState::Dispatched);

        let mut by_rule: HashMap<String, Vec<Verdict>> = HashMap::new();
        for verdict in verdicts {
            by_rule.entry(verdict.rule_id.clone()).or_default().push(verdict);
        }
        let rule_verdicts: Vec<RuleVerdict> = classification
            .rules
            .iter()
            .map(|rule| RuleVerdict::merge(rule, by_rule.remove(&rule.id).unwrap_or_default()))
            .collect();

        let mut result = consolidate(rule_verdicts, &self.policy);
        note_unread(&mut result, &content.unread);
        advance(&service_id, RunState::Consolidated);
        Ok(result)
    }

    /// Validate and always answer. The report is published in the background.
    pub async fn run(&self, request: ValidationRequest) -> ValidationResponse {
        match self.evaluate(&request).await {
            Ok(result) => {
                let response = ValidationResponse::from(&result);
                self.publish(result, request);
                response
            }
            Err(e) => {
                tracing::error!(
                    repository = %request.repository_url,
                    state = ?RunState::Error,
                    error = %e,
                    "validation run failed"
                );
                ValidationResponse::failed(e.to_string())
            }
        }
    }

    fn publish(&self, result: ConsolidatedResult, request: ValidationRequest) {
        let Some(sink) = self.report.clone() else {
            return;
        };
        let report = Report::new(result, request, &self.bucket);
        self.publishing.spawn(async move {
            if let Err(e) = sink.publish(&report).await {
                tracing::warn!(error = %e, "could not publish validation report");
            }
        });
    }

    /// Wait, up to `within`, for background report publishing to finish.
    pub async fn flush_reports(&self, within: Duration) {
        self.publishing.close();
        if tokio::time::timeout(within, self.publishing.wait()).await.is_err() {
            tracing::warn!(pending = self.publishing.len(), "report publishing still pending");
        }
        self.publishing.reopen();
    }
}
