use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use rulegate_core::rules::classify;
use rulegate_core::select::{select_model, ModelCatalog};
use rulegate_core::workspace::service_id_from_url;
use rulegate_core::{Settings, ValidationRequest, ValidationResponse};
use rulegate_validate::Collaborators;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const INSTRUCTIONS: &str = "Rulegate validates a repository against the compliance rules registered \
for its service. Call validate_repository with the repository URL and the requesting user's name \
and email; it returns {validation_result, message}, where message lists every rule that failed or \
could not be decided, most critical first. Use list_rules to see which rules apply to a service and \
which model tier will judge each one, without running any validation.";

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ListRulesRequest {
    /// Repository URL or bare service id whose rules should be listed
    repository_url: String,
}

// --- Server ---

#[derive(Clone)]
pub struct RulegateServer {
    settings: Arc<Settings>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RulegateServer {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Validate a repository against its service's compliance rules. Returns JSON {validation_result: bool, message: string}. A failed validation is a normal result, not a tool error."
    )]
    async fn validate_repository(
        &self,
        Parameters(req): Parameters<ValidationRequest>,
    ) -> Result<CallToolResult, McpError> {
        let response = rulegate_validate::validate_repository(&self.settings, req).await;
        let json = serde_json::to_string_pretty(&response)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(
        description = "List the rules that apply to a repository's service, with category, criticality, the model that will judge each rule, its fallback and chunk budget. Does not invoke any model."
    )]
    async fn list_rules(
        &self,
        Parameters(req): Parameters<ListRulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Some(service_id) = service_id_from_url(&req.repository_url) else {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "'{}' does not name a service",
                req.repository_url
            ))]));
        };

        let collaborators = match Collaborators::from_settings(&self.settings) {
            Ok(c) => c,
            Err(e) => return Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        };
        let records = match collaborators.rules.fetch_rules(&service_id).await {
            Ok(records) => records,
            Err(e) => return Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        };
        let classification = match classify(records) {
            Ok(c) => c,
            Err(e) => return Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        };

        if classification.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "No rules are defined for '{service_id}'."
            ))]));
        }

        let catalog = ModelCatalog::from(self.settings.as_ref());
        let mut text = format!("{} rules for '{service_id}':\n", classification.len());
        for rule in &classification.rules {
            let choice = select_model(rule, &catalog);
            let fallback = if choice.fallbacks.is_empty() {
                "none".to_string()
            } else {
                choice.fallbacks.join(", ")
            };
            text.push_str(&format!(
                "- {} -> {} (fallback: {fallback}, budget: {} bytes)\n",
                rule.summary(),
                choice.primary,
                choice.budget_bytes
            ));
        }
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for RulegateServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Logs go to stderr: stdout carries the MCP stream or the JSON response.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();
}

/// Accepts the request itself or a gateway event carrying it in `body`.
fn request_from_json(input: &str) -> Result<ValidationRequest, String> {
    let mut value: Value =
        serde_json::from_str(input).map_err(|e| format!("invalid request JSON: {e}"))?;
    let value = match value.get_mut("body").map(Value::take) {
        Some(Value::String(body)) => {
            serde_json::from_str(&body).map_err(|e| format!("invalid request body: {e}"))?
        }
        Some(body @ Value::Object(_)) => body,
        _ => value,
    };
    serde_json::from_value(value).map_err(|e| format!("invalid request: {e}"))
}

/// Read one request from stdin, print one response to stdout. Exits
/// non-zero when the repository did not pass.
async fn run_once(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let response = match request_from_json(&input) {
        Ok(request) => rulegate_validate::validate_repository(settings, request).await,
        Err(e) => ValidationResponse::failed(e),
    };

    println!("{}", serde_json::to_string(&response)?);
    if !response.validation_result {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let settings = Settings::load();

    // Handle `rulegate-mcp run` subcommand
    if std::env::args().nth(1).as_deref() == Some("run") {
        return run_once(&settings).await;
    }

    let service = RulegateServer::new(settings)
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!("MCP server error: {e}"))?;
    service.waiting().await?;
    Ok(())
}
