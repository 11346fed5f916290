pub mod chunk;
pub mod consolidate;
pub mod error;
pub mod rules;
pub mod select;
pub mod workspace;

pub use error::{ConfigurationError, FetchError, SettingsError};
pub use rules::Scope;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;

// --- Rules ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Structural,
    Content,
    Semantic,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Structural => "structural",
            Category::Content => "content",
            Category::Semantic => "semantic",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity tier. Ordered so that `High` compares greatest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Low => "low",
            Criticality::Medium => "medium",
            Criticality::High => "high",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule exactly as a rule source delivers it. Nothing here is trusted until
/// `rules::classify` turns it into a [`Rule`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
    #[serde(default)]
    pub criticality: Option<String>,
    /// Glob patterns of the files the rule looks at. Empty means everything.
    #[serde(default, alias = "references")]
    pub scope: Vec<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub category: Category,
    pub criticality: Criticality,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Rule {
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} ({}, {})",
            self.id, self.description, self.category, self.criticality
        )
    }
}

// --- Repository content ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub text: String,
}

/// Rendered repository: a directory summary plus file texts in a stable order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryContent {
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Files that were wanted but whose text could not be fetched
    #[serde(default)]
    pub unread: Vec<String>,
}

impl RepositoryContent {
    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.text.len()).sum()
    }
}

// --- Verdicts ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evidence {
    pub quote: String,
    pub location: String,
}

impl Evidence {
    pub fn note(text: impl Into<String>) -> Self {
        Self {
            quote: text.into(),
            location: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quote.trim().is_empty() && self.location.trim().is_empty()
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.quote.trim(), self.location.trim()) {
            ("", "") => Ok(()),
            (quote, "") => write!(f, "\"{quote}\""),
            ("", location) => write!(f, "at {location}"),
            (quote, location) => write!(f, "\"{quote}\" at {location}"),
        }
    }
}

/// Lifecycle of one validation task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Dispatched,
    Retrying,
    VerdictOk,
    Undetermined,
}

/// Outcome of one (rule, chunk) validation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub rule_id: String,
    pub chunk_index: usize,
    pub compliant: bool,
    pub undetermined: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub evidence: Evidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub attempts: u32,
    pub state: TaskState,
}

impl Verdict {
    pub fn decided(
        rule_id: &str,
        chunk_index: usize,
        compliant: bool,
        evidence: Evidence,
        model: &str,
        attempts: u32,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            chunk_index,
            compliant,
            undetermined: false,
            cancelled: false,
            evidence,
            model: Some(model.to_string()),
            attempts,
            state: TaskState::VerdictOk,
        }
    }

    pub fn undetermined(
        rule_id: &str,
        chunk_index: usize,
        reason: impl Into<String>,
        model: Option<&str>,
        attempts: u32,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            chunk_index,
            compliant: false,
            undetermined: true,
            cancelled: false,
            evidence: Evidence::note(reason),
            model: model.map(str::to_string),
            attempts,
            state: TaskState::Undetermined,
        }
    }

    pub fn cancelled(rule_id: &str, chunk_index: usize, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            cancelled: true,
            ..Self::undetermined(rule_id, chunk_index, reason, None, attempts)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Compliant,
    NonCompliant,
    Undetermined,
}

/// All verdicts of one rule merged together.
#[derive(Debug, Clone, Serialize)]
pub struct RuleVerdict {
    pub rule_id: String,
    pub description: String,
    pub category: Category,
    pub criticality: Criticality,
    pub status: RuleStatus,
    pub cancelled: bool,
    pub evidence: Vec<Evidence>,
    pub models: Vec<String>,
    pub chunks: usize,
}

impl RuleVerdict {
    /// Logical AND across chunks: one non-compliant chunk makes the rule
    /// non-compliant even if other chunks are undetermined. Evidence is kept
    /// from the chunks that decided the status, in chunk order.
    pub fn merge(rule: &Rule, mut verdicts: Vec<Verdict>) -> Self {
        verdicts.sort_by_key(|v| v.chunk_index);

        let status = if verdicts.is_empty() {
            RuleStatus::Undetermined
        } else if verdicts.iter().any(|v| !v.undetermined && !v.compliant) {
            RuleStatus::NonCompliant
        } else if verdicts.iter().any(|v| v.undetermined) {
            RuleStatus::Undetermined
        } else {
            RuleStatus::Compliant
        };

        let deciding = |v: &Verdict| match status {
            RuleStatus::Compliant => true,
            RuleStatus::NonCompliant => !v.undetermined && !v.compliant,
            RuleStatus::Undetermined => v.undetermined,
        };

        let mut evidence: Vec<Evidence> = verdicts
            .iter()
            .filter(|v| deciding(*v))
            .map(|v| v.evidence.clone())
            .filter(|e| !e.is_empty())
            .collect();
        if verdicts.is_empty() {
            evidence.push(Evidence::note("no verdict was produced for this rule"));
        }

        let mut models: Vec<String> = Vec::new();
        for model in verdicts.iter().filter_map(|v| v.model.as_ref()) {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }

        Self {
            rule_id: rule.id.clone(),
            description: rule.description.clone(),
            category: rule.category,
            criticality: rule.criticality,
            status,
            cancelled: status == RuleStatus::Undetermined && verdicts.iter().any(|v| v.cancelled),
            evidence,
            models,
            chunks: verdicts.len(),
        }
    }

    pub fn is_compliant(&self) -> bool {
        self.status == RuleStatus::Compliant
    }

    pub fn is_undetermined(&self) -> bool {
        self.status == RuleStatus::Undetermined
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedResult {
    pub passed: bool,
    pub message: String,
    pub total_rules: usize,
    pub high_failures: usize,
    pub medium_failures: usize,
    pub low_failures: usize,
    pub undetermined: usize,
    pub rule_verdicts: Vec<RuleVerdict>,
    /// Files the rules wanted but that could not be read
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unread_files: Vec<String>,
}

// --- Request / response ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ValidationRequest {
    /// Repository to validate (https://, http:// or file:// URL)
    #[serde(default)]
    pub repository_url: String,
    /// Name of the person requesting the validation
    #[serde(default)]
    pub user_name: String,
    /// Email of the person requesting the validation
    #[serde(default)]
    pub user_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResponse {
    pub validation_result: bool,
    pub message: String,
}

impl ValidationResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            validation_result: false,
            message: message.into(),
        }
    }
}

impl From<&ConsolidatedResult> for ValidationResponse {
    fn from(result: &ConsolidatedResult) -> Self {
        Self {
            validation_result: result.passed,
            message: result.message.clone(),
        }
    }
}

// --- Settings ---

/// Everything a run needs to know, resolved once at start-up and handed to
/// the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub provider: String,
    pub api_key: String,
    pub economy_model: String,
    pub premium_model: String,
    /// Chunk budget in bytes for the economy model
    pub economy_budget_bytes: usize,
    /// Chunk budget in bytes for the premium model
    pub premium_budget_bytes: usize,

    pub sync_rules_lambda: String,
    pub get_repo_structure_lambda: String,
    pub file_reader_lambda: String,
    pub report_lambda: String,
    pub s3_bucket: String,
    pub bedrock_region: String,

    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub task_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub short_circuit: bool,

    pub medium_failure_threshold: usize,
    pub low_failure_threshold: usize,
    pub undetermined_counts_as_failure: bool,

    /// Files larger than this are skipped by the local content source
    pub max_file_bytes: u64,
    /// Parallel reads against the file reader endpoint
    pub download_concurrency: usize,
    /// Directory structures longer than this are cut before prompting
    pub max_tree_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_key: String::new(),
            economy_model: "claude-3-haiku-20240307".to_string(),
            premium_model: "claude-3-5-sonnet-20240620".to_string(),
            economy_budget_bytes: 200_000,
            premium_budget_bytes: 320_000,
            sync_rules_lambda: String::new(),
            get_repo_structure_lambda: String::new(),
            file_reader_lambda: String::new(),
            report_lambda: String::new(),
            s3_bucket: String::new(),
            bedrock_region: "us-east-1".to_string(),
            max_concurrency: 4,
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            task_timeout_secs: 120,
            run_timeout_secs: 840,
            short_circuit: false,
            medium_failure_threshold: 0,
            low_failure_threshold: 0,
            undetermined_counts_as_failure: true,
            max_file_bytes: 1_048_576,
            download_concurrency: 8,
            max_tree_bytes: 32_768,
        }
    }
}

impl Settings {
    /// Settings file overlaid with the process environment.
    pub fn load() -> Self {
        let mut settings = read_settings();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    /// Overlay values from `lookup`. Unparseable numbers are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = value.trim().to_string();
            }
        };

        text("SYNC_RULES_LAMBDA", &mut self.sync_rules_lambda);
        text("GET_REPO_STRUCTURE_LAMBDA", &mut self.get_repo_structure_lambda);
        text("FILE_READER_LAMBDA", &mut self.file_reader_lambda);
        text("REPORT_LAMBDA", &mut self.report_lambda);
        text("S3_BUCKET", &mut self.s3_bucket);
        text("BEDROCK_REGION", &mut self.bedrock_region);
        text("RULEGATE_PROVIDER", &mut self.provider);
        text("RULEGATE_API_KEY", &mut self.api_key);
        text("RULEGATE_ECONOMY_MODEL", &mut self.economy_model);
        text("RULEGATE_PREMIUM_MODEL", &mut self.premium_model);

        if let Some(n) = parsed(&lookup, "RULEGATE_MAX_CONCURRENCY") {
            self.max_concurrency = n;
        }
        if let Some(n) = parsed(&lookup, "MAX_RETRIES") {
            self.max_attempts = n;
        }
        if let Some(n) = parsed(&lookup, "RULEGATE_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = n;
        }
        if let Some(b) = parsed(&lookup, "RULEGATE_SHORT_CIRCUIT") {
            self.short_circuit = b;
        }
        if let Some(n) = parsed(&lookup, "MAX_FILE_SIZE_BYTES") {
            self.max_file_bytes = n;
        }
        if let Some(n) = parsed(&lookup, "RULEGATE_DOWNLOAD_CONCURRENCY") {
            self.download_concurrency = n;
        }
    }

    /// Reject settings a run cannot honour. Called once before any fetch.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !ai_configured(self) {
            return Err(SettingsError::ProviderNotConfigured {
                provider: self.provider.clone(),
            });
        }
        for (key, value) in [
            ("economyBudgetBytes", self.economy_budget_bytes),
            ("premiumBudgetBytes", self.premium_budget_bytes),
        ] {
            if value < chunk::MIN_BUDGET {
                return Err(SettingsError::BudgetTooSmall {
                    key,
                    value,
                    min: chunk::MIN_BUDGET,
                });
            }
        }
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Resolve the global settings directory (~/.rulegate/).
pub fn settings_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rulegate")
}

fn settings_path() -> PathBuf {
    settings_dir().join("settings.json")
}

pub fn read_settings() -> Settings {
    let path = settings_path();
    if !path.exists() {
        return Settings::default();
    }
    fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn ai_configured(settings: &Settings) -> bool {
    !settings.provider.is_empty()
        && !settings.economy_model.is_empty()
        && !settings.premium_model.is_empty()
        && (settings.provider == "ollama" || !settings.api_key.is_empty())
}
