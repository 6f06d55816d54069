//! Request and response shapes of the gateway
//!
//! All request fields default to empty so that a missing field and an empty
//! one are reported the same way, as a validation failure naming the field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, GatewayError, Result};
use crate::observability::ExecutionStats;
use crate::prompts::{Prompt, ScaffoldSettings};

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::validation(field, "field is required"));
    }
    Ok(())
}

/// Generate a project plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaffoldRequest {
    pub description: String,
    pub language: String,
    pub template: String,
    pub package_manager: Option<String>,
    pub license: Option<String>,
}

impl ScaffoldRequest {
    pub fn validate(&self) -> Result<()> {
        require("description", &self.description)?;
        require("language", &self.language)?;
        require("template", &self.template)
    }

    /// Settings with defaults filled in for the optional fields.
    pub fn settings(&self) -> ScaffoldSettings {
        ScaffoldSettings {
            language: self.language.clone(),
            template: self.template.clone(),
            package_manager: non_empty_or(&self.package_manager, "cargo"),
            license: non_empty_or(&self.license, "MIT"),
        }
    }
}

fn non_empty_or(value: &Option<String>, fallback: &str) -> String {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisType {
    Reasoning,
    Summary,
    Stakeholder,
}

impl AnalysisType {
    pub fn prompt(self, problem: &str) -> Prompt<'_> {
        match self {
            AnalysisType::Reasoning => Prompt::Reasoning { problem },
            AnalysisType::Summary => Prompt::Summary { text: problem },
            AnalysisType::Stakeholder => Prompt::Stakeholders { text: problem },
        }
    }
}

/// Analyze a problem statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisRequest {
    pub problem: String,
    pub analysis_type: Option<String>,
}

impl AnalysisRequest {
    pub fn new(problem: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            analysis_type: None,
        }
    }

    pub fn analysis_type(&self) -> Result<AnalysisType> {
        match self.analysis_type.as_deref() {
            None | Some("") | Some("reasoning") => Ok(AnalysisType::Reasoning),
            Some("summary") => Ok(AnalysisType::Summary),
            Some("stakeholder") => Ok(AnalysisType::Stakeholder),
            Some(other) => Err(GatewayError::validation(
                "analysis_type",
                format!("unknown analysis type: {other}"),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("problem", &self.problem)?;
        self.analysis_type().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Readme,
    Summary,
    Analysis,
}

impl OutputFormat {
    pub fn prompt(self, text: &str) -> Prompt<'_> {
        match self {
            OutputFormat::Readme => Prompt::ReadmeSection { text },
            OutputFormat::Summary => Prompt::DocumentSummary { text },
            OutputFormat::Analysis => Prompt::DocumentAnalysis { text },
        }
    }
}

/// Process a document into the requested format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentRequest {
    pub content: String,
    pub output_format: Option<String>,
}

impl DocumentRequest {
    pub fn output_format(&self) -> Result<OutputFormat> {
        match self.output_format.as_deref() {
            None | Some("") | Some("readme") => Ok(OutputFormat::Readme),
            Some("summary") => Ok(OutputFormat::Summary),
            Some("analysis") => Ok(OutputFormat::Analysis),
            Some(other) => Err(GatewayError::validation(
                "output_format",
                format!("unknown output format: {other}"),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("content", &self.content)?;
        self.output_format().map(|_| ())
    }
}

/// Any request the gateway handles, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayRequest {
    Scaffold(ScaffoldRequest),
    Analyze(AnalysisRequest),
    ProcessDocument(DocumentRequest),
}

impl GatewayRequest {
    /// Build a request from a kind name and a JSON object of fields.
    ///
    /// Accepts `scaffold`, `analyze` (or `analysis`) and `process_document`
    /// (or `process-document`, `document`).
    pub fn from_fields(kind: &str, fields: Value) -> Result<Self> {
        let canonical = match kind {
            "scaffold" => "scaffold",
            "analyze" | "analysis" => "analyze",
            "process_document" | "process-document" | "document" => "process_document",
            other => {
                return Err(GatewayError::validation(
                    "kind",
                    format!("unknown request kind: {other}"),
                ))
            }
        };
        let mut map = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(GatewayError::validation("fields", "expected a JSON object")),
        };
        map.insert("kind".into(), Value::String(canonical.into()));
        serde_json::from_value(Value::Object(map))
            .map_err(|e| GatewayError::validation("fields", e.to_string()))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            GatewayRequest::Scaffold(_) => "scaffold",
            GatewayRequest::Analyze(_) => "analyze",
            GatewayRequest::ProcessDocument(_) => "process_document",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            GatewayRequest::Scaffold(r) => r.validate(),
            GatewayRequest::Analyze(r) => r.validate(),
            GatewayRequest::ProcessDocument(r) => r.validate(),
        }
    }
}

/// Uniform result envelope: bad input and backend failures both come back as
/// `success = false` with a message and its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn success(request_id: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            timestamp: Utc::now(),
            request_id: request_id.into(),
        }
    }

    pub fn failure(request_id: impl Into<String>, err: &GatewayError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            timestamp: Utc::now(),
            request_id: request_id.into(),
        }
    }
}

/// One entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    #[serde(flatten)]
    pub request: GatewayRequest,
}

/// Per-item batch outcome, in the same position as its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl BatchItemResult {
    pub fn from_outcome(id: String, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(data) => Self {
                id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                id,
                success: false,
                data: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub backend: String,
    pub backend_status: String,
    pub stats: ExecutionStats,
    pub timestamp: DateTime<Utc>,
}
