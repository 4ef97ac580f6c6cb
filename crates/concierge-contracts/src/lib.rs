use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const API_VERSION: &str = "1.0.0";

/// Flow-path tags recorded on the trace when the pipeline takes a branch.
pub mod flow {
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const INPUT_VALIDATION_FAILED: &str = "input_validation_failed";
    pub const INPUT_UNSAFE: &str = "input_unsafe";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const EMERGENCY_MODE: &str = "emergency_mode";
    pub const SECTION_GUIDANCE: &str = "section_guidance";
    pub const SECTION_CLARIFICATION: &str = "section_clarification";
    pub const FAQ_RESPONSE: &str = "faq_response";
    pub const RAG_GENERATION: &str = "rag_generation";
    pub const LLM_UNAVAILABLE_TEMPLATE: &str = "llm_unavailable_template";
    pub const RAG_ERROR_TEMPLATE: &str = "rag_error_template";
    pub const OUTPUT_UNSAFE_TEMPLATE: &str = "output_unsafe_template";
    pub const CANCELLED: &str = "cancelled";
    pub const CRITICAL_ERROR: &str = "critical_error";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Es, Language::En];

    pub fn code(self) -> &'static str {
        match self {
            Language::Es => "es",
            Language::En => "en",
        }
    }

    /// Accepts bare codes and locale tags (`en-US`, `es_MX`).
    pub fn parse(value: &str) -> Option<Language> {
        let trimmed = value.trim().to_ascii_lowercase();
        let primary = trimmed
            .split(|c: char| c == '-' || c == '_' || c == ',' || c == ';')
            .next()
            .unwrap_or_default();
        match primary {
            "es" => Some(Language::Es),
            "en" => Some(Language::En),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Faq,
    Rag,
    Template,
    Cache,
    Emergency,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseSource::Faq => "faq",
            ResponseSource::Rag => "rag",
            ResponseSource::Template => "template",
            ResponseSource::Cache => "cache",
            ResponseSource::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServicesHealth {
    pub llm_available: bool,
    pub vector_store_available: bool,
    pub embedding_available: bool,
}

impl ServicesHealth {
    pub fn all_available() -> Self {
        Self {
            llm_available: true,
            vector_store_available: true,
            embedding_available: true,
        }
    }

    pub fn unavailable(&self) -> Vec<&'static str> {
        let mut down = Vec::new();
        if !self.llm_available {
            down.push("llm");
        }
        if !self.vector_store_available {
            down.push("vector_store");
        }
        if !self.embedding_available {
            down.push("embedding");
        }
        down
    }
}

/// Per-request provenance: stages completed, their timings and the branches taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineTrace {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default)]
    pub steps_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processing_time_ms: BTreeMap<String, f64>,
    #[serde(default)]
    pub flow_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_section: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_transformations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_status: Option<ServicesHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time_ms: Option<f64>,
    #[serde(skip)]
    pub internal_error: Option<String>,
}

impl PipelineTrace {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    pub fn complete(&mut self, stage: &str, elapsed: Duration) {
        self.steps_completed.push(stage.to_string());
        self.record_time(stage, elapsed);
    }

    pub fn record_time(&mut self, stage: &str, elapsed: Duration) {
        self.processing_time_ms
            .insert(stage.to_string(), elapsed.as_secs_f64() * 1000.0);
    }

    pub fn push_path(&mut self, tag: &str) {
        self.flow_path.push(tag.to_string());
    }

    pub fn has_path(&self, tag: &str) -> bool {
        self.flow_path.iter().any(|t| t == tag)
    }

    /// Coarse provenance only; timings and per-request identifiers are dropped.
    pub fn coarse(&self) -> PipelineTrace {
        PipelineTrace {
            steps_completed: self.steps_completed.clone(),
            flow_path: self.flow_path.clone(),
            detected_section: self.detected_section.clone(),
            ..PipelineTrace::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            language: None,
            session_id: None,
            section: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub source: ResponseSource,
    pub language: Language,
    pub from_cache: bool,
    pub metadata: PipelineTrace,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_used: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_found: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub question_templates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl ChatResponse {
    pub fn new(success: bool, response: impl Into<String>, source: ResponseSource) -> Self {
        Self {
            success,
            response: response.into(),
            error: None,
            guidance: None,
            source,
            language: Language::default(),
            from_cache: false,
            metadata: PipelineTrace::default(),
            timestamp: String::new(),
            retry_after: None,
            confidence: None,
            category: None,
            sources_used: None,
            context_found: None,
            template_type: None,
            question_templates: Vec::new(),
            conflicting_sections: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Copy suitable for the response cache: timing metadata is stripped.
    pub fn for_cache(&self) -> ChatResponse {
        let mut cached = self.clone();
        cached.metadata = self.metadata.coarse();
        cached.from_cache = false;
        cached
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub documents_loaded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
