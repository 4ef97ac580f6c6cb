//! Decision components of the chat pipeline.
//!
//! Every component here is synchronous, owns its own concurrency-safe state and
//! is handed to the orchestrator by reference; nothing is a process global.

pub mod cache;
pub mod emergency;
pub mod faq;
pub mod i18n;
pub mod rate_limit;
pub mod safety;
pub mod sanitize;
pub mod sections;

use concierge_contracts::Language;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use cache::{CacheStats, ResponseCache};
pub use emergency::{
    EmergencyController, EmergencyReply, EmergencyReplySource, EmergencyStatus, Transition,
};
pub use faq::{
    FaqClassification, FaqClassifier, FaqEntry, FaqMatch, FaqStats, MatchMethod,
    FAQ_PUBLISH_THRESHOLD,
};
pub use i18n::{Localizer, LocalizerStats};
pub use rate_limit::{
    AdmissionDecision, ClientIdentity, DenyReason, GlobalRateStats, RateLimitConfig, RateLimiter,
    WindowLimit, WindowStats,
};
pub use safety::{
    RuleAction, RulePattern, SafetyChecker, SafetyIssue, SafetyLevel, SafetyRuleSpec, SafetyStats,
    SafetyVerdict,
};
pub use sanitize::{InputSanitizer, Rejection, SanitizationResult, SanitizerConfig, Transformation};
pub use sections::{
    EnforcementAction, Section, SectionGuidance, SectionIssue, SectionStats, SectionSummary,
    SectionValidation, SectionValidator,
};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid pattern {id}: {message}")]
    InvalidPattern { id: String, message: String },
    #[error("duplicate catalog entry: {0}")]
    DuplicateEntry(String),
    #[error("catalog lock poisoned: {0}")]
    CatalogPoisoned(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("clock error: {0}")]
    Clock(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Cache key for a processed request. Stable across processes and field order.
pub fn request_fingerprint(message: &str, context: Option<&str>, language: Language) -> String {
    let payload = json!({
        "message": message,
        "context": context.unwrap_or_default(),
        "language": language.code(),
    });
    jcs_sha256_hex(&payload).unwrap_or_else(|_| {
        sha256_hex(format!("{message}\u{0}{}\u{0}{language}", context.unwrap_or_default()).as_bytes())
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lowercased alphanumeric tokens; punctuation never sticks to a word.
pub(crate) fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}
