use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{KernelError, KernelResult};

pub const BLOCKED_RESPONSE: &str = "Lo siento, no puedo procesar ese tipo de solicitud. Por favor, haz una pregunta relacionada con mi perfil profesional.";
pub const UNSAFE_RESPONSE: &str = "Hay un problema con la respuesta generada. Por favor, intenta reformular tu pregunta sobre mi experiencia o habilidades.";
pub const ERROR_RESPONSE: &str = "Ocurrió un error al generar la respuesta. Por favor, intenta de nuevo con una pregunta sobre mi perfil profesional.";

const FILTER_MARKER: &str = "[FILTRADO]";
const URL_MARKER: &str = "[URL_FILTRADA]";
const SHORTENED_URL: &str = r"(bit\.ly|tinyurl|goo\.gl)/\w+";

const MAX_OUTPUT_CHARS: usize = 2000;
const MIN_OUTPUT_CHARS: usize = 10;
const MAX_REPETITION_RATIO: f64 = 3.0;
const OUTPUT_RUN_LIMIT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    #[default]
    Safe,
    Warning,
    Unsafe,
    Blocked,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Warning => "warning",
            SafetyLevel::Unsafe => "unsafe",
            SafetyLevel::Blocked => "blocked",
        }
    }

    pub fn is_acceptable(self) -> bool {
        self <= SafetyLevel::Warning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Filter,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePattern {
    Regex(String),
    /// A single character repeated at least `min_run` times in a row.
    RepeatedChar { min_run: usize },
}

#[derive(Debug, Clone)]
pub struct SafetyRuleSpec {
    pub id: String,
    pub pattern: RulePattern,
    pub level: SafetyLevel,
    pub category: String,
    pub description: String,
    pub action: RuleAction,
}

impl SafetyRuleSpec {
    pub fn new(
        id: &str,
        pattern: RulePattern,
        level: SafetyLevel,
        category: &str,
        description: &str,
        action: RuleAction,
    ) -> Self {
        Self {
            id: id.to_string(),
            pattern,
            level,
            category: category.to_string(),
            description: description.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyIssue {
    pub rule_id: String,
    pub category: String,
    pub level: SafetyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub level: SafetyLevel,
    pub issues: Vec<SafetyIssue>,
    pub text: String,
    pub was_filtered: bool,
    #[serde(skip)]
    pub internal_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyStats {
    pub total_rules: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

enum Matcher {
    Pattern(Regex),
    RepeatedChar { min_run: usize },
}

impl Matcher {
    fn compile(id: &str, pattern: &RulePattern) -> KernelResult<Self> {
        match pattern {
            RulePattern::Regex(source) => RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .map(Matcher::Pattern)
                .map_err(|err| KernelError::InvalidPattern {
                    id: id.to_string(),
                    message: err.to_string(),
                }),
            RulePattern::RepeatedChar { min_run } if *min_run < 2 => {
                Err(KernelError::InvalidPattern {
                    id: id.to_string(),
                    message: format!("repeated-char run must be at least 2, got {min_run}"),
                })
            }
            RulePattern::RepeatedChar { min_run } => Ok(Matcher::RepeatedChar { min_run: *min_run }),
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Pattern(re) => re.is_match(text),
            Matcher::RepeatedChar { min_run } => has_run(text, *min_run),
        }
    }

    fn redact(&self, text: &str) -> String {
        match self {
            Matcher::Pattern(re) => re.replace_all(text, FILTER_MARKER).into_owned(),
            Matcher::RepeatedChar { min_run } => {
                rewrite_runs(text, *min_run, |_, _| FILTER_MARKER.to_string())
            }
        }
    }
}

struct SafetyRule {
    spec: SafetyRuleSpec,
    matcher: Matcher,
}

/// Severity-ordered rule catalog applied to user input and generated output.
pub struct SafetyChecker {
    rules: RwLock<Vec<SafetyRule>>,
    shortened_url: Regex,
}

impl SafetyChecker {
    pub fn new() -> KernelResult<Self> {
        let rules = default_rules()
            .into_iter()
            .map(|spec| {
                let matcher = Matcher::compile(&spec.id, &spec.pattern)?;
                Ok(SafetyRule { spec, matcher })
            })
            .collect::<KernelResult<Vec<_>>>()?;
        let shortened_url = RegexBuilder::new(SHORTENED_URL)
            .case_insensitive(true)
            .build()
            .map_err(|err| KernelError::InvalidPattern {
                id: "shortened_url".to_string(),
                message: err.to_string(),
            })?;
        info!(rules = rules.len(), "safety checker ready");
        Ok(Self {
            rules: RwLock::new(rules),
            shortened_url,
        })
    }

    /// Adds a rule, replacing any rule with the same id.
    pub fn add_rule(&self, spec: SafetyRuleSpec) -> KernelResult<()> {
        let matcher = Matcher::compile(&spec.id, &spec.pattern)?;
        let mut rules = self
            .rules
            .write()
            .map_err(|_| KernelError::CatalogPoisoned("safety rules"))?;
        let id = spec.id.clone();
        let rule = SafetyRule { spec, matcher };
        match rules.iter_mut().find(|r| r.spec.id == id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        info!(rule = %id, "safety rule added");
        Ok(())
    }

    /// Fails open: an internal error lets the text through unchanged.
    pub fn check_input(&self, text: &str) -> SafetyVerdict {
        match self.try_check_input(text) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(error = %err, "input safety check failed open");
                SafetyVerdict {
                    is_safe: true,
                    level: SafetyLevel::Safe,
                    issues: Vec::new(),
                    text: text.to_string(),
                    was_filtered: false,
                    internal_error: Some(err.to_string()),
                }
            }
        }
    }

    fn try_check_input(&self, text: &str) -> KernelResult<SafetyVerdict> {
        let rules = self
            .rules
            .read()
            .map_err(|_| KernelError::CatalogPoisoned("safety rules"))?;

        let mut issues = Vec::new();
        let mut level = SafetyLevel::Safe;
        let mut filtered = text.to_string();
        let mut blocked = false;

        for rule in rules.iter() {
            if !rule.matcher.is_match(text) {
                continue;
            }
            issues.push(issue_for(&rule.spec));
            level = level.max(rule.spec.level);
            match rule.spec.action {
                RuleAction::Block => blocked = true,
                RuleAction::Filter => filtered = rule.matcher.redact(&filtered),
                RuleAction::Warn => {}
            }
        }
        if blocked {
            filtered.clear();
        }

        Ok(SafetyVerdict {
            is_safe: level.is_acceptable(),
            level,
            was_filtered: filtered != text,
            issues,
            text: filtered,
            internal_error: None,
        })
    }

    /// Fails closed: an internal error replaces the output with the error template.
    pub fn check_output(&self, text: &str, question: Option<&str>) -> SafetyVerdict {
        match self.try_check_output(text, question) {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(error = %err, "output safety check failed closed");
                SafetyVerdict {
                    is_safe: false,
                    level: SafetyLevel::Unsafe,
                    issues: vec![SafetyIssue {
                        rule_id: "internal_error".to_string(),
                        category: "error".to_string(),
                        level: SafetyLevel::Unsafe,
                        action: None,
                        description: "safety evaluation failed".to_string(),
                    }],
                    text: ERROR_RESPONSE.to_string(),
                    was_filtered: true,
                    internal_error: Some(err.to_string()),
                }
            }
        }
    }

    fn try_check_output(&self, text: &str, question: Option<&str>) -> KernelResult<SafetyVerdict> {
        let rules = self
            .rules
            .read()
            .map_err(|_| KernelError::CatalogPoisoned("safety rules"))?;

        let mut issues: Vec<SafetyIssue> = rules
            .iter()
            .filter(|rule| rule.matcher.is_match(text))
            .map(|rule| issue_for(&rule.spec))
            .collect();
        drop(rules);
        issues.extend(content_issues(text));
        if let Some(question) = question {
            issues.extend(coherence_issue(text, question));
        }

        let level = issues
            .iter()
            .map(|issue| issue.level)
            .max()
            .unwrap_or_default();
        let safe_text = match level {
            SafetyLevel::Blocked => BLOCKED_RESPONSE.to_string(),
            SafetyLevel::Unsafe => UNSAFE_RESPONSE.to_string(),
            SafetyLevel::Warning => self.apply_output_filters(text),
            SafetyLevel::Safe => text.to_string(),
        };

        Ok(SafetyVerdict {
            is_safe: level.is_acceptable(),
            level,
            was_filtered: safe_text != text,
            issues,
            text: safe_text,
            internal_error: None,
        })
    }

    fn apply_output_filters(&self, text: &str) -> String {
        let without_urls = self.shortened_url.replace_all(text, URL_MARKER);
        rewrite_runs(&without_urls, OUTPUT_RUN_LIMIT, |c, _| c.to_string().repeat(3))
    }

    pub fn stats(&self) -> SafetyStats {
        let mut stats = SafetyStats {
            total_rules: 0,
            by_level: BTreeMap::new(),
            by_category: BTreeMap::new(),
        };
        let Ok(rules) = self.rules.read() else {
            return stats;
        };
        stats.total_rules = rules.len();
        for rule in rules.iter() {
            *stats
                .by_level
                .entry(rule.spec.level.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_category
                .entry(rule.spec.category.clone())
                .or_default() += 1;
        }
        stats
    }
}

fn default_rules() -> Vec<SafetyRuleSpec> {
    use RuleAction::*;
    use SafetyLevel::*;
    let re = |p: &str| RulePattern::Regex(p.to_string());
    vec![
        SafetyRuleSpec::new(
            "inappropriate_content",
            re(r"(sexo|drogas|violencia|odio|discriminación)"),
            Blocked,
            "inappropriate_content",
            "inappropriate content detected",
            Block,
        ),
        SafetyRuleSpec::new(
            "personal_info",
            re(r"(\d{3}-\d{2}-\d{4}|\d{16}|password|contraseña)"),
            Unsafe,
            "personal_information",
            "possible sensitive personal information",
            Filter,
        ),
        SafetyRuleSpec::new(
            "offensive_language",
            re(r"(idiota|estúpido|maldito|carajo)"),
            Warning,
            "offensive_language",
            "potentially offensive language",
            Warn,
        ),
        SafetyRuleSpec::new(
            "unauthorized_requests",
            re(r"(hackear|crackear|piratear|robar|contraseña)"),
            Blocked,
            "unauthorized_request",
            "unauthorized request detected",
            Block,
        ),
        SafetyRuleSpec::new(
            "spam_content",
            RulePattern::RepeatedChar { min_run: 11 },
            Warning,
            "spam",
            "possible spam",
            Filter,
        ),
        SafetyRuleSpec::new(
            "suspicious_urls",
            re(SHORTENED_URL),
            Warning,
            "suspicious_url",
            "shortened url detected",
            Warn,
        ),
        SafetyRuleSpec::new(
            "malicious_code",
            re(r"(eval\(|exec\(|<script|javascript:)"),
            Blocked,
            "malicious_code",
            "potentially malicious code",
            Block,
        ),
    ]
}

fn issue_for(spec: &SafetyRuleSpec) -> SafetyIssue {
    SafetyIssue {
        rule_id: spec.id.clone(),
        category: spec.category.clone(),
        level: spec.level,
        action: Some(spec.action),
        description: spec.description.clone(),
    }
}

fn heuristic(rule_id: &str, level: SafetyLevel, description: &str) -> SafetyIssue {
    SafetyIssue {
        rule_id: rule_id.to_string(),
        category: rule_id.to_string(),
        level,
        action: None,
        description: description.to_string(),
    }
}

fn content_issues(text: &str) -> Vec<SafetyIssue> {
    let mut issues = Vec::new();
    if text.chars().count() > MAX_OUTPUT_CHARS {
        issues.push(heuristic("excessive_length", SafetyLevel::Warning, "response too long"));
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() > 10 {
        let unique: HashSet<&str> = words.iter().copied().collect();
        if words.len() as f64 / unique.len() as f64 > MAX_REPETITION_RATIO {
            issues.push(heuristic(
                "excessive_repetition",
                SafetyLevel::Warning,
                "response is highly repetitive",
            ));
        }
    }
    if text.trim().chars().count() < MIN_OUTPUT_CHARS {
        issues.push(heuristic(
            "insufficient_content",
            SafetyLevel::Unsafe,
            "response too short or empty",
        ));
    }
    issues
}

fn coherence_issue(text: &str, question: &str) -> Option<SafetyIssue> {
    let question = question.to_lowercase();
    let answer = text.to_lowercase();
    let question_words: HashSet<&str> = question.split_whitespace().collect();
    if question_words.len() <= 3 {
        return None;
    }
    let answer_words: HashSet<&str> = answer.split_whitespace().collect();
    let common = question_words.intersection(&answer_words).count();
    (common < 2).then(|| {
        heuristic(
            "low_coherence",
            SafetyLevel::Warning,
            "response barely related to the question",
        )
    })
}

fn has_run(text: &str, min_run: usize) -> bool {
    let mut prev = None;
    let mut run = 0;
    for c in text.chars() {
        if Some(c) == prev && c != '\n' {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run >= min_run {
            return true;
        }
    }
    false
}

/// Rewrites every run of `min_run` or more identical characters.
fn rewrite_runs(text: &str, min_run: usize, replace: impl Fn(char, usize) -> String) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut j = i + 1;
        while j < chars.len() && chars[j] == c && c != '\n' {
            j += 1;
        }
        let run = j - i;
        if run >= min_run {
            out.push_str(&replace(c, run));
        } else {
            out.extend(std::iter::repeat(c).take(run));
        }
        i = j;
    }
    out
}
