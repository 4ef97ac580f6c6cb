use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

use crate::{KernelError, KernelResult};

const BLOCKED_PATTERNS: &[(&str, &str)] = &[
    ("script_tag", r"(?s)<script.*?>.*?</script>"),
    ("javascript_url", r"javascript:"),
    ("base64_data_url", r"data:.*base64"),
    ("eval_call", r"eval\("),
    ("exec_call", r"exec\("),
    ("import_statement", r"import\s+"),
    ("dunder", r"__.*__"),
];

const URL_PATTERN: &str = r"(https?://\S+|ftp://\S+|www\.\S+)";
pub const URL_PLACEHOLDER: &str = "[URL_REMOVIDA]";

const SUSPICIOUS_RATIO: f64 = 0.3;
const MIN_ALNUM_RATIO: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizerConfig {
    pub max_length: usize,
    pub min_length: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_length: 500,
            min_length: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Truncated,
    HtmlEscaped,
    UrlsRemoved,
    ControlCharsRemoved,
    WhitespaceCollapsed,
    UnicodeNormalized,
    HomoglyphsReplaced,
    Capitalized,
    PunctuationAdded,
}

impl Transformation {
    pub fn as_str(self) -> &'static str {
        match self {
            Transformation::Truncated => "truncated",
            Transformation::HtmlEscaped => "html_escaped",
            Transformation::UrlsRemoved => "urls_removed",
            Transformation::ControlCharsRemoved => "control_chars_removed",
            Transformation::WhitespaceCollapsed => "whitespace_collapsed",
            Transformation::UnicodeNormalized => "unicode_normalized",
            Transformation::HomoglyphsReplaced => "homoglyphs_replaced",
            Transformation::Capitalized => "capitalized",
            Transformation::PunctuationAdded => "punctuation_added",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    TooShort,
    BlockedPattern,
    BlockedContext,
    Empty,
    LowAlnumRatio,
    TooLong,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::TooShort => "too_short",
            Rejection::BlockedPattern => "blocked_pattern",
            Rejection::BlockedContext => "blocked_context",
            Rejection::Empty => "empty",
            Rejection::LowAlnumRatio => "low_alnum_ratio",
            Rejection::TooLong => "too_long",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizationResult {
    pub is_valid: bool,
    pub text: String,
    pub original_length: usize,
    pub final_length: usize,
    pub transformations: Vec<Transformation>,
    pub warnings: Vec<String>,
    pub rejection: Option<Rejection>,
}

impl SanitizationResult {
    fn rejected(original_length: usize, rejection: Rejection, warning: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            text: String::new(),
            original_length,
            final_length: 0,
            transformations: Vec::new(),
            warnings: vec![warning.into()],
            rejection: Some(rejection),
        }
    }
}

/// Pure text pipeline: validate, truncate, clean, normalize.
pub struct InputSanitizer {
    config: SanitizerConfig,
    blocked: Vec<(&'static str, Regex)>,
    url: Regex,
}

impl InputSanitizer {
    pub fn new(config: SanitizerConfig) -> KernelResult<Self> {
        if config.min_length > config.max_length {
            return Err(KernelError::InvalidConfig(format!(
                "min_length {} exceeds max_length {}",
                config.min_length, config.max_length
            )));
        }
        let blocked = BLOCKED_PATTERNS
            .iter()
            .map(|(id, pattern)| compile(id, pattern).map(|re| (*id, re)))
            .collect::<KernelResult<Vec<_>>>()?;
        let url = compile("url", URL_PATTERN)?;
        info!(max_length = config.max_length, "input sanitizer ready");
        Ok(Self {
            config,
            blocked,
            url,
        })
    }

    pub fn config(&self) -> SanitizerConfig {
        self.config
    }

    pub fn process(&self, raw: &str, context: Option<&str>) -> SanitizationResult {
        let original_length = raw.chars().count();

        if raw.trim().chars().count() < self.config.min_length {
            return SanitizationResult::rejected(original_length, Rejection::TooShort, "message too short");
        }
        if let Some(id) = self.blocked_match(raw) {
            debug!(pattern = id, "blocked pattern in message");
            return SanitizationResult::rejected(
                original_length,
                Rejection::BlockedPattern,
                "message contains disallowed content",
            );
        }
        if let Some(id) = context.and_then(|ctx| self.blocked_match(ctx)) {
            debug!(pattern = id, "blocked pattern in context");
            return SanitizationResult::rejected(
                original_length,
                Rejection::BlockedContext,
                "context contains disallowed content",
            );
        }

        let mut transformations = Vec::new();
        let mut warnings = Vec::new();

        let suspicious = raw.chars().filter(|c| !is_allowed_char(*c)).count();
        if suspicious as f64 > original_length as f64 * SUSPICIOUS_RATIO {
            warnings.push(format!("{suspicious} suspicious characters detected"));
        }

        let text = match truncate(raw, self.config.max_length) {
            Some(cut) => {
                warnings.push(format!(
                    "message truncated from {original_length} to {} characters",
                    cut.chars().count()
                ));
                transformations.push(Transformation::Truncated);
                cut
            }
            None => raw.to_string(),
        };

        let text = self.clean(&text, &mut transformations, &mut warnings);
        let text = self.normalize(&text, &mut transformations);
        // Escaping can grow the text past the limit again.
        let text = match fit_processed(&text, self.config.max_length) {
            Some(cut) => {
                if !transformations.contains(&Transformation::Truncated) {
                    transformations.push(Transformation::Truncated);
                }
                warnings.push(format!(
                    "processed message cut to {} characters",
                    cut.chars().count()
                ));
                cut
            }
            None => text,
        };
        let final_length = text.chars().count();

        let rejection = if text.trim().is_empty() {
            Some(Rejection::Empty)
        } else if alnum_ratio(&text) < MIN_ALNUM_RATIO {
            Some(Rejection::LowAlnumRatio)
        } else if final_length > self.config.max_length {
            Some(Rejection::TooLong)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            warnings.push(format!("rejected after processing: {}", rejection.as_str()));
        }

        SanitizationResult {
            is_valid: rejection.is_none(),
            text,
            original_length,
            final_length,
            transformations,
            warnings,
            rejection,
        }
    }

    fn blocked_match(&self, text: &str) -> Option<&'static str> {
        self.blocked
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(id, _)| *id)
    }

    fn clean(
        &self,
        text: &str,
        transformations: &mut Vec<Transformation>,
        warnings: &mut Vec<String>,
    ) -> String {
        let escaped = html_escape(text);
        if escaped != text {
            transformations.push(Transformation::HtmlEscaped);
            warnings.push("html escaped".to_string());
        }

        let urls = self.url.find_iter(&escaped).count();
        let without_urls = if urls > 0 {
            transformations.push(Transformation::UrlsRemoved);
            warnings.push(format!("{urls} urls removed"));
            self.url.replace_all(&escaped, URL_PLACEHOLDER).into_owned()
        } else {
            escaped
        };

        let mut removed = 0usize;
        let without_controls: String = without_urls
            .chars()
            .filter_map(|c| {
                if !c.is_control() {
                    Some(c)
                } else if c.is_whitespace() {
                    Some(' ')
                } else {
                    removed += 1;
                    None
                }
            })
            .collect();
        if removed > 0 {
            transformations.push(Transformation::ControlCharsRemoved);
            warnings.push(format!("{removed} control characters removed"));
        }

        let collapsed = without_controls.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed != without_controls.trim() {
            transformations.push(Transformation::WhitespaceCollapsed);
            warnings.push("whitespace normalized".to_string());
        }
        collapsed
    }

    fn normalize(&self, text: &str, transformations: &mut Vec<Transformation>) -> String {
        let composed: String = text.nfc().collect();
        if composed != text {
            transformations.push(Transformation::UnicodeNormalized);
        }

        let mut replaced = String::with_capacity(composed.len());
        let mut swapped = false;
        for c in composed.chars() {
            match homoglyph(c) {
                Some(ascii) => {
                    replaced.push_str(ascii);
                    swapped = true;
                }
                None => replaced.push(c),
            }
        }
        if swapped {
            transformations.push(Transformation::HomoglyphsReplaced);
        }

        let trimmed = replaced.trim();
        let mut chars = trimmed.chars();
        let mut out = match chars.next() {
            Some(first) if first.is_lowercase() => {
                transformations.push(Transformation::Capitalized);
                first.to_uppercase().chain(chars).collect::<String>()
            }
            Some(_) => trimmed.to_string(),
            None => return String::new(),
        };

        if !out.ends_with(['.', '!', '?']) && out.chars().count() < self.config.max_length {
            out.push('.');
            transformations.push(Transformation::PunctuationAdded);
        }
        out
    }
}

fn compile(id: &str, pattern: &str) -> KernelResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| KernelError::InvalidPattern {
            id: id.to_string(),
            message: err.to_string(),
        })
}

/// Cuts at `max` chars, backing off to the last space in the final 20% of the
/// budget and then to the last sentence end within the final 50 chars.
fn truncate(text: &str, max: usize) -> Option<String> {
    if text.chars().count() <= max {
        return None;
    }
    let mut cut: String = text.chars().take(max).collect();

    if let Some(space) = cut.rfind(' ') {
        if cut[..space].chars().count() * 5 > max * 4 {
            cut.truncate(space);
        }
    }

    let len = cut.chars().count();
    let sentence_end = cut
        .char_indices()
        .rev()
        .take(50)
        .find(|(_, c)| matches!(c, '.' | '!' | '?'));
    if let Some((idx, ch)) = sentence_end {
        if cut[..idx].chars().count() + 1 < len {
            cut.truncate(idx + ch.len_utf8());
        }
    }
    Some(cut.trim_end().to_string())
}

/// Like [`truncate`], but never leaves half an html entity at the end.
fn fit_processed(text: &str, max: usize) -> Option<String> {
    truncate(text, max).map(|mut cut| {
        if let Some(amp) = cut.rfind('&') {
            if !cut[amp..].contains(';') {
                cut.truncate(amp);
            }
        }
        cut.trim_end().to_string()
    })
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn homoglyph(c: char) -> Option<&'static str> {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{2032}' => Some("'"),
        '\u{201C}' | '\u{201D}' | '\u{201F}' | '\u{2033}' => Some("\""),
        '\u{2013}' | '\u{2014}' | '\u{2212}' => Some("-"),
        '\u{00A0}' | '\u{2007}' | '\u{202F}' => Some(" "),
        '\u{2026}' => Some("..."),
        _ => None,
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_alphanumeric()
        || c.is_whitespace()
        || matches!(
            c,
            '.' | ',' | '?' | '!' | '¿' | '¡' | '-' | '(' | ')' | '/' | ':' | ';' | '\'' | '"'
        )
}

fn alnum_ratio(text: &str) -> f64 {
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    if visible == 0 {
        return 0.0;
    }
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    alnum as f64 / visible as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer(max_length: usize) -> InputSanitizer {
        InputSanitizer::new(SanitizerConfig {
            max_length,
            min_length: 1,
        })
        .unwrap()
    }

    #[test]
    fn greeting_is_capitalized_and_terminated() {
        let result = sanitizer(500).process("hola", None);
        assert!(result.is_valid);
        assert_eq!(result.text, "Hola.");
        assert!(result.transformations.contains(&Transformation::Capitalized));
        assert!(result.transformations.contains(&Transformation::PunctuationAdded));
    }

    #[test]
    fn question_keeps_its_terminal_mark() {
        let result = sanitizer(500).process("¿tienes experiencia en Python?", None);
        assert!(result.is_valid);
        assert_eq!(result.text, "¿tienes experiencia en Python?");
    }

    #[test]
    fn blank_input_is_too_short() {
        let result = sanitizer(500).process("   ", None);
        assert!(!result.is_valid);
        assert_eq!(result.rejection, Some(Rejection::TooShort));
    }

    #[test]
    fn blocked_patterns_reject_without_output() {
        let s = sanitizer(500);
        for raw in [
            "hola <SCRIPT>alert(1)</script>",
            "usa eval(x) por favor",
            "import os",
            "mira __class__",
        ] {
            let result = s.process(raw, None);
            assert!(!result.is_valid, "{raw}");
            assert_eq!(result.rejection, Some(Rejection::BlockedPattern));
            assert!(result.text.is_empty());
        }
    }

    #[test]
    fn blocked_context_rejects_request() {
        let result = sanitizer(500).process("hola", Some("javascript:alert(1)"));
        assert_eq!(result.rejection, Some(Rejection::BlockedContext));
    }

    #[test]
    fn truncation_stays_in_budget_and_keeps_whole_words() {
        let raw = "palabra ".repeat(100);
        let result = sanitizer(100).process(&raw, None);
        assert!(result.is_valid);
        assert!(result.final_length <= 100);
        assert!(result.transformations.contains(&Transformation::Truncated));
        let last = result.text.trim_end_matches('.').rsplit(' ').next().unwrap();
        assert_eq!(last, "palabra");
    }

    #[test]
    fn truncation_prefers_sentence_end() {
        let raw = format!("{}Fin de frase. mas texto que sobra", "a ".repeat(40));
        let cut = truncate(&raw, 100).unwrap();
        assert!(cut.ends_with("Fin de frase."));
    }

    #[test]
    fn escaping_growth_is_cut_back_not_rejected() {
        let raw = "I'm sure it's what's needed ".repeat(30);
        let result = sanitizer(500).process(&raw, None);
        assert!(result.is_valid, "{:?}", result.rejection);
        assert_eq!(result.rejection, None);
        assert!(result.final_length <= 500);
        assert_eq!(result.final_length, result.text.chars().count());
        assert!(result.transformations.contains(&Transformation::Truncated));
        assert!(result.transformations.contains(&Transformation::HtmlEscaped));
        assert_eq!(result.text.matches('&').count(), result.text.matches(';').count());
    }

    #[test]
    fn fit_drops_a_dangling_entity() {
        let text = format!("{}&#x27;s", "a".repeat(97));
        let cut = fit_processed(&text, 100).unwrap();
        assert_eq!(cut, "a".repeat(97));
    }

    #[test]
    fn clean_escapes_html_and_removes_urls() {
        let result = sanitizer(500).process("ver <b>esto</b> en https://example.com/x ahora", None);
        assert!(result.is_valid);
        assert_eq!(
            result.text,
            "Ver &lt;b&gt;esto&lt;/b&gt; en [URL_REMOVIDA] ahora."
        );
        assert!(result.transformations.contains(&Transformation::HtmlEscaped));
        assert!(result.transformations.contains(&Transformation::UrlsRemoved));
    }

    #[test]
    fn control_chars_and_whitespace_are_cleaned() {
        let result = sanitizer(500).process("hola\u{7}\n\n   mundo", None);
        assert_eq!(result.text, "Hola mundo.");
        assert!(result
            .transformations
            .contains(&Transformation::ControlCharsRemoved));
        assert!(result
            .transformations
            .contains(&Transformation::WhitespaceCollapsed));
    }

    #[test]
    fn smart_punctuation_becomes_ascii() {
        let result = sanitizer(500).process("proyecto \u{2013} \u{201C}portfolio\u{201D}\u{2026}", None);
        assert!(result
            .transformations
            .contains(&Transformation::HomoglyphsReplaced));
        assert!(result.text.starts_with("Proyecto - "));
        assert!(result.text.ends_with("..."));
    }

    #[test]
    fn symbol_soup_fails_alnum_ratio() {
        let result = sanitizer(500).process("a ++++ ==== ****", None);
        assert!(!result.is_valid);
        assert_eq!(result.rejection, Some(Rejection::LowAlnumRatio));
        assert!(result.warnings.iter().any(|w| w.contains("suspicious")));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = InputSanitizer::new(SanitizerConfig {
            max_length: 1,
            min_length: 5,
        });
        assert!(matches!(err, Err(KernelError::InvalidConfig(_))));
    }
}
