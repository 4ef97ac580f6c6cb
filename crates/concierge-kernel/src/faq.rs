use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use concierge_contracts::Language;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{KernelError, KernelResult};

/// Confidence a match needs before the pipeline answers with it.
pub const FAQ_PUBLISH_THRESHOLD: f64 = 0.7;

const PATTERN_ACCEPT: f64 = 0.6;
const KEYWORD_ACCEPT: f64 = 0.4;
const SIMILARITY_ACCEPT: f64 = 0.7;

pub mod responses {
    pub const EXPERIENCE: &str = "Tengo experiencia como desarrollador full-stack trabajando con tecnologías modernas como React, Python, Node.js y bases de datos. He desarrollado aplicaciones web completas, APIs REST y sistemas de gestión de datos.";
    pub const TECHNOLOGIES: &str = "Mi stack tecnológico incluye: Frontend (React, JavaScript, HTML, CSS), Backend (Python, Flask, Node.js), Bases de datos (PostgreSQL, MongoDB), Cloud (Google Cloud, AWS), IA (Google Gemini, RAG, ChromaDB) y herramientas de desarrollo modernas.";
    pub const PROJECTS: &str = "He desarrollado varios proyectos incluyendo: chatbots con IA y RAG, aplicaciones web full-stack, sistemas de gestión de datos, APIs REST, y integraciones con servicios de cloud. Cada proyecto demuestra diferentes aspectos de mi experiencia técnica.";
    pub const CONTACT: &str = "Puedes contactarme a través de mi email o LinkedIn. Estoy disponible para discutir oportunidades de trabajo, colaboraciones o preguntas técnicas sobre mis proyectos.";
    pub const AVAILABILITY: &str = "Sí, estoy disponible para nuevas oportunidades laborales. Busco posiciones como desarrollador full-stack donde pueda aplicar mis habilidades en desarrollo web, IA y tecnologías modernas.";
    pub const EDUCATION: &str = "Mi formación incluye estudios en desarrollo de software y tecnologías de la información. Además, mantengo actualizadas mis habilidades a través de cursos online, certificaciones y práctica constante con nuevas tecnologías.";
    pub const GREETING: &str = "¡Hola! Soy un asistente IA que puede ayudarte con preguntas sobre mi perfil profesional, experiencia, proyectos y habilidades técnicas. ¿En qué puedo ayudarte?";
    pub const HELP: &str = "Puedo ayudarte con información sobre: experiencia profesional, tecnologías que manejo, proyectos desarrollados, educación y formación, información de contacto, y disponibilidad laboral. ¡Pregunta lo que necesites saber!";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaqEntry {
    pub id: String,
    pub patterns: Vec<String>,
    pub response: String,
    pub keywords: Vec<String>,
    pub category: String,
    pub priority: u8,
    pub language: Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    PatternMatch,
    KeywordMatch,
    SimilarityMatch,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::PatternMatch => "pattern_match",
            MatchMethod::KeywordMatch => "keyword_match",
            MatchMethod::SimilarityMatch => "similarity_match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaqMatch {
    pub entry_id: String,
    pub response: String,
    pub category: String,
    pub confidence: f64,
    pub method: MatchMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct FaqClassification {
    pub is_faq: bool,
    pub confidence: f64,
    pub hit: Option<FaqMatch>,
}

impl FaqClassification {
    /// The match, if it clears the publish threshold regardless of tier.
    pub fn published(&self) -> Option<&FaqMatch> {
        self.hit
            .as_ref()
            .filter(|hit| hit.confidence > FAQ_PUBLISH_THRESHOLD)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaqStats {
    pub total_entries: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<u8, usize>,
    pub keywords_indexed: usize,
}

struct CompiledEntry {
    entry: FaqEntry,
    patterns: Vec<Regex>,
    similarity_targets: Vec<Vec<char>>,
}

impl CompiledEntry {
    fn compile(entry: FaqEntry) -> KernelResult<Self> {
        let patterns = entry
            .patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| KernelError::InvalidPattern {
                        id: entry.id.clone(),
                        message: err.to_string(),
                    })
            })
            .collect::<KernelResult<Vec<_>>>()?;
        let similarity_targets = entry
            .patterns
            .iter()
            .map(|p| {
                p.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
                    .flat_map(char::to_lowercase)
                    .collect()
            })
            .collect();
        Ok(Self {
            entry,
            patterns,
            similarity_targets,
        })
    }

    fn to_match(&self, confidence: f64, method: MatchMethod) -> FaqMatch {
        FaqMatch {
            entry_id: self.entry.id.clone(),
            response: self.entry.response.clone(),
            category: self.entry.category.clone(),
            confidence,
            method,
        }
    }
}

#[derive(Default)]
struct FaqIndex {
    entries: Vec<CompiledEntry>,
    keyword_index: HashMap<String, Vec<usize>>,
}

impl FaqIndex {
    fn push(&mut self, compiled: CompiledEntry) {
        let position = self.entries.len();
        for keyword in &compiled.entry.keywords {
            self.keyword_index
                .entry(keyword.to_lowercase())
                .or_default()
                .push(position);
        }
        self.entries.push(compiled);
    }
}

type Tier = fn(&FaqIndex, &str) -> Option<FaqMatch>;

const TIERS: [Tier; 3] = [pattern_tier, keyword_tier, similarity_tier];

fn pattern_tier(index: &FaqIndex, message: &str) -> Option<FaqMatch> {
    let length = message.chars().count();
    if length == 0 {
        return None;
    }
    let mut best: Option<FaqMatch> = None;
    for compiled in &index.entries {
        for pattern in &compiled.patterns {
            let Some(found) = pattern.find(message) else {
                continue;
            };
            let span = found.as_str().chars().count();
            let confidence = (span as f64 / length as f64 * 1.2).min(1.0);
            if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                best = Some(compiled.to_match(confidence, MatchMethod::PatternMatch));
            }
        }
    }
    best.filter(|b| b.confidence > PATTERN_ACCEPT)
}

fn keyword_tier(index: &FaqIndex, message: &str) -> Option<FaqMatch> {
    let words: HashSet<&str> = message
        .split_whitespace()
        .map(|w| w.trim_matches(|c| matches!(c, '?' | '¿' | '¡' | '!')))
        .filter(|w| !w.is_empty())
        .collect();

    let mut scores: BTreeMap<usize, usize> = BTreeMap::new();
    for word in words {
        if let Some(positions) = index.keyword_index.get(word) {
            for position in positions {
                *scores.entry(*position).or_default() += 1;
            }
        }
    }

    // Highest count wins; ties go to the entry listed first.
    let (position, matched) = scores
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (pos, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((pos, count)),
        })?;
    let compiled = index.entries.get(position)?;
    let total = compiled.entry.keywords.len().max(1);
    let confidence = matched as f64 / total as f64 * 0.8;
    (confidence > KEYWORD_ACCEPT).then(|| compiled.to_match(confidence, MatchMethod::KeywordMatch))
}

fn similarity_tier(index: &FaqIndex, message: &str) -> Option<FaqMatch> {
    let message: Vec<char> = message.chars().collect();
    let mut best: Option<(f64, FaqMatch)> = None;
    for compiled in &index.entries {
        for target in &compiled.similarity_targets {
            let similarity = lcs_ratio(&message, target);
            if best.as_ref().map_or(true, |(s, _)| similarity > *s) {
                best = Some((
                    similarity,
                    compiled.to_match(similarity * 0.9, MatchMethod::SimilarityMatch),
                ));
            }
        }
    }
    best.filter(|(similarity, _)| *similarity > SIMILARITY_ACCEPT)
        .map(|(_, hit)| hit)
}

/// `2 * LCS / (len_a + len_b)` over chars.
fn lcs_ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    2.0 * prev[b.len()] as f64 / total as f64
}

/// Three-tier FAQ matcher over an append-only catalog.
pub struct FaqClassifier {
    index: RwLock<FaqIndex>,
    strip: Regex,
}

impl FaqClassifier {
    pub fn new() -> KernelResult<Self> {
        Self::with_entries(default_entries())
    }

    pub fn with_entries(entries: Vec<FaqEntry>) -> KernelResult<Self> {
        let strip = Regex::new(r"[^\w\s?¿¡!]").map_err(|err| KernelError::InvalidPattern {
            id: "faq_normalize".to_string(),
            message: err.to_string(),
        })?;
        let classifier = Self {
            index: RwLock::new(FaqIndex::default()),
            strip,
        };
        for entry in entries {
            classifier.add_entry(entry)?;
        }
        info!(entries = classifier.len(), "faq classifier ready");
        Ok(classifier)
    }

    pub fn normalize(&self, message: &str) -> String {
        let lowered = message.to_lowercase();
        let stripped = self.strip.replace_all(&lowered, " ");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn classify(&self, message: &str) -> FaqClassification {
        let normalized = self.normalize(message);
        let index = match self.index.read() {
            Ok(index) => index,
            Err(_) => {
                warn!("faq catalog poisoned; treating message as non-faq");
                return FaqClassification::default();
            }
        };
        // A later tier only replaces an earlier hit when it clears the publish bar.
        let mut found: Option<FaqMatch> = None;
        for tier in TIERS {
            let Some(hit) = tier(&index, &normalized) else {
                continue;
            };
            if hit.confidence > FAQ_PUBLISH_THRESHOLD {
                found = Some(hit);
                break;
            }
            found.get_or_insert(hit);
        }
        match found {
            Some(hit) => {
                debug!(
                    entry = %hit.entry_id,
                    method = hit.method.as_str(),
                    confidence = hit.confidence,
                    "faq match"
                );
                FaqClassification {
                    is_faq: true,
                    confidence: hit.confidence,
                    hit: Some(hit),
                }
            }
            None => FaqClassification::default(),
        }
    }

    pub fn add_entry(&self, entry: FaqEntry) -> KernelResult<()> {
        let compiled = CompiledEntry::compile(entry)?;
        let mut index = self
            .index
            .write()
            .map_err(|_| KernelError::CatalogPoisoned("faq catalog"))?;
        if index.entries.iter().any(|c| c.entry.id == compiled.entry.id) {
            return Err(KernelError::DuplicateEntry(compiled.entry.id));
        }
        debug!(entry = %compiled.entry.id, "faq entry added");
        index.push(compiled);
        Ok(())
    }

    pub fn entries_by_category(&self, category: &str) -> Vec<FaqEntry> {
        self.index
            .read()
            .map(|index| {
                index
                    .entries
                    .iter()
                    .filter(|c| c.entry.category == category)
                    .map(|c| c.entry.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FaqStats {
        let mut stats = FaqStats {
            total_entries: 0,
            by_category: BTreeMap::new(),
            by_priority: BTreeMap::new(),
            keywords_indexed: 0,
        };
        if let Ok(index) = self.index.read() {
            stats.total_entries = index.entries.len();
            stats.keywords_indexed = index.keyword_index.len();
            for compiled in &index.entries {
                *stats
                    .by_category
                    .entry(compiled.entry.category.clone())
                    .or_default() += 1;
                *stats.by_priority.entry(compiled.entry.priority).or_default() += 1;
            }
        }
        stats
    }
}

fn entry(
    id: &str,
    category: &str,
    priority: u8,
    patterns: &[&str],
    keywords: &[&str],
    response: &str,
) -> FaqEntry {
    FaqEntry {
        id: id.to_string(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        response: response.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        category: category.to_string(),
        priority,
        language: Language::Es,
    }
}

pub fn default_entries() -> Vec<FaqEntry> {
    vec![
        entry(
            "exp_general",
            "experience",
            1,
            &[
                r"qu[eé] experiencia tienes?",
                r"cu[aá]ntos a[ñn]os de experiencia",
                r"cu[eé]ntame (de|sobre) tu experiencia",
                r"experiencia laboral",
                r"trabajo previo",
            ],
            &["experiencia", "años", "trabajo", "laboral", "profesional"],
            responses::EXPERIENCE,
        ),
        entry(
            "tech_stack",
            "technologies",
            1,
            &[
                r"qu[eé] tecnolog[ií]as (usas|manejas|conoces)",
                r"cu[aá]l es tu stack tecnol[oó]gico",
                r"qu[eé] lenguajes de programaci[oó]n",
                r"herramientas que (usas|dominas)",
                r"frameworks que conoces",
            ],
            &["tecnologías", "stack", "lenguajes", "frameworks", "herramientas", "programación"],
            responses::TECHNOLOGIES,
        ),
        entry(
            "projects_general",
            "projects",
            1,
            &[
                r"qu[eé] proyectos has (desarrollado|hecho|creado)",
                r"mu[eé]strame tu trabajo",
                r"portfolio de proyectos",
                r"ejemplos de tu trabajo",
                r"qu[eé] has construido",
            ],
            &["proyectos", "portfolio", "trabajo", "desarrollado", "construido", "ejemplos"],
            responses::PROJECTS,
        ),
        entry(
            "contact_info",
            "contact",
            1,
            &[
                r"c[oó]mo puedo contactarte",
                r"cu[aá]l es tu (email|correo)",
                r"informaci[oó]n de contacto",
                r"d[oó]nde te encuentro",
                r"c[oó]mo te ubico",
            ],
            &["contacto", "email", "correo", "linkedin", "ubicar", "encontrar"],
            responses::CONTACT,
        ),
        entry(
            "availability",
            "availability",
            1,
            &[
                r"est[aá]s disponible para trabajar",
                r"buscas trabajo",
                r"est[aá]s buscando empleo",
                r"disponibilidad laboral",
                r"puedes trabajar en",
            ],
            &["disponible", "trabajo", "empleo", "oportunidades", "laborales", "busco"],
            responses::AVAILABILITY,
        ),
        entry(
            "education",
            "education",
            2,
            &[
                r"qu[eé] estudiaste",
                r"cu[aá]l es tu formaci[oó]n",
                r"tienes t[ií]tulo",
                r"educaci[oó]n acad[eé]mica",
                r"certificaciones",
            ],
            &["educación", "estudios", "formación", "título", "certificaciones", "académica"],
            responses::EDUCATION,
        ),
        entry(
            "greeting",
            "greeting",
            3,
            &[
                r"^(hola|hello|hi|hey)$",
                r"qu[eé] tal",
                r"c[oó]mo est[aá]s",
                r"buenos d[ií]as",
                r"buenas tardes",
            ],
            &["hola", "saludo", "hey", "hi", "hello"],
            responses::GREETING,
        ),
        entry(
            "help",
            "help",
            3,
            &[
                r"qu[eé] puedes hacer",
                r"c[oó]mo puedes ayudarme",
                r"qu[eé] preguntas puedo hacer",
                r"ayuda",
                r"help",
            ],
            &["ayuda", "help", "puedes", "preguntas", "información"],
            responses::HELP,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FaqClassifier {
        FaqClassifier::new().unwrap()
    }

    #[test]
    fn greeting_hits_pattern_tier() {
        let result = classifier().classify("Hola.");
        let hit = result.published().expect("greeting published");
        assert_eq!(hit.entry_id, "greeting");
        assert_eq!(hit.method, MatchMethod::PatternMatch);
        assert_eq!(hit.response, responses::GREETING);
        assert!((hit.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pattern_tier_wins_over_keyword_match_for_other_entry() {
        let classifier = classifier();
        let message = "cuál es tu stack tecnológico experiencia años trabajo";
        let normalized = classifier.normalize(message);
        {
            let index = classifier.index.read().unwrap();
            let keyword = keyword_tier(&index, &normalized).expect("keyword candidate");
            assert_eq!(keyword.entry_id, "exp_general");
        }

        let result = classifier.classify(message);
        let hit = result.hit.expect("pattern match");
        assert_eq!(hit.method, MatchMethod::PatternMatch);
        assert_eq!(hit.entry_id, "tech_stack");
    }

    #[test]
    fn keyword_tier_needs_publish_threshold() {
        let classifier = classifier();
        let partial = classifier.classify("experiencia años trabajo laboral");
        assert!(partial.is_faq);
        assert_eq!(partial.hit.as_ref().map(|h| h.method), Some(MatchMethod::KeywordMatch));
        assert!(partial.published().is_none());

        let full = classifier.classify("experiencia años trabajo laboral profesional");
        let hit = full.published().expect("all keywords present");
        assert_eq!(hit.entry_id, "exp_general");
        assert!((hit.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weak_keyword_hit_gives_way_to_strong_similarity() {
        let classifier = FaqClassifier::with_entries(vec![
            entry(
                "greek",
                "misc",
                2,
                &["omega"],
                &["alpha", "beta", "gamma", "delta", "epsilon", "zeta"],
                "letters",
            ),
            entry("near", "misc", 2, &["alpha beta gamma delts"], &[], "close enough"),
        ])
        .unwrap();

        let normalized = classifier.normalize("alpha beta gamma delta");
        {
            let index = classifier.index.read().unwrap();
            let keyword = keyword_tier(&index, &normalized).expect("keyword candidate");
            assert_eq!(keyword.entry_id, "greek");
            assert!((keyword.confidence - 4.0 / 6.0 * 0.8).abs() < 1e-9);
        }

        let result = classifier.classify("alpha beta gamma delta");
        let hit = result.published().expect("similarity hit published");
        assert_eq!(hit.entry_id, "near");
        assert_eq!(hit.method, MatchMethod::SimilarityMatch);
        assert!((hit.confidence - 42.0 / 44.0 * 0.9).abs() < 1e-9);
    }

    #[test]
    fn similarity_tier_tolerates_typos() {
        let hit = classifier()
            .classify("cual es tu stak tecnologico")
            .hit
            .expect("similar to stack pattern");
        assert_eq!(hit.method, MatchMethod::SimilarityMatch);
        assert_eq!(hit.entry_id, "tech_stack");
    }

    #[test]
    fn open_question_is_not_faq() {
        let result = classifier().classify("¿tienes experiencia en Python?");
        assert!(!result.is_faq);
        assert!(result.published().is_none());
    }

    #[test]
    fn catalog_is_append_only() {
        let classifier = classifier();
        let err = classifier.add_entry(entry("greeting", "greeting", 1, &["hey"], &[], "dup"));
        assert!(matches!(err, Err(KernelError::DuplicateEntry(id)) if id == "greeting"));

        classifier
            .add_entry(entry(
                "rates",
                "availability",
                2,
                &[r"cu[aá]nto cobras"],
                &["tarifa", "cobras"],
                "Depende del proyecto.",
            ))
            .unwrap();
        assert_eq!(classifier.len(), 9);
        assert_eq!(classifier.entries_by_category("availability").len(), 2);
        let hit = classifier.classify("cuánto cobras").hit.unwrap();
        assert_eq!(hit.entry_id, "rates");
        assert_eq!(classifier.stats().by_priority.get(&3), Some(&2));
    }

    #[test]
    fn lcs_ratio_bounds() {
        let a: Vec<char> = "abc".chars().collect();
        assert!((lcs_ratio(&a, &a) - 1.0).abs() < f64::EPSILON);
        assert_eq!(lcs_ratio(&a, &[]), 0.0);
        assert_eq!(lcs_ratio(&[], &[]), 0.0);
    }
}
