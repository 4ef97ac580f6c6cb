use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::words;

const CONFLICT_THRESHOLD: f64 = 0.3;

pub mod guidance {
    pub const EXPERIENCE: &str = "Para preguntas sobre experiencia laboral, puedes preguntar sobre: años de experiencia, empresas donde he trabajado, roles desempeñados, o logros profesionales.";
    pub const TECHNOLOGIES: &str = "Para preguntas sobre tecnologías, puedes preguntar sobre: lenguajes de programación, frameworks, herramientas de desarrollo, bases de datos, o mi stack tecnológico.";
    pub const PROJECTS: &str = "Para preguntas sobre proyectos, puedes preguntar sobre: proyectos desarrollados, tecnologías utilizadas, desafíos resueltos, o resultados obtenidos.";
    pub const EDUCATION: &str = "Para preguntas sobre educación, puedes preguntar sobre: formación académica, certificaciones, cursos completados, o estudios en progreso.";
    pub const CONTACT: &str = "Para información de contacto, puedes preguntar sobre: email, LinkedIn, redes sociales profesionales, o formas de comunicación.";
    pub const AVAILABILITY: &str = "Para preguntas sobre disponibilidad, puedes preguntar sobre: disponibilidad laboral, tipo de trabajo que busco, modalidad preferida, o ubicación.";
    pub const VALID_SECTIONS: &str = "Las secciones válidas son: experiencia, tecnologias, proyectos, educacion, contacto, disponibilidad";
    pub const CLARIFY_PREFIX: &str = "Tu pregunta podría ser sobre";
    pub const CLARIFY_MIDDLE: &str = "pero también detecté elementos de";
    pub const CLARIFY_SUFFIX: &str = "¿Podrías ser más específico?";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Experience,
    Technologies,
    Projects,
    Education,
    Contact,
    Availability,
    General,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Experience => "experience",
            Section::Technologies => "technologies",
            Section::Projects => "projects",
            Section::Education => "education",
            Section::Contact => "contact",
            Section::Availability => "availability",
            Section::General => "general",
        }
    }

    /// Spanish label used in user-facing guidance.
    pub fn label(self) -> &'static str {
        match self {
            Section::Experience => "experiencia",
            Section::Technologies => "tecnologias",
            Section::Projects => "proyectos",
            Section::Education => "educacion",
            Section::Contact => "contacto",
            Section::Availability => "disponibilidad",
            Section::General => "general",
        }
    }

    /// Accepts the English id or the Spanish label, with or without accents.
    pub fn parse(value: &str) -> Option<Section> {
        match value.trim().to_lowercase().as_str() {
            "experience" | "experiencia" => Some(Section::Experience),
            "technologies" | "tecnologias" | "tecnologías" => Some(Section::Technologies),
            "projects" | "proyectos" => Some(Section::Projects),
            "education" | "educacion" | "educación" => Some(Section::Education),
            "contact" | "contacto" => Some(Section::Contact),
            "availability" | "disponibilidad" => Some(Section::Availability),
            "general" => Some(Section::General),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    Proceed,
    Clarify,
    Guide,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionIssue {
    MissingRequiredKeywords,
    ForbiddenKeywordsPresent,
    SectionMismatch,
}

impl SectionIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionIssue::MissingRequiredKeywords => "missing_required_keywords",
            SectionIssue::ForbiddenKeywordsPresent => "forbidden_keywords_present",
            SectionIssue::SectionMismatch => "section_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionValidation {
    pub is_valid: bool,
    pub detected_section: Section,
    pub confidence: f64,
    pub enforcement_action: EnforcementAction,
    pub guidance: Option<String>,
    pub question_templates: Vec<String>,
    pub conflicting_sections: Vec<Section>,
    pub issues: Vec<SectionIssue>,
}

impl SectionValidation {
    fn proceed(section: Section, confidence: f64) -> Self {
        Self {
            is_valid: true,
            detected_section: section,
            confidence,
            enforcement_action: EnforcementAction::Proceed,
            guidance: None,
            question_templates: Vec::new(),
            conflicting_sections: Vec::new(),
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionGuidance {
    pub section: Section,
    pub guidance: String,
    pub question_templates: Vec<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub section: Section,
    pub guidance: String,
    pub question_templates: Vec<String>,
    pub keywords_count: usize,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionStats {
    pub total_sections: usize,
    pub total_keywords: usize,
    pub keywords_per_section: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct SectionRule {
    section: Section,
    required: Vec<String>,
    forbidden: Vec<String>,
    question_templates: Vec<String>,
    guidance: &'static str,
    priority: u8,
}

pub struct SectionValidator {
    rules: Vec<SectionRule>,
    keyword_index: HashMap<String, Vec<usize>>,
}

impl Default for SectionValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionValidator {
    pub fn new() -> Self {
        let rules = default_rules();
        let mut keyword_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, rule) in rules.iter().enumerate() {
            for keyword in &rule.required {
                keyword_index.entry(keyword.clone()).or_default().push(position);
            }
        }
        info!(sections = rules.len(), "section validator ready");
        Self {
            rules,
            keyword_index,
        }
    }

    /// Sections ranked by normalized keyword score, best first.
    pub fn detect(&self, text: &str) -> Vec<(Section, f64)> {
        let mut counts = vec![0usize; self.rules.len()];
        for word in words(text) {
            if let Some(positions) = self.keyword_index.get(&word) {
                for position in positions {
                    counts[*position] += 1;
                }
            }
        }
        let max = counts.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return vec![(Section::General, 1.0)];
        }
        let mut ranked: Vec<(Section, f64)> = self
            .rules
            .iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|(rule, count)| (rule.section, count as f64 / max as f64))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn validate(&self, text: &str, intended: Option<&str>) -> SectionValidation {
        let lowered = text.to_lowercase();
        let detected = self.detect(&lowered);
        let outcome = match intended.map(str::trim).filter(|s| !s.is_empty()) {
            Some(intended) => self.validate_intended(&lowered, intended, &detected),
            None => validate_open(&detected),
        };
        debug!(
            detected = outcome.detected_section.as_str(),
            action = ?outcome.enforcement_action,
            "section validated"
        );
        outcome
    }

    fn validate_intended(
        &self,
        lowered: &str,
        intended: &str,
        detected: &[(Section, f64)],
    ) -> SectionValidation {
        let rule = Section::parse(intended)
            .and_then(|section| self.rules.iter().find(|rule| rule.section == section));
        let Some(rule) = rule else {
            return SectionValidation {
                is_valid: false,
                detected_section: Section::General,
                confidence: 0.0,
                enforcement_action: EnforcementAction::Redirect,
                guidance: Some(guidance::VALID_SECTIONS.to_string()),
                question_templates: Vec::new(),
                conflicting_sections: Vec::new(),
                issues: Vec::new(),
            };
        };

        let (top, confidence) = detected.first().copied().unwrap_or((Section::General, 0.5));
        let mut issues = Vec::new();
        if !rule.required.iter().any(|k| lowered.contains(k.as_str())) {
            issues.push(SectionIssue::MissingRequiredKeywords);
        }
        if rule.forbidden.iter().any(|k| lowered.contains(k.as_str())) {
            issues.push(SectionIssue::ForbiddenKeywordsPresent);
        }
        if top != rule.section {
            issues.push(SectionIssue::SectionMismatch);
        }

        if issues.is_empty() {
            return SectionValidation::proceed(rule.section, confidence);
        }
        SectionValidation {
            is_valid: false,
            detected_section: top,
            confidence,
            enforcement_action: EnforcementAction::Guide,
            guidance: Some(rule.guidance.to_string()),
            question_templates: rule.question_templates.clone(),
            conflicting_sections: Vec::new(),
            issues,
        }
    }

    pub fn guidance_for(&self, section: &str) -> Option<SectionGuidance> {
        let section = Section::parse(section)?;
        self.rules
            .iter()
            .find(|rule| rule.section == section)
            .map(|rule| SectionGuidance {
                section,
                guidance: rule.guidance.to_string(),
                question_templates: rule.question_templates.clone(),
                keywords: rule.required.clone(),
            })
    }

    pub fn sections(&self) -> Vec<SectionSummary> {
        let mut summaries: Vec<SectionSummary> = self
            .rules
            .iter()
            .map(|rule| SectionSummary {
                section: rule.section,
                guidance: rule.guidance.to_string(),
                question_templates: rule.question_templates.iter().take(2).cloned().collect(),
                keywords_count: rule.required.len(),
                priority: rule.priority,
            })
            .collect();
        summaries.sort_by_key(|s| s.priority);
        summaries
    }

    pub fn stats(&self) -> SectionStats {
        SectionStats {
            total_sections: self.rules.len(),
            total_keywords: self.keyword_index.len(),
            keywords_per_section: self
                .rules
                .iter()
                .map(|rule| (rule.section.as_str().to_string(), rule.required.len()))
                .collect(),
        }
    }
}

fn validate_open(detected: &[(Section, f64)]) -> SectionValidation {
    let Some(&(primary, confidence)) = detected.first() else {
        return SectionValidation::proceed(Section::General, 1.0);
    };
    let conflicting: Vec<Section> = detected
        .iter()
        .skip(1)
        .filter(|(_, score)| *score > CONFLICT_THRESHOLD)
        .map(|(section, _)| *section)
        .collect();
    if conflicting.is_empty() {
        return SectionValidation::proceed(primary, confidence);
    }

    let others = conflicting
        .iter()
        .map(|s| s.label())
        .collect::<Vec<_>>()
        .join(", ");
    SectionValidation {
        is_valid: false,
        detected_section: primary,
        confidence,
        enforcement_action: EnforcementAction::Clarify,
        guidance: Some(format!(
            "{} {}, {} {}. {}",
            guidance::CLARIFY_PREFIX,
            primary.label(),
            guidance::CLARIFY_MIDDLE,
            others,
            guidance::CLARIFY_SUFFIX
        )),
        question_templates: Vec::new(),
        conflicting_sections: conflicting,
        issues: Vec::new(),
    }
}

fn rule(
    section: Section,
    priority: u8,
    required: &[&str],
    forbidden: &[&str],
    question_templates: &[&str],
    guidance: &'static str,
) -> SectionRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    SectionRule {
        section,
        required: owned(required),
        forbidden: owned(forbidden),
        question_templates: owned(question_templates),
        guidance,
        priority,
    }
}

fn default_rules() -> Vec<SectionRule> {
    vec![
        rule(
            Section::Experience,
            1,
            &["experiencia", "trabajo", "laboral", "años", "profesional", "carrera"],
            &["contacto", "email", "telefono", "precio", "costo"],
            &[
                "¿Qué experiencia profesional tienes?",
                "¿Cuántos años de experiencia tienes?",
                "¿En qué empresas has trabajado?",
                "¿Cuál es tu trayectoria laboral?",
            ],
            guidance::EXPERIENCE,
        ),
        rule(
            Section::Technologies,
            1,
            &["tecnologías", "lenguajes", "frameworks", "herramientas", "stack", "programación"],
            &["salario", "contacto", "personal"],
            &[
                "¿Qué tecnologías manejas?",
                "¿Cuál es tu stack tecnológico?",
                "¿Qué lenguajes de programación conoces?",
                "¿Qué frameworks usas?",
            ],
            guidance::TECHNOLOGIES,
        ),
        rule(
            Section::Projects,
            1,
            &["proyectos", "portfolio", "desarrollado", "construido", "creado", "trabajo"],
            &["personal", "familia", "privado"],
            &[
                "¿Qué proyectos has desarrollado?",
                "¿Puedes mostrarme tu portfolio?",
                "¿Qué has construido recientemente?",
                "¿Cuáles son tus mejores proyectos?",
            ],
            guidance::PROJECTS,
        ),
        rule(
            Section::Education,
            2,
            &["educación", "estudios", "formación", "título", "certificaciones", "cursos"],
            &["trabajo", "salario", "empresa"],
            &[
                "¿Qué estudiaste?",
                "¿Cuál es tu formación académica?",
                "¿Tienes certificaciones?",
                "¿Dónde estudiaste?",
            ],
            guidance::EDUCATION,
        ),
        rule(
            Section::Contact,
            1,
            &["contacto", "email", "linkedin", "telefono", "ubicación", "contactar"],
            &["tecnologías", "experiencia", "proyectos"],
            &[
                "¿Cómo puedo contactarte?",
                "¿Cuál es tu email?",
                "¿Tienes LinkedIn?",
                "¿Dónde te ubico?",
            ],
            guidance::CONTACT,
        ),
        rule(
            Section::Availability,
            1,
            &["disponible", "trabajo", "empleo", "contratar", "oportunidades", "busco"],
            &["pasado", "anterior", "estudios"],
            &[
                "¿Estás disponible para trabajar?",
                "¿Buscas empleo?",
                "¿Te puedo contratar?",
                "¿Estás buscando oportunidades?",
            ],
            guidance::AVAILABILITY,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_section_proceeds() {
        let v = SectionValidator::new().validate("¿tienes experiencia en Python?", None);
        assert!(v.is_valid);
        assert_eq!(v.enforcement_action, EnforcementAction::Proceed);
        assert_eq!(v.detected_section, Section::Experience);
    }

    #[test]
    fn no_keywords_is_general() {
        let v = SectionValidator::new().validate("Hola.", None);
        assert!(v.is_valid);
        assert_eq!(v.detected_section, Section::General);
    }

    #[test]
    fn competing_sections_ask_for_clarification() {
        let v = SectionValidator::new().validate("Busco trabajo", None);
        assert!(!v.is_valid);
        assert_eq!(v.enforcement_action, EnforcementAction::Clarify);
        assert_eq!(v.detected_section, Section::Availability);
        assert_eq!(
            v.conflicting_sections,
            vec![Section::Experience, Section::Projects]
        );
        let guidance = v.guidance.unwrap();
        assert!(guidance.starts_with("Tu pregunta podría ser sobre disponibilidad"));
        assert!(guidance.contains("experiencia, proyectos"));
    }

    #[test]
    fn intended_section_accepts_matching_question() {
        let v = SectionValidator::new()
            .validate("¿Qué tecnologías y frameworks usas?", Some("technologies"));
        assert!(v.is_valid);
        assert_eq!(v.detected_section, Section::Technologies);
        assert!((v.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn intended_section_guides_with_every_failed_condition() {
        let v = SectionValidator::new().validate("¿Qué estudiaste?", Some("experiencia"));
        assert_eq!(v.enforcement_action, EnforcementAction::Guide);
        assert_eq!(v.guidance.as_deref(), Some(guidance::EXPERIENCE));
        assert_eq!(v.question_templates.len(), 4);
        assert_eq!(
            v.issues,
            vec![
                SectionIssue::MissingRequiredKeywords,
                SectionIssue::SectionMismatch
            ]
        );
    }

    #[test]
    fn forbidden_keyword_is_flagged() {
        let v = SectionValidator::new().validate("experiencia y email", Some("experience"));
        assert_eq!(v.enforcement_action, EnforcementAction::Guide);
        assert_eq!(v.issues, vec![SectionIssue::ForbiddenKeywordsPresent]);
        assert_eq!(v.detected_section, Section::Experience);
    }

    #[test]
    fn unknown_section_redirects() {
        let validator = SectionValidator::new();
        let v = validator.validate("¿Cuál es tu salario?", Some("salary"));
        assert_eq!(v.enforcement_action, EnforcementAction::Redirect);
        assert_eq!(v.guidance.as_deref(), Some(guidance::VALID_SECTIONS));

        let general = validator.validate("hola", Some("general"));
        assert_eq!(general.enforcement_action, EnforcementAction::Redirect);
    }

    #[test]
    fn catalog_accessors() {
        let validator = SectionValidator::new();
        let education = validator.guidance_for("educación").unwrap();
        assert_eq!(education.section, Section::Education);
        assert!(validator.guidance_for("salary").is_none());

        let sections = validator.sections();
        assert_eq!(sections.len(), 6);
        assert_eq!(sections.last().map(|s| s.section), Some(Section::Education));
        assert!(sections.iter().all(|s| s.question_templates.len() == 2));
        assert_eq!(validator.stats().total_sections, 6);
    }
}
