use std::collections::{BTreeMap, HashMap};

use concierge_contracts::{ChatResponse, Language};
use serde::Serialize;
use tracing::warn;

use crate::emergency::templates as emergency;
use crate::faq::responses as faq;
use crate::safety::{BLOCKED_RESPONSE, ERROR_RESPONSE, UNSAFE_RESPONSE};
use crate::sections::guidance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub key: &'static str,
    pub es: &'static str,
    pub en: &'static str,
    pub category: &'static str,
}

impl Translation {
    fn text(&self, language: Language) -> &'static str {
        match language {
            Language::Es => self.es,
            Language::En => self.en,
        }
    }
}

const fn t(key: &'static str, es: &'static str, en: &'static str, category: &'static str) -> Translation {
    Translation { key, es, en, category }
}

static TRANSLATIONS: &[Translation] = &[
    t("system_error",
      "Lo siento, hubo un error procesando tu consulta. Por favor intenta de nuevo.",
      "Sorry, there was an error processing your request. Please try again.",
      "system"),
    t("rate_limit_exceeded",
      "Has excedido el límite de consultas. Por favor espera un momento antes de intentar de nuevo.",
      "You have exceeded the query limit. Please wait a moment before trying again.",
      "system"),
    t("request_cancelled",
      "La consulta fue cancelada antes de completarse.",
      "The request was cancelled before it completed.",
      "system"),
    t("input_too_long",
      "Tu mensaje es muy largo. Por favor acórtalo a menos de 500 caracteres.",
      "Your message is too long. Please shorten it to less than 500 characters.",
      "validation"),
    t("input_invalid",
      "No pude procesar tu mensaje. Por favor revisa el contenido e intenta de nuevo.",
      "I could not process your message. Please review its content and try again.",
      "validation"),
    t("inappropriate_content",
      "No puedo procesar ese tipo de contenido. Por favor haz una pregunta relacionada con mi perfil profesional.",
      "I cannot process that type of content. Please ask a question related to my professional profile.",
      "safety"),
    t("safety_blocked",
      BLOCKED_RESPONSE,
      "Sorry, I cannot process that type of request. Please ask a question related to my professional profile.",
      "safety"),
    t("safety_unsafe",
      UNSAFE_RESPONSE,
      "There is a problem with the generated response. Please try rephrasing your question about my experience or skills.",
      "safety"),
    t("safety_error",
      ERROR_RESPONSE,
      "An error occurred while generating the response. Please try again with a question about my professional profile.",
      "safety"),
    t("llm_unavailable",
      "Los servicios de IA no están disponibles temporalmente. Por favor intenta más tarde.",
      "AI services are temporarily unavailable. Please try again later.",
      "template"),
    t("generation_error",
      "Hubo un error generando la respuesta. Por favor intenta de nuevo.",
      "There was an error generating the response. Please try again.",
      "template"),
    t("unsafe_output",
      "La respuesta generada no pasó los filtros de seguridad. Por favor reformula tu pregunta.",
      "The generated response did not pass safety filters. Please rephrase your question.",
      "template"),
    t("emergency_mode_active",
      "Actualmente tengo problemas técnicos. Mi capacidad de respuesta está limitada temporalmente.",
      "I'm currently experiencing technical issues. My response capability is temporarily limited.",
      "emergency"),
    t("services_unavailable",
      "Algunos servicios no están disponibles en este momento. Intenta de nuevo más tarde.",
      "Some services are currently unavailable. Please try again later.",
      "emergency"),
    t("emergency_experience",
      emergency::EXPERIENCE,
      "I'm currently having technical problems with my main services. I can help you with basic information about my professional profile. My experience includes full-stack development with React, Python and modern technologies.",
      "emergency"),
    t("emergency_contact",
      emergency::CONTACT,
      "Due to temporary technical problems, my ability to respond is limited. For contact information, you can find me on LinkedIn or send an email through my professional profile.",
      "emergency"),
    t("emergency_technologies",
      emergency::TECHNOLOGIES,
      "My AI services are temporarily offline. I can tell you that I work with technologies such as React, Python, Flask, Node.js, databases and cloud services.",
      "emergency"),
    t("emergency_projects",
      emergency::PROJECTS,
      "There are currently technical problems limiting my detailed answers. I have built several projects including web applications, AI chatbots and data management systems.",
      "emergency"),
    t("emergency_availability",
      emergency::AVAILABILITY,
      "Due to temporary technical problems, I can only give basic answers. Yes, I am available for job opportunities as a full-stack developer.",
      "emergency"),
    t("emergency_general",
      emergency::GENERAL,
      "Sorry, I'm currently having technical problems that affect my ability to give detailed answers. Please try again later or get in touch directly for specific information.",
      "emergency"),
    t("emergency_critical",
      emergency::CRITICAL_FALLBACK,
      "Sorry, I'm experiencing serious technical problems. Please try contacting me directly for information about my professional profile.",
      "emergency"),
    t("experience_response",
      faq::EXPERIENCE,
      "I have experience as a full-stack developer working with modern technologies such as React, Python, Node.js and databases. I have built complete web applications, REST APIs and data management systems.",
      "faq"),
    t("technologies_response",
      faq::TECHNOLOGIES,
      "My tech stack includes: Frontend (React, JavaScript, HTML, CSS), Backend (Python, Flask, Node.js), Databases (PostgreSQL, MongoDB), Cloud (Google Cloud, AWS), AI (Google Gemini, RAG, ChromaDB) and modern development tools.",
      "faq"),
    t("projects_response",
      faq::PROJECTS,
      "I have built several projects including: AI chatbots with RAG, full-stack web applications, data management systems, REST APIs and cloud service integrations. Each project shows a different side of my technical experience.",
      "faq"),
    t("contact_response",
      faq::CONTACT,
      "You can contact me through my email or LinkedIn. I am available to discuss job opportunities, collaborations or technical questions about my projects.",
      "faq"),
    t("availability_response",
      faq::AVAILABILITY,
      "Yes, I am available for new job opportunities. I am looking for full-stack developer positions where I can apply my skills in web development, AI and modern technologies.",
      "faq"),
    t("education_response",
      faq::EDUCATION,
      "My background includes studies in software development and information technology. I also keep my skills current through online courses, certifications and constant practice with new technologies.",
      "faq"),
    t("greeting_response",
      faq::GREETING,
      "Hello! I'm an AI assistant that can help you with questions about my professional profile, experience, projects and technical skills. How can I help you?",
      "faq"),
    t("help_response",
      faq::HELP,
      "I can help you with information about: professional experience, technologies I use, projects built, education and training, contact information, and job availability. Ask whatever you need to know!",
      "faq"),
    t("section_guidance_experience",
      guidance::EXPERIENCE,
      "For questions about work experience, you can ask about: years of experience, companies I've worked for, roles performed, or professional achievements.",
      "guidance"),
    t("section_guidance_technologies",
      guidance::TECHNOLOGIES,
      "For questions about technologies, you can ask about: programming languages, frameworks, development tools, databases, or my tech stack.",
      "guidance"),
    t("section_guidance_projects",
      guidance::PROJECTS,
      "For questions about projects, you can ask about: projects built, technologies used, challenges solved, or results achieved.",
      "guidance"),
    t("section_guidance_education",
      guidance::EDUCATION,
      "For questions about education, you can ask about: academic background, certifications, completed courses, or ongoing studies.",
      "guidance"),
    t("section_guidance_contact",
      guidance::CONTACT,
      "For contact information, you can ask about: email, LinkedIn, professional social networks, or ways to get in touch.",
      "guidance"),
    t("section_guidance_availability",
      guidance::AVAILABILITY,
      "For questions about availability, you can ask about: job availability, the kind of work I'm looking for, preferred arrangement, or location.",
      "guidance"),
    t("section_valid_sections",
      guidance::VALID_SECTIONS,
      "Valid sections are: experience, technologies, projects, education, contact, availability",
      "guidance"),
    t("section_clarify_prefix", guidance::CLARIFY_PREFIX, "Your question could be about", "guidance"),
    t("section_clarify_middle", guidance::CLARIFY_MIDDLE, "but I also detected elements of", "guidance"),
    t("section_clarify_suffix", guidance::CLARIFY_SUFFIX, "Could you be more specific?", "guidance"),
    t("sources_used", "fuentes utilizadas", "sources used", "metadata"),
    t("context_found", "contexto encontrado", "context found", "metadata"),
    t("from_cache", "desde caché", "from cache", "metadata"),
];

const ERROR_PHRASES: &[(&str, &str)] = &[
    ("rate limit", "rate_limit_exceeded"),
    ("too long", "input_too_long"),
    ("inappropriate", "inappropriate_content"),
    ("unsafe input", "inappropriate_content"),
    ("validation", "input_invalid"),
    ("cancel", "request_cancelled"),
    ("system error", "system_error"),
];

const GUIDANCE_TOPICS: &[(&str, &str, &str)] = &[
    ("experiencia", "experience", "section_guidance_experience"),
    ("tecnolog", "technolog", "section_guidance_technologies"),
    ("proyecto", "project", "section_guidance_projects"),
];

const SPANISH_INDICATORS: &[&str] = &[
    "qué", "cuál", "cómo", "dónde", "cuándo", "por qué", "experiencia", "trabajo",
    "habilidades", "proyectos", "tecnologías", "contacto", "disponible", "ñ",
];

const ENGLISH_INDICATORS: &[&str] = &[
    "what", "which", "how", "where", "when", "why", "experience", "work", "skills",
    "projects", "technologies", "contact", "available",
];

#[derive(Debug, Clone, Serialize)]
pub struct LocalizerStats {
    pub total_translations: usize,
    pub supported_languages: Vec<&'static str>,
    pub default_language: &'static str,
    pub by_category: BTreeMap<&'static str, usize>,
}

/// Table-driven localization. Free text outside the table passes through.
pub struct Localizer {
    by_key: HashMap<&'static str, &'static Translation>,
}

impl Default for Localizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Localizer {
    pub fn new() -> Self {
        Self {
            by_key: TRANSLATIONS.iter().map(|t| (t.key, t)).collect(),
        }
    }

    pub fn supported_languages(&self) -> &'static [Language] {
        &Language::ALL
    }

    /// Falls back to the key itself when it has no translation.
    pub fn message(&self, key: &str, language: Language) -> String {
        match self.by_key.get(key) {
            Some(translation) => translation.text(language).to_string(),
            None => {
                warn!(key, "missing translation");
                key.to_string()
            }
        }
    }

    /// Requested language when supported, otherwise the default.
    pub fn resolve_language(&self, requested: Option<&str>) -> Language {
        requested.and_then(Language::parse).unwrap_or_default()
    }

    pub fn detect_language(&self, text: &str) -> Language {
        let lowered = text.to_lowercase();
        let score = |indicators: &[&str]| indicators.iter().filter(|w| lowered.contains(*w)).count();
        if score(SPANISH_INDICATORS) >= score(ENGLISH_INDICATORS) {
            Language::Es
        } else {
            Language::En
        }
    }

    pub fn translate_text(&self, text: &str, target: Language) -> String {
        let source = other(target);
        if let Some(exact) = TRANSLATIONS.iter().find(|t| t.text(source) == text) {
            return exact.text(target).to_string();
        }
        TRANSLATIONS.iter().fold(text.to_string(), |acc, t| {
            let from = t.text(source);
            if acc.contains(from) {
                acc.replace(from, t.text(target))
            } else {
                acc
            }
        })
    }

    pub fn translate_error(&self, error: &str, target: Language) -> String {
        let lowered = error.to_lowercase();
        ERROR_PHRASES
            .iter()
            .find(|(phrase, _)| lowered.contains(phrase))
            .map(|(_, key)| self.message(key, target))
            .unwrap_or_else(|| self.translate_text(error, target))
    }

    pub fn translate_guidance(&self, text: &str, target: Language) -> String {
        let translated = self.translate_text(text, target);
        if translated != text || self.is_in(text, target) || self.detect_language(text) == target {
            return translated;
        }
        let lowered = text.to_lowercase();
        GUIDANCE_TOPICS
            .iter()
            .find(|(es, en, _)| lowered.contains(es) || lowered.contains(en))
            .map(|(_, _, key)| self.message(key, target))
            .unwrap_or(translated)
    }

    fn is_in(&self, text: &str, language: Language) -> bool {
        TRANSLATIONS.iter().any(|t| t.text(language) == text)
    }

    /// Rewrites the user-visible fields of `response` into `target`.
    pub fn translate(&self, mut response: ChatResponse, target: Language) -> ChatResponse {
        response.response = self.translate_text(&response.response, target);
        response.error = response.error.map(|e| self.translate_error(&e, target));
        response.guidance = response.guidance.map(|g| self.translate_guidance(&g, target));
        response.language = target;
        response
    }

    pub fn stats(&self) -> LocalizerStats {
        let mut by_category = BTreeMap::new();
        for translation in TRANSLATIONS {
            *by_category.entry(translation.category).or_default() += 1;
        }
        LocalizerStats {
            total_translations: TRANSLATIONS.len(),
            supported_languages: Language::ALL.iter().map(|l| l.code()).collect(),
            default_language: Language::default().code(),
            by_category,
        }
    }
}

fn other(language: Language) -> Language {
    match language {
        Language::Es => Language::En,
        Language::En => Language::Es,
    }
}
