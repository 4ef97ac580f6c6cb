use std::fmt::Display;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use concierge_contracts::ServicesHealth;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::faq::FaqClassifier;
use crate::{KernelError, KernelResult};

/// Unavailable critical dependencies needed to enter emergency mode.
pub const ACTIVATION_THRESHOLD: usize = 2;

pub mod templates {
    pub const EXPERIENCE: &str = "Actualmente tengo problemas técnicos con mis servicios principales. Puedo ayudarte con información básica sobre mi perfil profesional. Mi experiencia incluye desarrollo full-stack con React, Python y tecnologías modernas.";
    pub const CONTACT: &str = "Debido a problemas técnicos temporales, mi capacidad de respuesta está limitada. Para información de contacto, puedes buscarme en LinkedIn o enviar un email a través de mi perfil profesional.";
    pub const TECHNOLOGIES: &str = "Mis servicios de IA están temporalmente fuera de línea. Te puedo decir que trabajo con tecnologías como React, Python, Flask, Node.js, bases de datos y servicios de cloud.";
    pub const PROJECTS: &str = "Actualmente hay problemas técnicos que limitan mis respuestas detalladas. He desarrollado varios proyectos incluyendo aplicaciones web, chatbots con IA y sistemas de gestión de datos.";
    pub const AVAILABILITY: &str = "Por problemas técnicos temporales, solo puedo dar respuestas básicas. Sí estoy disponible para oportunidades laborales como desarrollador full-stack.";
    pub const GENERAL: &str = "Lo siento, actualmente tengo problemas técnicos que afectan mi capacidad de dar respuestas detalladas. Por favor intenta de nuevo más tarde o contacta directamente para información específica.";
    pub const CRITICAL_FALLBACK: &str = "Disculpa, estoy experimentando problemas técnicos serios. Por favor intenta contactar directamente para obtener información sobre mi perfil profesional.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Activated,
    Deactivated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyReplySource {
    Faq,
    Template,
    CriticalFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyReply {
    pub response: String,
    pub source: EmergencyReplySource,
    pub confidence: f64,
    pub category: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyStatus {
    pub active: bool,
    pub manual: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub templates: usize,
}

#[derive(Debug, Default)]
struct EmergencyState {
    active: bool,
    manual: bool,
    reason: Option<String>,
    activated_at: Option<DateTime<Utc>>,
}

struct CategoryTemplate {
    category: &'static str,
    keywords: &'static [&'static str],
    response: &'static str,
    confidence: f64,
}

const CATEGORY_TEMPLATES: &[CategoryTemplate] = &[
    CategoryTemplate {
        category: "experience",
        keywords: &["experiencia", "trabajo", "laboral", "años", "profesional"],
        response: templates::EXPERIENCE,
        confidence: 0.8,
    },
    CategoryTemplate {
        category: "contact",
        keywords: &["contacto", "email", "linkedin", "telefono", "ubicar"],
        response: templates::CONTACT,
        confidence: 0.8,
    },
    CategoryTemplate {
        category: "technologies",
        keywords: &["tecnologías", "lenguajes", "frameworks", "stack", "programación"],
        response: templates::TECHNOLOGIES,
        confidence: 0.8,
    },
    CategoryTemplate {
        category: "projects",
        keywords: &["proyectos", "portfolio", "desarrollado", "construido"],
        response: templates::PROJECTS,
        confidence: 0.8,
    },
    CategoryTemplate {
        category: "availability",
        keywords: &["disponible", "trabajo", "empleo", "contratar", "busco"],
        response: templates::AVAILABILITY,
        confidence: 0.8,
    },
];

const GENERAL_TEMPLATE: CategoryTemplate = CategoryTemplate {
    category: "general",
    keywords: &[],
    response: templates::GENERAL,
    confidence: 0.6,
};

/// Normal/emergency switch driven by dependency health snapshots.
#[derive(Default)]
pub struct EmergencyController {
    state: RwLock<EmergencyState>,
}

impl EmergencyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state
            .read()
            .map(|s| s.active)
            .unwrap_or_else(|poisoned| poisoned.into_inner().active)
    }

    /// Enters emergency at two or more unavailable dependencies and leaves below that.
    pub fn evaluate(&self, health: &ServicesHealth) -> Transition {
        match self.try_evaluate(health) {
            Ok(transition) => transition,
            Err(err) => self.enter(format!("health evaluation failed: {err}"), false),
        }
    }

    /// Any failure to obtain a health snapshot degrades to emergency.
    pub fn evaluate_result<E: Display>(&self, health: Result<ServicesHealth, E>) -> Transition {
        match health {
            Ok(health) => self.evaluate(&health),
            Err(err) => self.enter(format!("health check failed: {err}"), false),
        }
    }

    fn try_evaluate(&self, health: &ServicesHealth) -> KernelResult<Transition> {
        let down = health.unavailable();
        let should_be_active = down.len() >= ACTIVATION_THRESHOLD;
        let mut state = self
            .state
            .write()
            .map_err(|_| KernelError::CatalogPoisoned("emergency state"))?;
        let transition = match (state.active, should_be_active) {
            (false, true) => {
                let reason = format!("critical services unavailable: {}", down.join(", "));
                warn!(reason = %reason, "emergency mode activated");
                *state = EmergencyState {
                    active: true,
                    manual: false,
                    reason: Some(reason),
                    activated_at: Some(Utc::now()),
                };
                Transition::Activated
            }
            (true, false) if !state.manual => {
                info!("emergency mode deactivated");
                *state = EmergencyState::default();
                Transition::Deactivated
            }
            _ => Transition::Unchanged,
        };
        Ok(transition)
    }

    /// Operator activation; health snapshots do not clear it, only `deactivate` does.
    pub fn activate(&self, reason: impl Into<String>) -> Transition {
        self.enter(reason.into(), true)
    }

    fn enter(&self, reason: String, manual: bool) -> Transition {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.active {
            state.manual |= manual;
            return Transition::Unchanged;
        }
        warn!(reason = %reason, manual, "emergency mode activated");
        *state = EmergencyState {
            active: true,
            manual,
            reason: Some(reason),
            activated_at: Some(Utc::now()),
        };
        Transition::Activated
    }

    pub fn deactivate(&self) -> Transition {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.active {
            return Transition::Unchanged;
        }
        info!("emergency mode deactivated");
        *state = EmergencyState::default();
        Transition::Deactivated
    }

    pub fn status(&self) -> EmergencyStatus {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        EmergencyStatus {
            active: state.active,
            manual: state.manual,
            reason: state.reason.clone(),
            activated_at: state.activated_at,
            templates: CATEGORY_TEMPLATES.len() + 1,
        }
    }

    /// FAQ first, then a category template, then the general template.
    pub fn handle(&self, message: &str, faq: &FaqClassifier) -> EmergencyReply {
        match self.try_handle(message, faq) {
            Ok(reply) => reply,
            Err(err) => {
                error!(error = %err, "emergency handling failed");
                EmergencyReply {
                    response: templates::CRITICAL_FALLBACK.to_string(),
                    source: EmergencyReplySource::CriticalFallback,
                    confidence: 1.0,
                    category: "error".to_string(),
                    reason: None,
                }
            }
        }
    }

    fn try_handle(&self, message: &str, faq: &FaqClassifier) -> KernelResult<EmergencyReply> {
        let reason = self
            .state
            .read()
            .map_err(|_| KernelError::CatalogPoisoned("emergency state"))?
            .reason
            .clone();

        if let Some(hit) = faq.classify(message).published() {
            return Ok(EmergencyReply {
                response: hit.response.clone(),
                source: EmergencyReplySource::Faq,
                confidence: hit.confidence,
                category: hit.category.clone(),
                reason,
            });
        }

        let template = best_template(message);
        Ok(EmergencyReply {
            response: template.response.to_string(),
            source: EmergencyReplySource::Template,
            confidence: template.confidence,
            category: template.category.to_string(),
            reason,
        })
    }
}

fn best_template(message: &str) -> &'static CategoryTemplate {
    let lowered = message.to_lowercase();
    let mut best = &GENERAL_TEMPLATE;
    let mut best_hits = 0;
    for template in CATEGORY_TEMPLATES {
        let hits = template
            .keywords
            .iter()
            .filter(|k| lowered.contains(*k))
            .count();
        if hits > best_hits {
            best_hits = hits;
            best = template;
        }
    }
    best
}
