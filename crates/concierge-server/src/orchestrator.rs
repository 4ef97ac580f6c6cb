//! End-to-end chat pipeline.
//!
//! A request walks an explicit sequence of [`Stage`]s. Every stage either hands
//! over to the next one, finishes with a response, or fails with a
//! [`PipelineError`] that is turned into a localized template exactly once, at
//! the top of [`Orchestrator::handle_chat`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use concierge_config::Config;
use concierge_contracts::{
    flow, ChatRequest, ChatResponse, Language, PipelineTrace, ReloadOutcome, ResponseSource,
    ServicesHealth, API_VERSION,
};
use concierge_kernel::{
    request_fingerprint, CacheStats, ClientIdentity, DenyReason, EmergencyController,
    EmergencyReplySource, EmergencyStatus, EnforcementAction, FaqClassifier, FaqStats,
    GlobalRateStats, InputSanitizer, Localizer, LocalizerStats, RateLimitConfig, RateLimiter,
    Rejection, ResponseCache, SafetyChecker, SafetyLevel, SafetyStats, SanitizerConfig,
    SectionStats, SectionValidator, WindowLimit,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::providers::{ProviderError, Providers, ScoredDocument};

pub const CHAT_CATEGORY: &str = "chat";

const DEFAULT_SYSTEM_PROMPT: &str = "Eres un asistente especializado en responder consultas sobre mi perfil profesional y portfolio: experiencia, proyectos, tecnologías, formación, contacto y disponibilidad laboral. Eres profesional pero amigable.";

const PROMPT_INSTRUCTIONS: &str = "INSTRUCCIONES:
- Responde de manera profesional y amigable
- Usa SOLO la información de mis documentos cuando sea relevante
- Si no tienes información específica, sé honesto al respecto
- Mantén un tono conversacional pero profesional";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationFailure {
    #[error("input rejected: {}", .rejection.as_str())]
    Rejected {
        rejection: Rejection,
        warnings: Vec<String>,
    },
    #[error("unsafe input: {}", .level.as_str())]
    Unsafe { level: SafetyLevel, rules: Vec<String> },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("admission denied ({reason:?}), retry after {retry_after_secs}s")]
    AdmissionDenied {
        reason: DenyReason,
        retry_after_secs: u64,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(ValidationFailure),
    #[error("{0} unavailable")]
    DependencyUnavailable(&'static str),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub system_prompt: String,
    pub search_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderNames {
    pub generation: &'static str,
    pub embedding: &'static str,
    pub vector_store: &'static str,
    pub documents: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub api_version: &'static str,
    pub services: ServicesHealth,
    pub providers: ProviderNames,
    pub documents_indexed: usize,
    pub emergency: EmergencyStatus,
    pub rate_limits: GlobalRateStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    pub faq: FaqStats,
    pub sections: SectionStats,
    pub safety: SafetyStats,
    pub localization: LocalizerStats,
}

enum Stage {
    RateLimit,
    Sanitize,
    InputSafety,
    CacheLookup,
    HealthCheck,
    EmergencyRoute,
    SectionValidate,
    FaqClassify,
    Generate,
    OutputSafety(GeneratedAnswer),
    Localize { response: ChatResponse, cache: bool },
    CacheStore(ChatResponse),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::RateLimit => "rate_limiting",
            Stage::Sanitize => "input_validation",
            Stage::InputSafety => "input_safety",
            Stage::CacheLookup => "cache_lookup",
            Stage::HealthCheck => "health_check",
            Stage::EmergencyRoute => "emergency_check",
            Stage::SectionValidate => "section_validation",
            Stage::FaqClassify => "faq_classification",
            Stage::Generate => "rag_generation",
            Stage::OutputSafety(_) => "output_safety",
            Stage::Localize { .. } => "i18n",
            Stage::CacheStore(_) => "cache_store",
        }
    }
}

enum StepOutcome {
    Next(Stage),
    Done(ChatResponse),
}

struct GeneratedAnswer {
    text: String,
    sources_used: usize,
    context_found: bool,
}

/// Per-request working state. Never shared across requests.
struct Turn {
    identity: ClientIdentity,
    message: String,
    context: Option<String>,
    intended_section: Option<String>,
    language: Language,
    text: String,
    cache_key: Option<String>,
    health: ServicesHealth,
    trace: PipelineTrace,
}

pub struct Orchestrator {
    rate_limiter: RateLimiter,
    sanitizer: InputSanitizer,
    safety: SafetyChecker,
    faq: FaqClassifier,
    sections: SectionValidator,
    emergency: EmergencyController,
    cache: Option<ResponseCache>,
    localizer: Localizer,
    providers: Providers,
    retrieval: RetrievalSettings,
}

impl Orchestrator {
    pub fn new(cfg: &Config, providers: Providers) -> Result<Self, String> {
        let rate = &cfg.rate_limit;
        let rate_limiter = RateLimiter::new(RateLimitConfig {
            max_requests: rate.max_requests,
            window: Duration::from_secs(rate.window_seconds),
            burst_limit: rate.burst_limit,
            burst_window: Duration::from_secs(rate.burst_window_seconds),
            categories: rate
                .categories
                .iter()
                .map(|(name, limit)| {
                    (
                        name.clone(),
                        WindowLimit {
                            max_requests: limit.max_requests,
                            window: Duration::from_secs(limit.window_seconds),
                        },
                    )
                })
                .collect(),
        });
        let sanitizer = InputSanitizer::new(SanitizerConfig {
            max_length: cfg.sanitizer.max_length,
            min_length: cfg.sanitizer.min_length,
        })
        .map_err(|e| e.to_string())?;
        let cache = cfg.cache.enabled.then(|| {
            ResponseCache::new(
                Duration::from_secs(cfg.cache.ttl_seconds),
                cfg.cache.max_entries,
            )
        });

        Ok(Self {
            rate_limiter,
            sanitizer,
            safety: SafetyChecker::new().map_err(|e| e.to_string())?,
            faq: FaqClassifier::new().map_err(|e| e.to_string())?,
            sections: SectionValidator::new(),
            emergency: EmergencyController::new(),
            cache,
            localizer: Localizer::new(),
            providers,
            retrieval: RetrievalSettings {
                top_k: cfg.retrieval.top_k.max(1),
                max_context_chars: cfg.retrieval.max_context_chars,
                system_prompt: cfg
                    .retrieval
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                search_timeout: Duration::from_millis(cfg.providers.vector_store.timeout_ms),
            },
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn emergency(&self) -> &EmergencyController {
        &self.emergency
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Explicit request language when supported, else detected from the message.
    pub fn target_language(&self, request: &ChatRequest) -> Language {
        request
            .language
            .as_deref()
            .and_then(Language::parse)
            .unwrap_or_else(|| self.localizer.detect_language(&request.message))
    }

    /// Runs the pipeline on a separate task so a panic anywhere inside it still
    /// yields a `critical_error` response. Cancelling `cancel` abandons the
    /// remaining stages.
    pub async fn handle_chat_task(
        self: Arc<Self>,
        request: ChatRequest,
        identity: ClientIdentity,
        cancel: CancellationToken,
    ) -> ChatResponse {
        let language = self.target_language(&request);
        let request_id = uuid::Uuid::new_v4().to_string();
        let worker = Arc::clone(&self);
        let id = request_id.clone();
        match tokio::spawn(async move { worker.run(request, identity, id, cancel).await }).await {
            Ok(response) => response,
            Err(join_error) => {
                let mut trace = PipelineTrace::new(request_id);
                let response = self.recover(
                    PipelineError::Internal(join_error.to_string()),
                    language,
                    &mut trace,
                );
                finish(response, trace, language, None)
            }
        }
    }

    pub async fn handle_chat(
        &self,
        request: ChatRequest,
        identity: ClientIdentity,
        cancel: CancellationToken,
    ) -> ChatResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.run(request, identity, request_id, cancel).await
    }

    async fn run(
        &self,
        request: ChatRequest,
        identity: ClientIdentity,
        request_id: String,
        cancel: CancellationToken,
    ) -> ChatResponse {
        let started = Instant::now();
        let language = self.target_language(&request);
        let mut turn = Turn {
            identity,
            message: request.message,
            context: request.context.filter(|c| !c.trim().is_empty()),
            intended_section: request.section,
            language,
            text: String::new(),
            cache_key: None,
            health: ServicesHealth::all_available(),
            trace: PipelineTrace::new(request_id),
        };

        let mut stage = Stage::RateLimit;
        let outcome = loop {
            // Admission is recorded by the first stage, so it is never refunded.
            if cancel.is_cancelled() {
                break Err(PipelineError::Cancelled);
            }
            let name = stage.name();
            let stage_started = Instant::now();
            let step = self.step(stage, &mut turn, &cancel).await;
            turn.trace.complete(name, stage_started.elapsed());
            match step {
                Ok(StepOutcome::Next(next)) => stage = next,
                Ok(StepOutcome::Done(response)) => break Ok(response),
                Err(err) => break Err(err),
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(err) => self.recover(err, turn.language, &mut turn.trace),
        };
        let response = finish(response, turn.trace, turn.language, Some(started));
        info!(
            request_id = %response.metadata.request_id,
            identity = turn.identity.as_str(),
            source = response.source.as_str(),
            flow = ?response.metadata.flow_path,
            total_ms = response.metadata.total_time_ms,
            "chat request handled"
        );
        response
    }

    async fn step(
        &self,
        stage: Stage,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        match stage {
            Stage::RateLimit => self.admit(turn),
            Stage::Sanitize => self.sanitize(turn),
            Stage::InputSafety => self.check_input(turn),
            Stage::CacheLookup => Ok(self.lookup_cache(turn)),
            Stage::HealthCheck => self.check_health(turn, cancel).await,
            Stage::EmergencyRoute => Ok(self.route_emergency(turn)),
            Stage::SectionValidate => Ok(self.validate_section(turn)),
            Stage::FaqClassify => Ok(self.classify_faq(turn)),
            Stage::Generate => self.generate(turn, cancel).await,
            Stage::OutputSafety(answer) => Ok(self.check_output(turn, answer)),
            Stage::Localize { response, cache } => {
                let response = self.localizer.translate(response, turn.language);
                Ok(if cache {
                    StepOutcome::Next(Stage::CacheStore(response))
                } else {
                    StepOutcome::Done(response)
                })
            }
            Stage::CacheStore(response) => Ok(self.store_in_cache(turn, response)),
        }
    }

    fn admit(&self, turn: &mut Turn) -> Result<StepOutcome, PipelineError> {
        let decision = self.rate_limiter.admit(&turn.identity, CHAT_CATEGORY);
        if !decision.allowed {
            return Err(PipelineError::AdmissionDenied {
                reason: decision.reason.unwrap_or(DenyReason::RateLimitExceeded),
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok(StepOutcome::Next(Stage::Sanitize))
    }

    fn sanitize(&self, turn: &mut Turn) -> Result<StepOutcome, PipelineError> {
        let result = self.sanitizer.process(&turn.message, turn.context.as_deref());
        turn.trace.input_transformations = result
            .transformations
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        if !result.is_valid {
            return Err(PipelineError::ValidationFailed(ValidationFailure::Rejected {
                rejection: result.rejection.unwrap_or(Rejection::Empty),
                warnings: result.warnings,
            }));
        }
        turn.text = result.text;
        Ok(StepOutcome::Next(Stage::InputSafety))
    }

    fn check_input(&self, turn: &mut Turn) -> Result<StepOutcome, PipelineError> {
        let verdict = self.safety.check_input(&turn.text);
        if !verdict.is_safe {
            return Err(PipelineError::ValidationFailed(ValidationFailure::Unsafe {
                level: verdict.level,
                rules: verdict.issues.into_iter().map(|i| i.rule_id).collect(),
            }));
        }
        if verdict.was_filtered {
            turn.text = verdict.text;
        }
        Ok(StepOutcome::Next(Stage::CacheLookup))
    }

    fn lookup_cache(&self, turn: &mut Turn) -> StepOutcome {
        if let Some(cache) = &self.cache {
            let key = request_fingerprint(&turn.text, turn.context.as_deref(), turn.language);
            if let Some(mut cached) = cache.get(&key) {
                debug!(key = %key, "response cache hit");
                turn.trace.push_path(flow::CACHE_HIT);
                cached.source = ResponseSource::Cache;
                cached.from_cache = true;
                return StepOutcome::Done(cached);
            }
            turn.cache_key = Some(key);
        }
        turn.trace.push_path(flow::CACHE_MISS);
        StepOutcome::Next(Stage::HealthCheck)
    }

    async fn check_health(
        &self,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let health = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            health = self.services_health() => health,
        };
        self.emergency.evaluate(&health);
        turn.health = health;
        turn.trace.services_status = Some(health);
        Ok(StepOutcome::Next(Stage::EmergencyRoute))
    }

    fn route_emergency(&self, turn: &mut Turn) -> StepOutcome {
        if !self.emergency.is_active() {
            return StepOutcome::Next(Stage::SectionValidate);
        }
        turn.trace.push_path(flow::EMERGENCY_MODE);
        let reply = self.emergency.handle(&turn.text, &self.faq);
        let mut response = ChatResponse::new(true, reply.response, ResponseSource::Emergency);
        response.confidence = Some(reply.confidence);
        response.category = Some(reply.category);
        response.template_type = Some(
            match reply.source {
                EmergencyReplySource::Faq => "faq",
                EmergencyReplySource::Template => "emergency_template",
                EmergencyReplySource::CriticalFallback => "critical_fallback",
            }
            .to_string(),
        );
        StepOutcome::Next(Stage::Localize {
            response,
            cache: false,
        })
    }

    fn validate_section(&self, turn: &mut Turn) -> StepOutcome {
        let validation = self
            .sections
            .validate(&turn.text, turn.intended_section.as_deref());
        turn.trace.detected_section = Some(validation.detected_section.as_str().to_string());

        let tag = match validation.enforcement_action {
            EnforcementAction::Proceed => return StepOutcome::Next(Stage::FaqClassify),
            EnforcementAction::Guide | EnforcementAction::Redirect => flow::SECTION_GUIDANCE,
            EnforcementAction::Clarify => flow::SECTION_CLARIFICATION,
        };
        turn.trace.push_path(tag);

        let guidance = validation.guidance.unwrap_or_default();
        let mut response = ChatResponse::new(true, guidance.clone(), ResponseSource::Template);
        response.guidance = Some(guidance);
        response.template_type = Some(tag.to_string());
        response.confidence = Some(validation.confidence);
        response.question_templates = validation.question_templates;
        response.conflicting_sections = validation
            .conflicting_sections
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        response.issues = validation
            .issues
            .iter()
            .map(|i| i.as_str().to_string())
            .collect();
        StepOutcome::Next(Stage::Localize {
            response,
            cache: false,
        })
    }

    fn classify_faq(&self, turn: &mut Turn) -> StepOutcome {
        let classification = self.faq.classify(&turn.text);
        let Some(hit) = classification.published() else {
            return StepOutcome::Next(Stage::Generate);
        };
        turn.trace.push_path(flow::FAQ_RESPONSE);
        let mut response = ChatResponse::new(true, hit.response.clone(), ResponseSource::Faq);
        response.confidence = Some(hit.confidence);
        response.category = Some(hit.category.clone());
        StepOutcome::Next(Stage::Localize {
            response,
            cache: true,
        })
    }

    async fn generate(
        &self,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        turn.trace.push_path(flow::RAG_GENERATION);
        if !turn.health.llm_available {
            return Err(PipelineError::DependencyUnavailable("llm"));
        }

        let context = self.retrieve(&turn.text, turn.health, cancel).await?;
        let prompt = self.build_prompt(&turn.text, &context, turn.context.as_deref());
        let generation = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            generation = self.providers.generation.generate(&prompt) => generation,
        };
        match generation {
            Ok(generation) if generation.success && !generation.text.trim().is_empty() => {
                Ok(StepOutcome::Next(Stage::OutputSafety(GeneratedAnswer {
                    text: generation.text,
                    sources_used: context.len(),
                    context_found: !context.is_empty(),
                })))
            }
            Ok(_) => Err(PipelineError::GenerationFailed(
                "provider reported an unsuccessful generation".to_string(),
            )),
            Err(err) => Err(PipelineError::GenerationFailed(err.to_string())),
        }
    }

    /// Retrieval problems only cost context; cancellation still propagates.
    async fn retrieve(
        &self,
        query: &str,
        health: ServicesHealth,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredDocument>, PipelineError> {
        if !health.embedding_available || !health.vector_store_available {
            return Ok(Vec::new());
        }
        let search = async {
            let vector = self.providers.embedding.embed(query).await?;
            timeout(
                self.retrieval.search_timeout,
                self.providers
                    .vector_store
                    .search_similar(&vector, self.retrieval.top_k),
            )
            .await
            .map_err(|_| ProviderError::Timeout("vector_store"))?
        };
        let found = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            found = search => found,
        };
        Ok(found.unwrap_or_else(|err| {
            warn!(error = %err, "context retrieval failed; generating without context");
            Vec::new()
        }))
    }

    fn build_prompt(&self, message: &str, context: &[ScoredDocument], user_context: Option<&str>) -> String {
        let mut prompt = self.retrieval.system_prompt.clone();
        if !context.is_empty() {
            prompt.push_str("\n\nINFORMACIÓN RELEVANTE DE MIS DOCUMENTOS:\n");
            for (position, document) in context.iter().enumerate() {
                prompt.push_str(&format!(
                    "\n[Fuente {}]: {}",
                    position + 1,
                    clip(&document.content, self.retrieval.max_context_chars)
                ));
                if let Some(filename) = document.metadata.get("filename") {
                    prompt.push_str(&format!(" (de: {filename})"));
                }
            }
        }
        if let Some(user_context) = user_context {
            prompt.push_str(&format!("\n\nCONTEXTO DEL USUARIO: {user_context}"));
        }
        prompt.push_str(&format!(
            "\n\nCONSULTA DEL USUARIO: {message}\n\n{PROMPT_INSTRUCTIONS}\n\nRESPUESTA:"
        ));
        prompt
    }

    fn check_output(&self, turn: &mut Turn, answer: GeneratedAnswer) -> StepOutcome {
        let verdict = self.safety.check_output(&answer.text, Some(&turn.text));
        if !verdict.is_safe {
            warn!(level = verdict.level.as_str(), "generated output rejected");
            turn.trace.push_path(flow::OUTPUT_UNSAFE_TEMPLATE);
            turn.trace.internal_error = verdict.internal_error;
            let mut response = self.template("unsafe_output", turn.language);
            response.issues = verdict.issues.into_iter().map(|i| i.rule_id).collect();
            return StepOutcome::Done(response);
        }
        let mut response = ChatResponse::new(true, verdict.text, ResponseSource::Rag);
        response.sources_used = Some(answer.sources_used);
        response.context_found = Some(answer.context_found);
        StepOutcome::Next(Stage::Localize {
            response,
            cache: true,
        })
    }

    fn store_in_cache(&self, turn: &Turn, response: ChatResponse) -> StepOutcome {
        if let (Some(cache), Some(key)) = (&self.cache, &turn.cache_key) {
            let mut snapshot = response.clone();
            snapshot.metadata = turn.trace.clone();
            snapshot.language = turn.language;
            cache.set(key.clone(), &snapshot);
        }
        StepOutcome::Done(response)
    }

    fn template(&self, key: &str, language: Language) -> ChatResponse {
        let mut response = ChatResponse::new(
            true,
            self.localizer.message(key, language),
            ResponseSource::Template,
        );
        response.template_type = Some(key.to_string());
        response
    }

    /// The single place a failed stage becomes a user-facing response.
    fn recover(&self, err: PipelineError, language: Language, trace: &mut PipelineTrace) -> ChatResponse {
        let message = |key: &str| self.localizer.message(key, language);
        match err {
            PipelineError::AdmissionDenied {
                retry_after_secs, ..
            } => {
                trace.push_path(flow::RATE_LIMIT_EXCEEDED);
                let mut response = ChatResponse::new(
                    false,
                    message("rate_limit_exceeded"),
                    ResponseSource::Template,
                )
                .with_error("Rate limit exceeded");
                response.retry_after = Some(retry_after_secs);
                response
            }
            PipelineError::ValidationFailed(ValidationFailure::Rejected {
                rejection,
                warnings,
            }) => {
                debug!(rejection = rejection.as_str(), "input rejected");
                trace.push_path(flow::INPUT_VALIDATION_FAILED);
                let key = match rejection {
                    Rejection::TooLong => "input_too_long",
                    _ => "input_invalid",
                };
                let mut response = ChatResponse::new(false, message(key), ResponseSource::Template)
                    .with_error("Input validation failed");
                response.issues = warnings;
                response
            }
            PipelineError::ValidationFailed(ValidationFailure::Unsafe { level, rules }) => {
                info!(level = level.as_str(), rules = ?rules, "unsafe input rejected");
                trace.push_path(flow::INPUT_UNSAFE);
                let mut response = ChatResponse::new(
                    false,
                    message("inappropriate_content"),
                    ResponseSource::Template,
                )
                .with_error("Unsafe input detected");
                response.issues = rules;
                response
            }
            PipelineError::DependencyUnavailable(dependency) => {
                warn!(dependency, "serving template for unavailable dependency");
                trace.push_path(flow::LLM_UNAVAILABLE_TEMPLATE);
                self.template("llm_unavailable", language)
            }
            PipelineError::GenerationFailed(detail) => {
                warn!(error = %detail, "generation failed");
                trace.push_path(flow::RAG_ERROR_TEMPLATE);
                trace.internal_error = Some(detail);
                self.template("generation_error", language)
            }
            PipelineError::Cancelled => {
                debug!("request cancelled");
                trace.push_path(flow::CANCELLED);
                ChatResponse::new(false, message("request_cancelled"), ResponseSource::Template)
                    .with_error("Request cancelled")
            }
            PipelineError::Internal(detail) => {
                error!(error = %detail, "chat pipeline failed");
                trace.push_path(flow::CRITICAL_ERROR);
                trace.internal_error = Some(detail);
                ChatResponse::new(false, message("system_error"), ResponseSource::Template)
                    .with_error("Internal error")
            }
        }
    }

    pub async fn services_health(&self) -> ServicesHealth {
        let (llm_available, embedding_available, vector_store_available) = tokio::join!(
            self.providers.generation.is_available(),
            self.providers.embedding.is_available(),
            self.providers.vector_store.is_available(),
        );
        ServicesHealth {
            llm_available,
            vector_store_available,
            embedding_available,
        }
    }

    /// Replaces the indexed knowledge base with the current document source.
    pub async fn reload_knowledge_base(&self) -> ReloadOutcome {
        match self.try_reload().await {
            Ok(documents_loaded) => {
                info!(documents_loaded, "knowledge base reloaded");
                ReloadOutcome {
                    success: true,
                    error: None,
                    documents_loaded,
                }
            }
            Err(err) => {
                error!(error = %err, "knowledge base reload failed");
                ReloadOutcome {
                    success: false,
                    error: Some(err.to_string()),
                    documents_loaded: 0,
                }
            }
        }
    }

    async fn try_reload(&self) -> Result<usize, ProviderError> {
        let documents = self.providers.documents.load().await?;
        if documents.is_empty() {
            self.clear_index().await?;
            warn!("no documents to index");
            return Ok(0);
        }

        let total = documents.len();
        let mut indexed = Vec::with_capacity(total);
        let mut last_failure = None;
        for document in documents {
            match self.providers.embedding.embed(&document.content).await {
                Ok(vector) => indexed.push((document, vector)),
                Err(err) => {
                    warn!(
                        filename = document.metadata.get("filename").map(String::as_str).unwrap_or("unknown"),
                        error = %err,
                        "skipping document without embedding"
                    );
                    last_failure = Some(err);
                }
            }
        }
        if indexed.is_empty() {
            return Err(last_failure.unwrap_or(ProviderError::Unavailable("embedding")));
        }
        debug!(indexed = indexed.len(), total, "documents embedded");
        // The previous index stays live until the new one is fully embedded.
        self.clear_index().await?;
        self.providers.vector_store.add_documents(indexed).await
    }

    async fn clear_index(&self) -> Result<(), ProviderError> {
        self.providers.vector_store.clear().await?;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            api_version: API_VERSION,
            services: self.services_health().await,
            providers: ProviderNames {
                generation: self.providers.generation.name(),
                embedding: self.providers.embedding.name(),
                vector_store: self.providers.vector_store.name(),
                documents: self.providers.documents.name(),
            },
            documents_indexed: self.providers.vector_store.len().await,
            emergency: self.emergency.status(),
            rate_limits: self.rate_limiter.global_stats(),
            cache: self.cache.as_ref().map(ResponseCache::stats),
            faq: self.faq.stats(),
            sections: self.sections.stats(),
            safety: self.safety.stats(),
            localization: self.localizer.stats(),
        }
    }
}

fn finish(
    mut response: ChatResponse,
    mut trace: PipelineTrace,
    language: Language,
    started: Option<Instant>,
) -> ChatResponse {
    trace.total_time_ms = started.map(|s| s.elapsed().as_secs_f64() * 1000.0);
    response.metadata = trace;
    response.language = language;
    response.timestamp = Utc::now().to_rfc3339();
    response
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("experiencia", 20), "experiencia");
        assert_eq!(clip("diseño de APIs", 6), "diseño...");
    }

    #[test]
    fn pipeline_errors_describe_themselves() {
        let denied = PipelineError::AdmissionDenied {
            reason: DenyReason::BurstLimitExceeded,
            retry_after_secs: 10,
        };
        assert!(denied.to_string().contains("retry after 10s"));

        let invalid = PipelineError::ValidationFailed(ValidationFailure::Rejected {
            rejection: Rejection::TooLong,
            warnings: Vec::new(),
        });
        assert_eq!(invalid.to_string(), "validation failed: input rejected: too_long");
        assert_eq!(
            PipelineError::DependencyUnavailable("llm").to_string(),
            "llm unavailable"
        );
    }
}
