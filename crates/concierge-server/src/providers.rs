use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use concierge_config::{Config, RemoteProvider};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How long an HTTP collaborator reports itself unavailable after exhausting its retries.
const CIRCUIT_OPEN_FOR: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{provider} transport error: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned http {status}")]
    Http { provider: &'static str, status: u16 },
    #[error("{provider} contract error: {message}")]
    Contract {
        provider: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    pub content: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub success: bool,
    pub text: String,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError>;
    async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
    async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &'static str;
    async fn add_documents(&self, documents: Vec<(Document, Vec<f32>)>) -> Result<usize, ProviderError>;
    async fn search_similar(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>, ProviderError>;
    async fn clear(&self) -> Result<(), ProviderError>;
    async fn len(&self) -> usize;
    async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> Result<Vec<Document>, ProviderError>;
}

/// The collaborator set handed to the orchestrator.
#[derive(Clone)]
pub struct Providers {
    pub generation: Arc<dyn GenerationProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub vector_store: Arc<dyn VectorStore>,
    pub documents: Arc<dyn DocumentSource>,
}

impl Providers {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let generation: Arc<dyn GenerationProvider> = match cfg.providers.generation.kind.as_str() {
            "http" => Arc::new(HttpGenerationProvider::new(&cfg.providers.generation)?),
            "disabled" => Arc::new(DisabledGeneration),
            other => return Err(format!("unsupported generation provider: {other}")),
        };
        let embedding: Arc<dyn EmbeddingProvider> = match cfg.providers.embedding.kind.as_str() {
            "http" => Arc::new(HttpEmbeddingProvider::new(&cfg.providers.embedding)?),
            "disabled" => Arc::new(DisabledEmbedding),
            other => return Err(format!("unsupported embedding provider: {other}")),
        };
        let vector_store: Arc<dyn VectorStore> = match cfg.providers.vector_store.kind.as_str() {
            "memory" => Arc::new(InMemoryVectorStore::default()),
            "disabled" => Arc::new(DisabledVectorStore),
            other => return Err(format!("unsupported vector store: {other}")),
        };
        let documents = Arc::new(DirectoryDocumentSource::new(
            cfg.providers.documents.path.as_deref().map(PathBuf::from),
        ));
        info!(
            generation = generation.name(),
            embedding = embedding.name(),
            vector_store = vector_store.name(),
            "providers configured"
        );
        Ok(Self {
            generation,
            embedding,
            vector_store,
            documents,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: usize,
    backoff: Duration,
}

impl RetryPolicy {
    fn from_config(cfg: &RemoteProvider) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

/// Remote endpoint with its own timeout, retry budget and failure circuit.
struct RemoteEndpoint {
    provider: &'static str,
    endpoint: Option<String>,
    retry: RetryPolicy,
    circuit_open_until: Mutex<Option<Instant>>,
    client: Client,
}

impl RemoteEndpoint {
    fn new(provider: &'static str, cfg: &RemoteProvider) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            provider,
            endpoint: cfg.endpoint.clone().filter(|v| !v.trim().is_empty()),
            retry: RetryPolicy::from_config(cfg),
            circuit_open_until: Mutex::new(None),
            client,
        })
    }

    async fn is_available(&self) -> bool {
        if self.endpoint.is_none() {
            return false;
        }
        let open_until = self.circuit_open_until.lock().await;
        !matches!(*open_until, Some(until) if until > Instant::now())
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let provider = self.provider;
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(ProviderError::Unavailable(provider))?;

        let mut last_failure = ProviderError::Unavailable(provider);
        for attempt in 0..self.retry.max_attempts {
            let failure = match self.client.post(endpoint).json(body).send().await {
                Ok(response) if response.status().is_success() => match response.json::<R>().await {
                    Ok(v) => {
                        self.record_success().await;
                        return Ok(v);
                    }
                    Err(e) => ProviderError::Contract {
                        provider,
                        message: e.to_string(),
                    },
                },
                Ok(response) => ProviderError::Http {
                    provider,
                    status: response.status().as_u16(),
                },
                Err(e) if e.is_timeout() => ProviderError::Timeout(provider),
                Err(e) => ProviderError::Transport {
                    provider,
                    message: e.to_string(),
                },
            };
            debug!(provider, attempt, error = %failure, "provider call failed");
            last_failure = failure;
            if attempt + 1 < self.retry.max_attempts && self.retry.backoff > Duration::ZERO {
                sleep(self.retry.backoff).await;
            }
        }

        self.record_failure().await;
        warn!(provider, error = %last_failure, "provider retries exhausted");
        Err(last_failure)
    }

    async fn record_failure(&self) {
        let mut open_until = self.circuit_open_until.lock().await;
        *open_until = Some(Instant::now() + CIRCUIT_OPEN_FOR);
    }

    async fn record_success(&self) {
        let mut open_until = self.circuit_open_until.lock().await;
        *open_until = None;
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

pub struct HttpGenerationProvider {
    remote: RemoteEndpoint,
    model: String,
}

impl HttpGenerationProvider {
    pub fn new(cfg: &RemoteProvider) -> Result<Self, String> {
        Ok(Self {
            remote: RemoteEndpoint::new("generation", cfg)?,
            model: cfg.model.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        self.remote
            .post(&GenerateRequest {
                model: &self.model,
                prompt,
            })
            .await
    }

    async fn is_available(&self) -> bool {
        self.remote.is_available().await
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedReply {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingProvider {
    remote: RemoteEndpoint,
    model: String,
}

impl HttpEmbeddingProvider {
    pub fn new(cfg: &RemoteProvider) -> Result<Self, String> {
        Ok(Self {
            remote: RemoteEndpoint::new("embedding", cfg)?,
            model: cfg.model.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let reply: EmbedReply = self
            .remote
            .post(&EmbedRequest {
                model: &self.model,
                input: text,
            })
            .await?;
        if reply.embedding.is_empty() {
            return Err(ProviderError::Contract {
                provider: "embedding",
                message: "empty embedding".to_string(),
            });
        }
        Ok(reply.embedding)
    }

    async fn is_available(&self) -> bool {
        self.remote.is_available().await
    }
}

pub struct DisabledGeneration;

#[async_trait]
impl GenerationProvider for DisabledGeneration {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<Generation, ProviderError> {
        Err(ProviderError::Unavailable("generation"))
    }

    async fn is_available(&self) -> bool {
        false
    }
}

pub struct DisabledEmbedding;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedding {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unavailable("embedding"))
    }

    async fn is_available(&self) -> bool {
        false
    }
}

/// Linear cosine scan over every stored vector.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add_documents(&self, documents: Vec<(Document, Vec<f32>)>) -> Result<usize, ProviderError> {
        let added = documents.len();
        self.entries.write().await.extend(documents);
        Ok(added)
    }

    async fn search_similar(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>, ProviderError> {
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .filter_map(|(document, embedding)| {
                cosine_similarity(vector, embedding).map(|score| ScoredDocument {
                    content: document.content.clone(),
                    metadata: document.metadata.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn clear(&self) -> Result<(), ProviderError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn is_available(&self) -> bool {
        true
    }
}

pub struct DisabledVectorStore;

#[async_trait]
impl VectorStore for DisabledVectorStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn add_documents(&self, _documents: Vec<(Document, Vec<f32>)>) -> Result<usize, ProviderError> {
        Err(ProviderError::Unavailable("vector_store"))
    }

    async fn search_similar(&self, _vector: &[f32], _k: usize) -> Result<Vec<ScoredDocument>, ProviderError> {
        Err(ProviderError::Unavailable("vector_store"))
    }

    async fn clear(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn len(&self) -> usize {
        0
    }

    async fn is_available(&self) -> bool {
        false
    }
}

/// `None` when either vector is zero or the dimensions differ.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Plain-text knowledge base: every `.txt` and `.md` file directly under a directory.
pub struct DirectoryDocumentSource {
    path: Option<PathBuf>,
}

impl DirectoryDocumentSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl DocumentSource for DirectoryDocumentSource {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn load(&self) -> Result<Vec<Document>, ProviderError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let io_error = |e: std::io::Error| ProviderError::Transport {
            provider: "documents",
            message: format!("{}: {e}", path.display()),
        };

        let mut dir = tokio::fs::read_dir(path).await.map_err(io_error)?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
            let file = entry.path();
            let format = file
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase);
            if matches!(format.as_deref(), Some("txt") | Some("md")) {
                files.push(file);
            }
        }
        files.sort();

        let mut documents = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read_to_string(&file).await.map_err(io_error)?;
            if content.trim().is_empty() {
                continue;
            }
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let format = file
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            documents.push(
                Document::new(content.trim())
                    .with_metadata("filename", filename)
                    .with_metadata("format", format),
            );
        }
        info!(path = %path.display(), documents = documents.len(), "documents loaded");
        Ok(documents)
    }
}
