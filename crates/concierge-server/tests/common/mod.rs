#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use concierge_config::{
    Admin, Cache, Config, Documents, Logging, RateLimit, RemoteProvider, Retrieval, Sanitizer,
    Server, VectorStore as VectorStoreConfig,
};
use concierge_server::{
    Document, DocumentSource, EmbeddingProvider, Generation, GenerationProvider,
    InMemoryVectorStore, ProviderError, Providers, ScoredDocument, VectorStore,
};
use serde_json::Value;

pub fn test_config() -> Config {
    let remote = |kind: &str| RemoteProvider {
        kind: kind.to_string(),
        endpoint: None,
        model: None,
        timeout_ms: 1_000,
        retry_max_attempts: 1,
        retry_backoff_ms: 0,
    };
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        logging: Logging::default(),
        rate_limit: RateLimit {
            max_requests: 30,
            window_seconds: 60,
            burst_limit: 10,
            burst_window_seconds: 10,
            categories: BTreeMap::new(),
        },
        sanitizer: Sanitizer::default(),
        cache: Cache {
            enabled: true,
            ttl_seconds: 3600,
            max_entries: 100,
        },
        retrieval: Retrieval::default(),
        providers: concierge_config::Providers {
            generation: remote("http"),
            embedding: remote("http"),
            vector_store: VectorStoreConfig {
                kind: "memory".to_string(),
                timeout_ms: 1_000,
            },
            documents: Documents::default(),
        },
        admin: Admin::default(),
    }
}

pub enum Reply {
    Text(&'static str),
    Unsuccessful,
    Hang,
    Panic,
}

pub struct FakeGeneration {
    pub available: bool,
    pub reply: Reply,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeGeneration {
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationProvider for FakeGeneration {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.reply {
            Reply::Text(text) => Ok(Generation {
                success: true,
                text: text.to_string(),
            }),
            Reply::Unsuccessful => Ok(Generation {
                success: false,
                text: String::new(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ProviderError::Timeout("generation"))
            }
            Reply::Panic => panic!("generation backend exploded"),
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }
}

pub struct FakeEmbedding {
    pub available: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeEmbedding {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedding {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("embedding"));
        }
        let lowered = text.to_lowercase();
        Ok(vec![
            1.0,
            lowered.matches("python").count() as f32,
            lowered.matches("rust").count() as f32,
        ])
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct DownVectorStore;

#[async_trait]
impl VectorStore for DownVectorStore {
    fn name(&self) -> &'static str {
        "down"
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

pub struct StaticDocuments(pub Vec<Document>);

#[async_trait]
impl DocumentSource for StaticDocuments {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn load(&self) -> Result<Vec<Document>, ProviderError> {
        Ok(self.0.clone())
    }
}

pub fn knowledge_base() -> Vec<Document> {
    vec![
        Document::new("Cinco años construyendo APIs y pipelines de datos con Python y Flask.")
            .with_metadata("filename", "experiencia.md"),
        Document::new("Servicios de backend escritos en Rust con axum y tokio.")
            .with_metadata("filename", "proyectos.md"),
    ]
}

pub struct Harness {
    pub generation: Arc<FakeGeneration>,
    pub embedding: Arc<FakeEmbedding>,
    pub providers: Providers,
}

pub struct HarnessBuilder {
    llm: bool,
    embedding: bool,
    vector_store: bool,
    reply: Reply,
}

impl HarnessBuilder {
    pub fn llm(mut self, available: bool) -> Self {
        self.llm = available;
        self
    }

    pub fn embedding(mut self, available: bool) -> Self {
        self.embedding = available;
        self
    }

    pub fn vector_store(mut self, available: bool) -> Self {
        self.vector_store = available;
        self
    }

    pub fn reply(mut self, reply: Reply) -> Self {
        self.reply = reply;
        self
    }

    pub fn build(self) -> Harness {
        let generation = Arc::new(FakeGeneration {
            available: self.llm,
            reply: self.reply,
            prompts: Mutex::new(Vec::new()),
        });
        let embedding = Arc::new(FakeEmbedding {
            available: AtomicBool::new(self.embedding),
            calls: AtomicUsize::new(0),
        });
        let vector_store: Arc<dyn VectorStore> = if self.vector_store {
            Arc::new(InMemoryVectorStore::default())
        } else {
            Arc::new(DownVectorStore)
        };
        let providers = Providers {
            generation: generation.clone(),
            embedding: embedding.clone(),
            vector_store,
            documents: Arc::new(StaticDocuments(knowledge_base())),
        };
        Harness {
            generation,
            embedding,
            providers,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        llm: true,
        embedding: true,
        vector_store: true,
        reply: Reply::Text("Tengo experiencia en Python construyendo APIs y pipelines de datos con Flask."),
    }
}

pub fn chat_request(body: Value, session: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .header("x-session-id", session)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn flow_path(payload: &Value) -> Vec<String> {
    payload["metadata"]["flow_path"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}
