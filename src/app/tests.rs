use super::*;
use crate::embeddings::Document;
use crate::generation::{GenerationProvider, GenerationRequest};
use crate::{RagError, Result as RagResult};
use async_trait::async_trait;
use tempfile::TempDir;

const DIMENSION: usize = 8;

struct LengthEmbedder;

#[async_trait]
impl EmbeddingProvider for LengthEmbedder {
    fn name(&self) -> &str {
        "length"
    }

    async fn embed(&self, text: &str, _model: &str) -> RagResult<Vec<f32>> {
        let mut vector = vec![0.5_f32; DIMENSION];
        vector[text.len() % DIMENSION] += 1.0;
        Ok(vector)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct StaticProvider;

#[async_trait]
impl GenerationProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn default_model(&self) -> &str {
        "static-1"
    }

    async fn generate(&self, _request: &GenerationRequest) -> RagResult<String> {
        Ok("static answer".to_string())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config {
        base_dir: dir.path().join("data"),
        ..Config::default()
    };
    config.embedding.dimension = DIMENSION;
    config.generation.default_provider = "static".to_string();
    config
}

async fn test_context(config: Config) -> AppContext {
    let mut registry = ProviderRegistry::new("static");
    registry
        .register(Arc::new(StaticProvider))
        .expect("should register provider");
    AppContext::with_providers(config, Arc::new(LengthEmbedder), registry)
        .await
        .expect("should build context")
}

#[tokio::test]
async fn context_creates_data_directory() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&temp_dir);

    let context = test_context(config.clone()).await;

    assert!(config.cache_database_path().exists());
    assert!(context.orchestrator().index().is_empty().await);
    assert_eq!(context.orchestrator().pipeline().dimension(), DIMENSION);
}

#[tokio::test]
async fn persisted_index_is_restored_by_next_context() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&temp_dir);

    let first = test_context(config.clone()).await;
    let report = first
        .orchestrator()
        .ingest(
            &[
                Document::new("a", "first document"),
                Document::new("b", "second document text"),
            ],
            false,
        )
        .await;
    assert_eq!(report.processed, 2);
    first.persist().await.expect("should persist index");
    drop(first);

    let second = test_context(config).await;
    assert_eq!(second.orchestrator().index().len().await, 2);
    assert_eq!(
        second.orchestrator().index().document_ids().await,
        vec!["a".to_string(), "b".to_string()]
    );
}

#[tokio::test]
async fn query_options_follow_configuration() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = test_config(&temp_dir);
    config.retrieval.max_sources = 3;
    config.retrieval.min_confidence = 0.4;
    config.generation.timeout_seconds = 9;

    let context = test_context(config).await;
    let options = context.query_options();

    assert_eq!(options.max_sources, 3);
    assert_eq!(options.min_confidence, 0.4);
    assert_eq!(options.timeout, Some(Duration::from_secs(9)));
    assert_eq!(options.provider, None);
}

#[tokio::test]
async fn sweeper_is_optional() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = test_config(&temp_dir);
    config.cache.sweep_interval_seconds = 0;
    let context = test_context(config).await;
    assert!(context.spawn_cache_sweeper().is_none());

    let temp_dir = TempDir::new().expect("should create temp dir");
    let context = test_context(test_config(&temp_dir)).await;
    let handle = context
        .spawn_cache_sweeper()
        .expect("sweeper should start");
    handle.abort();
}

#[tokio::test]
async fn from_config_builds_default_providers_without_network() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };

    let context = AppContext::from_config(config)
        .await
        .expect("should build context from defaults");

    let providers = context.orchestrator().providers();
    assert_eq!(providers.default_provider(), "ollama");
    assert_eq!(providers.names(), vec!["ollama", "openai"]);
}

#[tokio::test]
async fn from_config_rejects_invalid_configuration() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.retrieval.min_confidence = 0.0;

    let result = AppContext::from_config(config).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn corrupt_snapshot_fails_startup() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&temp_dir);
    let index_dir = config.vector_index_path();
    std::fs::create_dir_all(&index_dir).expect("should create index dir");
    std::fs::write(index_dir.join("manifest.json"), "not json").expect("should write manifest");

    let mut registry = ProviderRegistry::new("static");
    registry
        .register(Arc::new(StaticProvider))
        .expect("should register provider");
    let result = AppContext::with_providers(config, Arc::new(LengthEmbedder), registry).await;

    let error = result.expect_err("corrupt snapshot should fail");
    assert!(
        error
            .chain()
            .any(|cause| cause.downcast_ref::<RagError>().is_some())
    );
}
