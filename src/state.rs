use std::fs;

use crate::config::AppConfig;
use crate::embedding::EmbeddingCache;
use crate::models::device::{self, Device};
use crate::models::weights::WeightsResolver;
use crate::models::ModelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot create {path}: {source}")]
    Dir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cannot initialise ONNX Runtime: {0}")]
    Runtime(#[from] ort::OrtError),
}

/// Shared, request-independent state managed by Rocket.
pub struct AppState {
    pub config: AppConfig,
    pub http: reqwest::Client,
    pub registry: ModelRegistry,
    pub embeddings: EmbeddingCache,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, StartupError> {
        for dir in [config.model_cache_dir(), config.embeddings_dir(), config.temp_dir()] {
            fs::create_dir_all(&dir).map_err(|source| StartupError::Dir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        let device = device::probe(config.device);
        let weights = WeightsResolver::new(config.model_cache_dir(), config.weights_base_url.clone(), http.clone());
        let registry = ModelRegistry::new(device::environment()?, device, weights);
        let embeddings = EmbeddingCache::new(config.embeddings_dir());

        tracing::info!(
            %device,
            models = %config.model_cache_dir().display(),
            embeddings = %config.embeddings_dir().display(),
            temp = %config.temp_dir().display(),
            "server state ready"
        );

        Ok(Self {
            config,
            http,
            registry,
            embeddings,
        })
    }

    pub fn device(&self) -> Device {
        self.registry.device()
    }
}
