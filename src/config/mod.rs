//! Configuration management for skema
//!
//! Loads, validates and persists the TOML configuration, with environment
//! variable overrides for the settings most likely to differ per machine.

use crate::context::ContextConfig;
use crate::enrich::EnrichmentConfig;
use crate::error::{Result, SkemaError};
use crate::llm::{DEFAULT_CONTEXT_LENGTH, DEFAULT_OLLAMA_URL};
use crate::orchestrator::OrchestratorConfig;
use crate::store::{AnnParams, FusionConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub enrichment: EnrichmentSettings,
    pub retrieval: RetrievalConfig,
    pub context: ContextSettings,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Text-generation model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Token budget assumed when the model does not report one
    pub fallback_context_length: usize,
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
}

/// Enrichment pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentSettings {
    /// Width of the summarization worker pool
    pub concurrency: usize,
    /// Texts per embedding call
    pub batch_size: usize,
}

/// Retrieval and indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rrf_k: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Minimum collection size before an HNSW index is built
    pub ann_threshold: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_search: usize,
    /// Chunk cap for broad (full-corpus) questions
    pub broad_limit: usize,
}

/// Context window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    pub soft_limit_ratio: f32,
    pub first_pass_keep: usize,
    pub later_pass_keep: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.local/share/skema"),
            },
            llm: LlmConfig {
                base_url: DEFAULT_OLLAMA_URL.to_string(),
                model: "llama3.1".to_string(),
                temperature: 0.2,
                fallback_context_length: DEFAULT_CONTEXT_LENGTH,
            },
            embedding: EmbeddingConfig {
                base_url: DEFAULT_OLLAMA_URL.to_string(),
                model: "nomic-embed-text".to_string(),
                dimension: 768,
            },
            enrichment: EnrichmentSettings {
                concurrency: 5,
                batch_size: 32,
            },
            retrieval: RetrievalConfig {
                top_k: 30,
                rrf_k: 60.0,
                semantic_weight: 1.0,
                keyword_weight: 1.0,
                ann_threshold: 256,
                hnsw_ef_construction: 200,
                hnsw_m: 16,
                hnsw_ef_search: 50,
                broad_limit: 500,
            },
            context: ContextSettings {
                soft_limit_ratio: 0.9,
                first_pass_keep: 10,
                later_pass_keep: 5,
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SkemaError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| SkemaError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| SkemaError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SkemaError::Config("Cannot determine config directory".to_string()))?;
        Ok(config_dir.join("skema").join("config.toml"))
    }

    /// Apply environment variable overrides
    /// Environment variables in format: SKEMA_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("SKEMA_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => {
                self.storage.data_dir = PathBuf::from(value);
            }
            "LLM__BASE_URL" => {
                self.llm.base_url = value.to_string();
            }
            "LLM__MODEL" => {
                self.llm.model = value.to_string();
            }
            "EMBEDDING__BASE_URL" => {
                self.embedding.base_url = value.to_string();
            }
            "EMBEDDING__MODEL" => {
                self.embedding.model = value.to_string();
            }
            "ENRICHMENT__CONCURRENCY" => {
                self.enrichment.concurrency =
                    value.parse().map_err(|_| SkemaError::InvalidConfigValue {
                        path: path.to_string(),
                        message: format!("Cannot parse '{}' as integer", value),
                    })?;
            }
            _ => {
                return Err(SkemaError::InvalidConfigValue {
                    path: path.to_string(),
                    message: "Unknown configuration key".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Vector store settings derived from this configuration.
    pub fn store_config(&self, data_dir: PathBuf) -> Result<StoreConfig> {
        let fusion = FusionConfig::new(
            self.retrieval.rrf_k,
            self.retrieval.semantic_weight,
            self.retrieval.keyword_weight,
        )
        .map_err(|e| SkemaError::Config(e.to_string()))?;

        Ok(StoreConfig {
            data_dir,
            ann: AnnParams {
                threshold: self.retrieval.ann_threshold,
                ef_construction: self.retrieval.hnsw_ef_construction,
                m: self.retrieval.hnsw_m,
                ef_search: self.retrieval.hnsw_ef_search,
            },
            fusion,
            candidate_multiplier: 2,
            candidate_floor: 60,
        })
    }

    pub fn enrichment_config(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            concurrency: self.enrichment.concurrency,
            batch_size: self.enrichment.batch_size,
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            soft_limit_ratio: self.context.soft_limit_ratio,
            first_pass_keep: self.context.first_pass_keep,
            later_pass_keep: self.context.later_pass_keep,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            top_k: self.retrieval.top_k,
            broad_limit: self.retrieval.broad_limit,
            ..OrchestratorConfig::default()
        }
    }
}
