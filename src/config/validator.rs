use crate::config::Config;
use crate::error::{Result, SkemaError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every failure
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_enrichment(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_context(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SkemaError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.llm.base_url.is_empty() {
            errors.push(ValidationError::new(
                "llm.base_url",
                "Base URL cannot be empty",
            ));
        }

        if config.llm.model.is_empty() {
            errors.push(ValidationError::new(
                "llm.model",
                "Model name cannot be empty",
            ));
        }

        let temp = config.llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        if config.llm.fallback_context_length == 0 {
            errors.push(ValidationError::new(
                "llm.fallback_context_length",
                "Fallback context length must be greater than 0",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.base_url.is_empty() {
            errors.push(ValidationError::new(
                "embedding.base_url",
                "Base URL cannot be empty",
            ));
        }

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Vector dimension must be greater than 0",
            ));
        }
    }

    fn validate_enrichment(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.enrichment.concurrency == 0 {
            errors.push(ValidationError::new(
                "enrichment.concurrency",
                "Concurrency must be greater than 0",
            ));
        }

        if config.enrichment.batch_size == 0 {
            errors.push(ValidationError::new(
                "enrichment.batch_size",
                "Batch size must be greater than 0",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.retrieval.top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                "top_k must be greater than 0",
            ));
        }

        if config.retrieval.rrf_k <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                format!("rrf_k must be positive, got {}", config.retrieval.rrf_k),
            ));
        }

        if config.retrieval.semantic_weight <= 0.0 || config.retrieval.keyword_weight <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.weights",
                "Fusion weights must be positive",
            ));
        }

        if config.retrieval.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "retrieval.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.retrieval.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "retrieval.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }
    }

    fn validate_context(config: &Config, errors: &mut Vec<ValidationError>) {
        let ratio = config.context.soft_limit_ratio;
        if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
            errors.push(ValidationError::new(
                "context.soft_limit_ratio",
                format!("Soft limit ratio must be in (0.0, 1.0], got {}", ratio),
            ));
        }

        if config.context.first_pass_keep < config.context.later_pass_keep {
            errors.push(ValidationError::new(
                "context.first_pass_keep",
                "First-pass retained turns must be at least the later-pass count",
            ));
        }
    }
}
