use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::language::Language;

/// Top-level configuration consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    pub top_k_retrieval: usize,
    pub use_local_generation: bool,
    pub generation_timeout_seconds: f64,
    pub retrieval_timeout_seconds: f64,
    /// Language used when script detection cannot decide.
    pub fallback_language: Language,
    pub french: LanguageProfile,
    pub arabic: LanguageProfile,
    pub multilingual: MultilingualFallback,
    pub remote: RemoteConfig,
}

/// Per-language resources: embedding model, index files, local generation
/// model, and generation parameters. The two languages carry independent
/// token budgets and temperatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub embed_model_dir: PathBuf,
    pub index_path: PathBuf,
    pub docs_path: PathBuf,
    pub local_model_path: PathBuf,
    /// Optional prompt template override; the built-in template is used when
    /// absent or unreadable.
    pub template_path: Option<PathBuf>,
    pub max_output_tokens: usize,
    pub temperature: f32,
}

/// Shared multilingual embedder + index used when a language-specific
/// retrieval triple fails to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilingualFallback {
    pub embed_model_dir: PathBuf,
    pub index_path: PathBuf,
    pub docs_path: PathBuf,
}

/// Remote OpenAI-compatible chat-completions endpoint (OpenRouter by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl QaConfig {
    pub fn profile(&self, language: Language) -> &LanguageProfile {
        match language {
            Language::Fr => &self.french,
            Language::Ar => &self.arabic,
        }
    }

    /// Validate config values, returning errors for clearly broken
    /// configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.top_k_retrieval == 0 {
            return Err("top_k_retrieval must be > 0".into());
        }
        if self.generation_timeout_seconds <= 0.0 {
            return Err("generation_timeout_seconds must be > 0".into());
        }
        if self.retrieval_timeout_seconds <= 0.0 {
            return Err("retrieval_timeout_seconds must be > 0".into());
        }
        for (name, profile) in [("french", &self.french), ("arabic", &self.arabic)] {
            if profile.max_output_tokens == 0 {
                return Err(format!("{name}.max_output_tokens must be > 0"));
            }
            if !(0.0..=2.0).contains(&profile.temperature) {
                return Err(format!("{name}.temperature must be in [0.0, 2.0]"));
            }
        }
        if self.remote.endpoint.is_empty() {
            return Err("remote.endpoint must not be empty".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for QaConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qanun");
        let models = data_dir.join("models");
        let indices = data_dir.join("indices");

        Self {
            top_k_retrieval: 3,
            use_local_generation: false,
            generation_timeout_seconds: 120.0,
            retrieval_timeout_seconds: 10.0,
            fallback_language: Language::Fr,
            french: LanguageProfile {
                embed_model_dir: models.join("sentence-camembert-large"),
                index_path: indices.join("fr.index.json"),
                docs_path: indices.join("fr.docs.json"),
                local_model_path: models.join("vigogne-2-7b-instruct.Q4_K_M.gguf"),
                template_path: None,
                max_output_tokens: 512,
                temperature: 0.2,
            },
            arabic: LanguageProfile {
                embed_model_dir: models.join("paraphrase-multilingual-minilm-l12-v2"),
                index_path: indices.join("ar.index.json"),
                docs_path: indices.join("ar.docs.json"),
                local_model_path: models.join("qwen2.5-7b-instruct-q4_k_m.gguf"),
                template_path: None,
                max_output_tokens: 600,
                temperature: 0.2,
            },
            multilingual: MultilingualFallback {
                embed_model_dir: models.join("paraphrase-multilingual-minilm-l12-v2"),
                index_path: indices.join("multi.index.json"),
                docs_path: indices.join("multi.docs.json"),
            },
            remote: RemoteConfig {
                endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                api_key: String::new(),
                model: "mistralai/mistral-7b-instruct".to_string(),
            },
        }
    }
}
