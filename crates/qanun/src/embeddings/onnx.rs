//! ONNX sentence encoder.
//!
//! Runs exported sentence-transformer models (CamemBERT for French, MiniLM
//! for Arabic and the multilingual fallback) through ONNX Runtime with mean
//! pooling and L2 normalization. Sessions take `&mut self` to run, so each
//! encoder serializes inference behind a mutex; callers share the encoder
//! through an `Arc` and queue on that lock.

use anyhow::{anyhow, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::EmbeddingModel;

#[derive(Debug, Clone)]
pub struct OnnxEncoderConfig {
    pub model_dir: PathBuf,
    pub dimension: usize,
    pub max_length: usize,
    pub normalize: bool,
}

impl OnnxEncoderConfig {
    /// Standard layout: `model.onnx` + `tokenizer.json` inside the model dir.
    pub fn from_model_dir(model_dir: &Path, dimension: usize) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            dimension,
            max_length: 512,
            normalize: true,
        }
    }
}

pub struct OnnxEncoder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    config: OnnxEncoderConfig,
    cache: Arc<RwLock<lru::LruCache<u64, Vec<f32>>>>,
}

impl OnnxEncoder {
    pub fn new(config: OnnxEncoderConfig) -> Result<Self> {
        ort::init().with_name("qanun_embeddings").commit();

        let model_path = config.model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(anyhow!(
                "Model file not found at: {}",
                model_path.display()
            ));
        }

        let model_bytes = std::fs::read(&model_path)
            .map_err(|e| anyhow!("Failed to read model: {:?}", e))?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Optimization level: {:?}", e))?
            .with_intra_threads(num_threads)
            .map_err(|e| anyhow!("Intra threads: {:?}", e))?
            .with_inter_threads(1)
            .map_err(|e| anyhow!("Inter threads: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load model: {:?}", e))?;

        let tokenizer_path = config.model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;

        tracing::info!(
            model = %model_path.display(),
            dimension = config.dimension,
            "ONNX sentence encoder loaded"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            config,
            cache: Arc::new(RwLock::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(1000).expect("cache capacity is nonzero"),
            ))),
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let cache_key = hasher.finish();
        if let Some(cached) = self.cache.write().get(&cache_key) {
            return Ok(cached.clone());
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        let mut token_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if token_ids.len() > self.config.max_length {
            token_ids.truncate(self.config.max_length);
        }

        let seq_len = token_ids.len();
        let mut ids_vec = Vec::with_capacity(seq_len);
        let mut mask_vec = Vec::with_capacity(seq_len);
        for id in token_ids {
            ids_vec.push(id);
            mask_vec.push(1i64);
        }

        let shape = vec![1, seq_len];
        let input_ids = Value::from_array((shape.clone(), ids_vec))
            .map_err(|e| anyhow!("input_ids tensor: {:?}", e))?;
        let attention_mask = Value::from_array((shape, mask_vec.clone()))
            .map_err(|e| anyhow!("attention_mask tensor: {:?}", e))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("Inference failed: {:?}", e))?;

        let embedding = self.pool_output(&outputs, &mask_vec)?;
        drop(session);

        self.cache.write().put(cache_key, embedding.clone());
        Ok(embedding)
    }

    /// Mean-pool `last_hidden_state` over the attention mask. Models exported
    /// with a pooling head expose `sentence_embedding` instead; prefer it.
    fn pool_output(
        &self,
        outputs: &ort::session::SessionOutputs,
        attention_mask: &[i64],
    ) -> Result<Vec<f32>> {
        let has_pooled = outputs
            .iter()
            .any(|(name, _)| name == "sentence_embedding");
        if has_pooled {
            if let Ok((shape, data)) = outputs["sentence_embedding"].try_extract_tensor::<f32>() {
                if shape.len() == 2 {
                    return self.normalize_vec(data.to_vec());
                }
            }
        }

        let (shape, data) = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to extract last_hidden_state: {:?}", e))?;

        let seq_len = shape[1] as usize;
        let hidden_dim = shape[2] as usize;

        let mut pooled = vec![0.0f32; hidden_dim];
        let mut mask_sum = 0.0f32;
        for pos in 0..seq_len {
            let mask_val = if pos < attention_mask.len() {
                attention_mask[pos] as f32
            } else {
                0.0
            };
            if mask_val > 0.0 {
                mask_sum += mask_val;
                let offset = pos * hidden_dim;
                for dim in 0..hidden_dim {
                    pooled[dim] += data[offset + dim] * mask_val;
                }
            }
        }
        if mask_sum > 0.0 {
            for value in &mut pooled {
                *value /= mask_sum;
            }
        }

        self.normalize_vec(pooled)
    }

    fn normalize_vec(&self, mut vec: Vec<f32>) -> Result<Vec<f32>> {
        if self.config.normalize {
            let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 1e-12 {
                for v in &mut vec {
                    *v /= norm;
                }
            }
        }
        Ok(vec)
    }
}

impl EmbeddingModel for OnnxEncoder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
