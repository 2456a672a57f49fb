//! Local GGUF inference via llama.cpp.
//!
//! The decode loop is synchronous and CPU-bound, so it runs inside
//! `spawn_blocking` and streams tokens back over an mpsc channel. A context
//! is created per inference call; the loaded model itself is read-only and
//! shared across concurrent requests.

use anyhow::{anyhow, Context as AnyhowContext, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::sampling::LlamaSampler;

use super::{BackendInfo, GenerationBackend, GenerationParams, TokenStream};

// Markers that indicate the model has run past its answer and started
// echoing the template (French and Arabic question labels).
const STOP_MARKERS: &[&str] = &["\nQuestion:", "\nالسؤال:"];

struct SharedBackend(Arc<LlamaBackend>);

// SAFETY: llama.cpp backend state is process-global and read-only after init.
unsafe impl Send for SharedBackend {}
unsafe impl Sync for SharedBackend {}

static SHARED_BACKEND: std::sync::OnceLock<SharedBackend> = std::sync::OnceLock::new();
static BACKEND_INIT: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// llama.cpp allows exactly one backend initialization per process; every
/// loaded model shares it.
fn shared_backend() -> Result<Arc<LlamaBackend>> {
    let _guard = BACKEND_INIT.lock();
    if let Some(shared) = SHARED_BACKEND.get() {
        return Ok(shared.0.clone());
    }
    let backend = LlamaBackend::init().context("Failed to initialize llama.cpp backend")?;
    let backend = Arc::new(backend);
    let _ = SHARED_BACKEND.set(SharedBackend(backend.clone()));
    Ok(backend)
}

pub struct LocalModelBackend {
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
    name: String,
}

// SAFETY: LlamaModel and LlamaBackend are thread-safe for read-only use.
// Mutable state (LlamaContext) is created per-inference call and not shared.
unsafe impl Send for LocalModelBackend {}
unsafe impl Sync for LocalModelBackend {}

impl LocalModelBackend {
    pub fn new(model_path: &Path, name: impl Into<String>) -> Result<Self> {
        let backend = shared_backend()?;

        if !model_path.exists() {
            return Err(anyhow!(
                "GGUF model file not found at {}",
                model_path.display()
            ));
        }

        let model_params = LlamaModelParams::default();
        let model = LlamaModel::load_from_file(&backend, model_path, &model_params)
            .map_err(|e| anyhow!("Failed to load GGUF model from {}: {:?}", model_path.display(), e))?;

        let name = name.into();
        tracing::info!(
            model = %name,
            path = %model_path.display(),
            "llama.cpp model loaded"
        );

        Ok(Self {
            model: Arc::new(model),
            backend,
            name,
        })
    }

    /// Synchronous decode loop. Tokens are pushed through `sender` as they
    /// are produced; the accumulated text is also returned.
    fn run_inference(
        model: &LlamaModel,
        backend: &LlamaBackend,
        prompt: &str,
        params: &GenerationParams,
        sender: &mpsc::Sender<Result<String>>,
    ) -> Result<String> {
        let n_ctx = 4096u32;
        let ctx_params = LlamaContextParams::default().with_n_ctx(std::num::NonZeroU32::new(n_ctx));
        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| anyhow!("Failed to create llama context: {:?}", e))?;

        let tokens = model
            .str_to_token(prompt, llama_cpp_2::model::AddBos::Always)
            .map_err(|e| anyhow!("Tokenization failed: {:?}", e))?;

        let n_prompt = tokens.len();
        if n_prompt == 0 {
            return Ok(String::new());
        }

        // Keep room in the context window for the requested output
        let max_prompt_tokens = (n_ctx as usize).saturating_sub(params.max_tokens.min(2048));
        let tokens = if n_prompt > max_prompt_tokens {
            tracing::warn!(
                n_prompt = n_prompt,
                max = max_prompt_tokens,
                "Prompt truncated to fit context window"
            );
            tokens[n_prompt - max_prompt_tokens..].to_vec()
        } else {
            tokens
        };
        let n_prompt = tokens.len();

        // Feed prompt tokens in chunks of n_batch to stay under llama.cpp's
        // per-decode limit.
        let n_batch = 2048usize;
        let mut batch = LlamaBatch::new(n_batch, 1);

        let mut processed = 0usize;
        while processed < n_prompt {
            batch.clear();
            let chunk_end = (processed + n_batch).min(n_prompt);
            for i in processed..chunk_end {
                let is_last = i == n_prompt - 1;
                batch
                    .add(tokens[i], i as i32, &[0], is_last)
                    .map_err(|_| anyhow!("Failed to add token to batch"))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| anyhow!("Prompt decode chunk {}-{} failed: {:?}", processed, chunk_end, e))?;
            processed = chunk_end;
        }

        // temperature == 0 selects greedy decoding so deterministic configs
        // yield identical output across runs.
        let mut sampler = if params.temperature <= 0.0 {
            LlamaSampler::chain_simple([LlamaSampler::greedy()])
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::penalties(64, 1.1, 0.0, 0.0),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(0),
            ])
        };

        let max_tokens = params.max_tokens.min(2048);
        let mut output = String::new();
        let mut n_decoded = 0usize;
        let mut cur_pos = n_prompt as i32;
        let eos_token = model.token_eos();

        loop {
            if n_decoded >= max_tokens {
                break;
            }

            let new_token = sampler.sample(&ctx, -1);
            if new_token == eos_token {
                break;
            }

            #[allow(deprecated)]
            let token_str = model
                .token_to_str(new_token, llama_cpp_2::model::Special::Tokenize)
                .unwrap_or_default();

            if !token_str.is_empty() {
                output.push_str(&token_str);
                if sender.blocking_send(Ok(token_str)).is_err() {
                    // Receiver dropped, stop generation
                    break;
                }
            }

            let hit_marker = STOP_MARKERS.iter().any(|marker| output.ends_with(marker));
            if hit_marker {
                for marker in STOP_MARKERS {
                    if output.ends_with(marker) {
                        output.truncate(output.len() - marker.len());
                        break;
                    }
                }
                break;
            }

            n_decoded += 1;

            batch.clear();
            batch
                .add(new_token, cur_pos, &[0], true)
                .map_err(|_| anyhow!("Failed to add generated token to batch"))?;
            cur_pos += 1;

            ctx.decode(&mut batch)
                .map_err(|e| anyhow!("Decode step {} failed: {:?}", n_decoded, e))?;
        }

        tracing::debug!(
            prompt_tokens = n_prompt,
            generated_tokens = n_decoded,
            "llama.cpp inference complete"
        );

        Ok(output)
    }
}

#[async_trait]
impl GenerationBackend for LocalModelBackend {
    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TokenStream> {
        let model = Arc::clone(&self.model);
        let backend = Arc::clone(&self.backend);
        let prompt = prompt.to_string();
        let params = *params;

        let (tx, rx) = mpsc::channel::<Result<String>>(256);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = Self::run_inference(&model, &backend, &prompt, &params, &tx) {
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(TokenStream::new(rx))
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "llama.cpp".to_string(),
            model: self.name.clone(),
            is_local: true,
        }
    }
}
