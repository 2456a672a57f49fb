//! Backend registry: lazy process-lifetime singletons per (language, mode).
//!
//! Each slot owns a `OnceCell`, so two concurrent first-requests for the
//! same language/mode race on one cell and only one pays the model-load
//! cost; every later request reuses the shared handle. A failed
//! initialization is not cached: the next request retries, which is what
//! lets a temporarily exhausted local backend recover.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::QaConfig;
use crate::language::Language;

use super::{BackendKind, GenerationBackend, LocalModelBackend, RemoteBackend};

type Slot = OnceCell<Arc<dyn GenerationBackend>>;

pub struct BackendRegistry {
    config: Arc<QaConfig>,
    slots: HashMap<(Language, BackendKind), Slot>,
}

impl BackendRegistry {
    pub fn new(config: Arc<QaConfig>) -> Self {
        let mut slots = HashMap::new();
        for language in [Language::Fr, Language::Ar] {
            for kind in [BackendKind::Local, BackendKind::Remote] {
                slots.insert((language, kind), OnceCell::new());
            }
        }
        Self { config, slots }
    }

    /// Install a pre-built backend into a slot. Used by hosts that bring
    /// their own providers and by tests; a no-op if the slot is already
    /// initialized.
    pub fn install(
        &self,
        language: Language,
        kind: BackendKind,
        backend: Arc<dyn GenerationBackend>,
    ) {
        if let Some(slot) = self.slots.get(&(language, kind)) {
            let _ = slot.set(backend);
        }
    }

    /// Get the shared handle for a (language, mode) pair, constructing it on
    /// first use.
    pub async fn acquire(
        &self,
        language: Language,
        kind: BackendKind,
    ) -> Result<Arc<dyn GenerationBackend>> {
        let slot = self
            .slots
            .get(&(language, kind))
            .ok_or_else(|| anyhow!("no backend slot for ({language}, {kind})"))?;

        slot.get_or_try_init(|| self.build(language, kind))
            .await
            .map(Arc::clone)
    }

    async fn build(
        &self,
        language: Language,
        kind: BackendKind,
    ) -> Result<Arc<dyn GenerationBackend>> {
        match kind {
            BackendKind::Local => {
                let path = self.config.profile(language).local_model_path.clone();
                let name = format!("local-{language}");
                tracing::info!(language = %language, "Initializing local generation backend");
                // GGUF loading is blocking file+mmap work
                let backend = tokio::task::spawn_blocking(move || {
                    LocalModelBackend::new(&path, name)
                })
                .await
                .map_err(|e| anyhow!("Local backend load task panicked: {}", e))??;
                Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
            }
            BackendKind::Remote => {
                tracing::info!(language = %language, "Initializing remote generation backend");
                let backend = RemoteBackend::new(&self.config.remote)?;
                Ok(Arc::new(backend) as Arc<dyn GenerationBackend>)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendInfo, GenerationParams, TokenStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GenerationBackend for CountingBackend {
        async fn stream(&self, _prompt: &str, _params: &GenerationParams) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            Ok(TokenStream::new(rx))
        }

        fn info(&self) -> BackendInfo {
            BackendInfo {
                name: "counting".into(),
                model: "test".into(),
                is_local: true,
            }
        }
    }

    #[tokio::test]
    async fn installed_backend_is_shared_across_acquires() {
        let registry = BackendRegistry::new(Arc::new(QaConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        registry.install(
            Language::Fr,
            BackendKind::Local,
            Arc::new(CountingBackend {
                calls: calls.clone(),
            }),
        );

        let a = registry.acquire(Language::Fr, BackendKind::Local).await.unwrap();
        let b = registry.acquire(Language::Fr, BackendKind::Local).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn slots_are_independent_per_language_and_kind() {
        let registry = BackendRegistry::new(Arc::new(QaConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        registry.install(
            Language::Fr,
            BackendKind::Local,
            Arc::new(CountingBackend {
                calls: calls.clone(),
            }),
        );
        registry.install(
            Language::Ar,
            BackendKind::Local,
            Arc::new(CountingBackend {
                calls: calls.clone(),
            }),
        );

        let fr = registry.acquire(Language::Fr, BackendKind::Local).await.unwrap();
        let ar = registry.acquire(Language::Ar, BackendKind::Local).await.unwrap();
        assert!(!Arc::ptr_eq(&fr, &ar));
    }

    #[tokio::test]
    async fn missing_local_model_surfaces_error() {
        let mut config = QaConfig::default();
        config.french.local_model_path = std::path::PathBuf::from("/nonexistent/model.gguf");
        let registry = BackendRegistry::new(Arc::new(config));

        let result = registry.acquire(Language::Fr, BackendKind::Local).await;
        assert!(result.is_err());
    }
}
