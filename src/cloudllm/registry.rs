//! A small runtime registry so a failover-aware caller can select a provider by name (§2
//! "Routing/registry", §4.8 "SUPPLEMENT").
//!
//! The core never imports a CLI or config-loading crate (§1): callers construct providers
//! themselves and `register` them here, then look them up by [`CompletionProvider::name`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::cloudllm::provider::{CompletionProvider, Model};

/// Holds `Arc<dyn CompletionProvider>` values keyed by their stable name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Register (or replace) a provider under its own `name()`.
    pub fn register(&mut self, provider: Arc<dyn CompletionProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.get(name).cloned()
    }

    /// All registered provider names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// The models a named provider exposes, or `None` if that provider isn't registered.
    pub fn models_for(&self, name: &str) -> Option<Vec<Model>> {
        self.get(name).map(|p| p.models())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::completion::{CompletionChunk, CompletionRequest};
    use crate::cloudllm::error::ProviderError;
    use crate::cloudllm::provider::ChunkStream;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct StubProvider(&'static str);

    #[async_trait]
    impl CompletionProvider for StubProvider {
        fn name(&self) -> &str {
            self.0
        }

        fn models(&self) -> Vec<Model> {
            vec![Model {
                id: "stub-model".into(),
                name: "Stub Model".into(),
                context_size: 8192,
                supports_vision: false,
            }]
        }

        fn supports_tools(&self) -> bool {
            false
        }

        async fn complete(
            &self,
            _cancel: CancellationToken,
            _request: CompletionRequest,
        ) -> Result<ChunkStream, ProviderError> {
            let stream = futures_util::stream::iter(vec![CompletionChunk::Done { usage: Default::default() }]);
            Ok(Box::pin(stream))
        }
    }

    #[test]
    fn register_and_lookup_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider("anthropic")));
        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("openai").is_none());
        assert_eq!(registry.models_for("anthropic").unwrap().len(), 1);
    }

    #[test]
    fn names_lists_every_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider("anthropic")));
        registry.register(Arc::new(StubProvider("openai")));
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["anthropic".to_string(), "openai".to_string()]);
    }
}
