use std::sync::Arc;

use dashmap::DashMap;
use tern_agents::{ChatOrchestrator, LlmProvider, OpenAiProvider, ProviderFactory};
use tern_config::AppConfig;
use tern_db::{ChatStore, MemoryStore};
use tokio::sync::Mutex;

/// Upper bound on cached provider clients. Hitting it simply drops the
/// cache; clients are cheap to rebuild.
const PROVIDER_CACHE_CAP: usize = 32;

/// Shared gateway state: configuration, store handles and the provider
/// client cache.
pub struct AppState {
    pub config: AppConfig,
    pub chat: Arc<Mutex<ChatStore>>,
    pub memory: Arc<Mutex<MemoryStore>>,
    pub http: reqwest::Client,
    providers: Arc<ProviderCache>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig, chat: ChatStore, memory: MemoryStore) -> Self {
        let providers = Arc::new(ProviderCache {
            base_url: config.providers.chat_base_url.clone(),
            clients: DashMap::new(),
        });
        Self {
            config,
            chat: Arc::new(Mutex::new(chat)),
            memory: Arc::new(Mutex::new(memory)),
            http: reqwest::Client::new(),
            providers,
        }
    }

    /// Assemble the per-request orchestration pipeline.
    pub fn orchestrator(&self) -> ChatOrchestrator {
        ChatOrchestrator::new(
            Arc::clone(&self.chat),
            Arc::clone(&self.memory),
            Arc::clone(&self.providers) as Arc<dyn ProviderFactory>,
            self.http.clone(),
            self.config.providers.clone(),
            self.config.limits,
        )
    }
}

/// Capacity-bounded cache of provider clients keyed by credential. Replaces
/// a process-wide singleton: each distinct key gets its own short-lived
/// client value.
struct ProviderCache {
    base_url: String,
    clients: DashMap<String, Arc<OpenAiProvider>>,
}

impl ProviderFactory for ProviderCache {
    fn provider(&self, api_key: &str) -> Arc<dyn LlmProvider> {
        if let Some(provider) = self.clients.get(api_key) {
            return Arc::clone(provider.value()) as Arc<dyn LlmProvider>;
        }

        if self.clients.len() >= PROVIDER_CACHE_CAP {
            self.clients.clear();
        }

        let provider = Arc::new(OpenAiProvider::new(
            api_key.to_string(),
            Some(self.base_url.clone()),
        ));
        self.clients.insert(api_key.to_string(), Arc::clone(&provider));
        provider
    }
}
