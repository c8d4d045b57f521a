use std::sync::Arc;

use crate::config::Config;
use crate::llm_client::ChatModel;
use crate::pipeline::events::EventDispatcher;
use crate::pipeline::store::VideoStore;
use crate::retrieval::EmbeddingProvider;
use crate::upload::handlers::UploadRegistry;
use crate::upload::UploadTransport;

/// Shared application state injected into all route handlers via Axum extractors.
/// Every external collaborator sits behind a trait object so tests can swap fakes in.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VideoStore>,
    pub dispatcher: Arc<dyn EventDispatcher>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub llm: Arc<dyn ChatModel>,
    /// Object storage used for imports and to verify confirmed uploads.
    pub transport: Arc<dyn UploadTransport>,
    pub upload_jobs: UploadRegistry,
    pub config: Config,
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::llm_client::fake::FakeChatModel;
    use crate::pipeline::store::memory::InMemoryVideoStore;
    use crate::pipeline::test_support::RecordingDispatcher;
    use crate::retrieval::embeddings::fake::FakeEmbedder;
    use crate::upload::transport::memory::MemoryTransport;

    /// Handles on the fakes behind a test `AppState`.
    pub struct TestApp {
        pub state: AppState,
        pub store: Arc<InMemoryVideoStore>,
        pub dispatcher: Arc<RecordingDispatcher>,
        pub transport: Arc<MemoryTransport>,
    }

    pub fn test_app() -> TestApp {
        let store = Arc::new(InMemoryVideoStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let transport = Arc::new(MemoryTransport::default());
        let state = AppState {
            store: store.clone(),
            dispatcher: dispatcher.clone(),
            embedder: Arc::new(FakeEmbedder::new(2)),
            llm: Arc::new(FakeChatModel::replying("From the transcript: yes.")),
            transport: transport.clone(),
            upload_jobs: UploadRegistry::default(),
            config: Config::for_tests(),
        };
        TestApp {
            state,
            store,
            dispatcher,
            transport,
        }
    }
}
