use crate::config::Settings;
use crate::dispatcher::{DispatchEngine, ProviderSend, PushSender};
use crate::error::ServiceError;
use crate::retry_queue::RetryQueue;
use crate::store::{CampaignStore, MemoryStore};
use crate::token_cache::{OauthExchanger, TokenCache};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared handles for the HTTP surface and the ingest loop.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn CampaignStore>,
    pub engine: Arc<DispatchEngine>,
    pub ingest_tx: mpsc::Sender<Vec<u8>>,
}

impl AppState {
    /// Wires the default production stack and returns the receiving end of
    /// the ingest channel for the consumer loop.
    pub fn new(settings: Settings) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>), ServiceError> {
        let request_timeout = std::time::Duration::from_secs(settings.fcm.request_timeout_secs);
        let tokens = Arc::new(TokenCache::new(
            Arc::new(OauthExchanger::new(request_timeout)?),
            settings.fcm.oauth_scope.clone(),
            std::time::Duration::from_secs(settings.fcm.token_safety_margin_secs),
        ));
        let provider: Arc<dyn ProviderSend> = Arc::new(PushSender::new(&settings, tokens)?);
        Self::with_provider(settings, provider, Arc::new(MemoryStore::new()))
    }

    /// Same wiring with the provider and store injected; the tests use this.
    pub fn with_provider(
        settings: Settings,
        provider: Arc<dyn ProviderSend>,
        store: Arc<dyn CampaignStore>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>), ServiceError> {
        let queue = Arc::new(RetryQueue::new(settings.retry));
        let engine = DispatchEngine::new(
            provider,
            store.clone(),
            queue,
            settings.dispatch.max_concurrent_sends,
        );
        let (ingest_tx, ingest_rx) = mpsc::channel(settings.dispatch.ingest_channel_capacity);

        Ok((
            Arc::new(Self {
                settings,
                store,
                engine,
                ingest_tx,
            }),
            ingest_rx,
        ))
    }
}
