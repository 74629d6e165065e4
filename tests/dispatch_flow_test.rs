//! End-to-end engine flows with a scripted provider: first-try success,
//! backoff-driven redelivery, rate-limit hints, permanent failures, and
//! retry exhaustion.

use async_trait::async_trait;
use campaign_push_service::config::RetrySettings;
use campaign_push_service::dispatcher::{DispatchEngine, ProviderSend, SendOutcome};
use campaign_push_service::models::{
    Campaign, CampaignType, DeviceType, PushResult,
};
use campaign_push_service::retry_queue::RetryQueue;
use campaign_push_service::store::{CampaignStore, MemoryStore};
use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct RecordingProvider {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    calls: Mutex<Vec<Instant>>,
}

impl RecordingProvider {
    fn new(outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderSend for RecordingProvider {
    async fn send(&self, _campaign: &Campaign) -> SendOutcome {
        self.calls.lock().unwrap().push(Instant::now());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Success)
    }
}

fn retry_503() -> SendOutcome {
    SendOutcome::Retry {
        hint: None,
        message: "HTTP 503: unavailable".to_string(),
    }
}

fn settings() -> RetrySettings {
    RetrySettings {
        jitter_range: 0.0,
        ..RetrySettings::default()
    }
}

struct Harness {
    engine: Arc<DispatchEngine>,
    store: Arc<MemoryStore>,
    token: CancellationToken,
}

fn start(provider: Arc<dyn ProviderSend>, cfg: RetrySettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(RetryQueue::new(cfg));
    let engine = DispatchEngine::new(provider, store.clone(), queue, 8);

    let token = CancellationToken::new();
    tokio::spawn(Arc::clone(&engine).run_sweeper(token.clone()));

    Harness {
        engine,
        store,
        token,
    }
}

fn campaign(guid: &str) -> Campaign {
    Campaign {
        campaign_guid: guid.to_string(),
        token: "device-token".to_string(),
        device_type: DeviceType::Android,
        campaign_type: CampaignType::Push,
        credentials: Default::default(),
        payload: json!({}),
        processed_at: Utc::now(),
    }
}

async fn wait_for_result(store: &MemoryStore, guid: &str) -> Vec<PushResult> {
    tokio::time::timeout(Duration::from_secs(7200), async {
        loop {
            let results = store.results_by_guid(guid).await.unwrap();
            if !results.is_empty() {
                return results;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("timed out waiting for a recorded result")
}

#[tokio::test(start_paused = true)]
async fn first_try_success_records_one_result() {
    let provider = RecordingProvider::new(vec![SendOutcome::Success]);
    let h = start(provider.clone(), settings());

    h.engine.dispatch(campaign("g1"));
    let results = wait_for_result(&h.store, "g1").await;

    assert_eq!(results.len(), 1);
    assert!(results[0].was_success);
    assert_eq!(provider.call_instants().len(), 1);
    h.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_on_the_backoff_curve() {
    let provider =
        RecordingProvider::new(vec![retry_503(), retry_503(), SendOutcome::Success]);
    let h = start(provider.clone(), settings());

    h.engine.dispatch(campaign("g1"));
    let results = wait_for_result(&h.store, "g1").await;
    assert!(results[0].was_success);

    // 10s then 20s delays, plus up to one sweep interval of slack each.
    let calls = provider.call_instants();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1] - calls[0];
    let second_gap = calls[2] - calls[1];
    assert!(first_gap >= Duration::from_secs(10), "gap {:?}", first_gap);
    assert!(first_gap <= Duration::from_secs(12), "gap {:?}", first_gap);
    assert!(second_gap >= Duration::from_secs(20), "gap {:?}", second_gap);
    assert!(second_gap <= Duration::from_secs(22), "gap {:?}", second_gap);
    h.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn rate_limit_hint_postpones_the_retry() {
    let provider = RecordingProvider::new(vec![
        SendOutcome::Retry {
            hint: Some(Duration::from_secs(45)),
            message: "HTTP 429: rate limited".to_string(),
        },
        SendOutcome::Success,
    ]);
    let h = start(provider.clone(), settings());

    h.engine.dispatch(campaign("g1"));
    let results = wait_for_result(&h.store, "g1").await;
    assert!(results[0].was_success);

    let calls = provider.call_instants();
    assert_eq!(calls.len(), 2);
    let gap = calls[1] - calls[0];
    assert!(gap >= Duration::from_secs(45), "gap {:?}", gap);
    assert!(gap <= Duration::from_secs(47), "gap {:?}", gap);
    h.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_records_without_a_second_attempt() {
    let provider = RecordingProvider::new(vec![SendOutcome::Abort(
        "UNREGISTERED - Token is not registered/invalid".to_string(),
    )]);
    let h = start(provider.clone(), settings());

    h.engine.dispatch(campaign("g1"));
    let results = wait_for_result(&h.store, "g1").await;

    assert!(!results[0].was_success);
    assert!(results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("UNREGISTERED"));
    assert_eq!(provider.call_instants().len(), 1);
    h.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_in_a_terminal_failure() {
    let mut cfg = settings();
    cfg.max_retries = 2;
    // Always transient; the engine must give up on its own.
    let provider = RecordingProvider::new(vec![retry_503(); 10]);
    let h = start(provider.clone(), cfg);

    h.engine.dispatch(campaign("g1"));
    let results = wait_for_result(&h.store, "g1").await;

    assert!(!results[0].was_success);
    assert!(results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Maximum retries exceeded"));
    // Initial attempt plus max_retries redeliveries.
    assert_eq!(provider.call_instants().len(), 3);
    assert_eq!(h.engine.queue().pending_len(), 0);
    h.token.cancel();
}
