use crate::apns_sender;
use crate::classifier::{classify, Disposition};
use crate::config::Settings;
use crate::error::ServiceError;
use crate::fcm_sender::{build_fcm_message, FcmClient};
use crate::models::{Campaign, DeviceType, PushPayload, PushResult};
use crate::retry_queue::{RetryQueue, RetryTask, ScheduleResult};
use crate::store::{CampaignStore, StoreError};
use crate::token_cache::TokenCache;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one delivery attempt, after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Success,
    /// Permanent failure; the reason is recorded verbatim.
    Abort(String),
    /// Transient failure; the hint is the provider-requested minimum delay.
    Retry {
        hint: Option<Duration>,
        message: String,
    },
}

/// Seam between the engine and the provider clients. The tests swap in a
/// scripted implementation here.
#[async_trait]
pub trait ProviderSend: Send + Sync {
    async fn send(&self, campaign: &Campaign) -> SendOutcome;
}

/// Production sender: routes by device type and folds every provider failure
/// through the classifier.
pub struct PushSender {
    fcm: FcmClient,
    apns_sandbox: bool,
    apns_timeout: Duration,
    rate_limit_delay: Duration,
}

impl PushSender {
    pub fn new(settings: &Settings, tokens: Arc<TokenCache>) -> Result<Self, ServiceError> {
        Ok(Self {
            fcm: FcmClient::new(&settings.fcm, tokens)?,
            apns_sandbox: settings.apns.sandbox,
            apns_timeout: Duration::from_secs(settings.fcm.request_timeout_secs),
            rate_limit_delay: settings.retry.rate_limit_delay(),
        })
    }
}

#[async_trait]
impl ProviderSend for PushSender {
    async fn send(&self, campaign: &Campaign) -> SendOutcome {
        // Structural payload problems are permanent; retrying cannot fix them.
        let payload = match PushPayload::from_value(&campaign.payload) {
            Ok(payload) => payload,
            Err(e) => return SendOutcome::Abort(e.to_string()),
        };

        let result = match campaign.device_type {
            DeviceType::Android => {
                let message = build_fcm_message(campaign, &payload);
                self.fcm.send(campaign, &message).await
            }
            DeviceType::Ios => {
                apns_sender::send(campaign, &payload, self.apns_sandbox, self.apns_timeout).await
            }
        };

        match result {
            Ok(()) => SendOutcome::Success,
            Err(failure) => match classify(&failure, self.rate_limit_delay) {
                Disposition::Abort => SendOutcome::Abort(failure.to_string()),
                Disposition::RetryHinted(hint) => SendOutcome::Retry {
                    hint: Some(hint),
                    message: failure.to_string(),
                },
                Disposition::RetryDefault => SendOutcome::Retry {
                    hint: None,
                    message: failure.to_string(),
                },
            },
        }
    }
}

/// Drives attempts through a bounded worker pool and feeds transient failures
/// back through the retry queue until a terminal outcome is recorded.
pub struct DispatchEngine {
    provider: Arc<dyn ProviderSend>,
    store: Arc<dyn CampaignStore>,
    queue: Arc<RetryQueue>,
    permits: Arc<Semaphore>,
}

impl DispatchEngine {
    pub fn new(
        provider: Arc<dyn ProviderSend>,
        store: Arc<dyn CampaignStore>,
        queue: Arc<RetryQueue>,
        max_concurrent_sends: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            store,
            queue,
            permits: Arc::new(Semaphore::new(max_concurrent_sends)),
        })
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Starts delivery of one campaign. Returns immediately; the attempt runs
    /// on the worker pool.
    pub fn dispatch(self: &Arc<Self>, campaign: Campaign) {
        let task = self.queue.register(campaign);
        self.spawn_attempt(task);
    }

    fn spawn_attempt(self: &Arc<Self>, task: RetryTask) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match engine.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            engine.attempt(task).await;
        });
    }

    async fn attempt(&self, task: RetryTask) {
        let campaign = task.campaign.clone();
        debug!(
            campaign_guid = %campaign.campaign_guid,
            device_type = %campaign.device_type,
            retry_count = task.retry_count,
            "Attempting delivery"
        );

        match self.provider.send(&campaign).await {
            SendOutcome::Success => {
                self.queue.complete(task.id);
                info!(
                    campaign_guid = %campaign.campaign_guid,
                    retry_count = task.retry_count,
                    "Delivery succeeded"
                );
                self.record(PushResult::success(&campaign)).await;
            }
            SendOutcome::Abort(reason) => {
                self.queue.complete(task.id);
                warn!(
                    campaign_guid = %campaign.campaign_guid,
                    error = %reason,
                    "Delivery failed permanently"
                );
                self.record(PushResult::failure(&campaign, reason)).await;
            }
            SendOutcome::Retry { hint, message } => {
                match self.queue.reschedule(task, hint) {
                    ScheduleResult::Scheduled(delay) => {
                        info!(
                            campaign_guid = %campaign.campaign_guid,
                            delay_secs = delay.as_secs(),
                            error = %message,
                            "Delivery failed; retry scheduled"
                        );
                    }
                    ScheduleResult::Cancelled => {
                        self.record(
                            PushResult::failure(
                                &campaign,
                                format!("Retries cancelled: {}", message),
                            ),
                        )
                        .await;
                    }
                    ScheduleResult::QueueFull => {
                        self.record(
                            PushResult::failure(&campaign, format!("Retry queue full: {}", message)),
                        )
                        .await;
                    }
                    ScheduleResult::HorizonExceeded => {
                        self.record(
                            PushResult::failure(
                                &campaign,
                                format!("Maximum retry window exceeded: {}", message),
                            ),
                        )
                        .await;
                    }
                    ScheduleResult::Exhausted => {
                        self.record(
                            PushResult::failure(
                                &campaign,
                                format!("Maximum retries exceeded: {}", message),
                            ),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn record(&self, result: PushResult) {
        match self.store.save_push_result(&result).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                warn!(
                    campaign_guid = %result.campaign_guid,
                    "Result already recorded for this recipient"
                );
            }
            Err(e) => {
                error!(
                    campaign_guid = %result.campaign_guid,
                    error = %e,
                    "Failed to persist push result"
                );
            }
        }
    }

    /// Moves due retries back onto the worker pool. One instance runs for the
    /// lifetime of the service; ticks never overlap.
    pub async fn run_sweeper(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.queue.settings().sweep_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Retry sweeper started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Retry sweeper shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let due = self.queue.take_due();
                    if !due.is_empty() {
                        debug!(count = due.len(), "Dispatching due retries");
                    }
                    for task in due {
                        self.spawn_attempt(task);
                    }
                }
            }
        }
    }
}
