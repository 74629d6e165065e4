use crate::models::{Campaign, CampaignType, DeviceType, PushResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Uniqueness violation on `(campaign_guid, token)`.
    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Narrow persistence contract for campaigns and their delivery outcomes.
/// The durable backend lives outside this service; the engine only relies on
/// save/query plus the uniqueness constraint on `(campaign_guid, token)`.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;

    /// Records one terminal delivery outcome. Unique per `(campaign_guid, token)`.
    async fn save_push_result(&self, result: &PushResult) -> Result<(), StoreError>;

    async fn campaigns_by_guid(
        &self,
        campaign_guid: &str,
        device_type: Option<DeviceType>,
        campaign_type: Option<CampaignType>,
    ) -> Result<Vec<Campaign>, StoreError>;

    async fn results_by_guid(&self, campaign_guid: &str) -> Result<Vec<PushResult>, StoreError>;
}

/// In-memory store used by the binary's default wiring and the tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    campaigns: Vec<Campaign>,
    campaign_keys: HashSet<(String, String)>,
    results: HashMap<(String, String), PushResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let key = (campaign.campaign_guid.clone(), campaign.token.clone());
        if !inner.campaign_keys.insert(key) {
            return Err(StoreError::Duplicate("campaign"));
        }
        inner.campaigns.push(campaign.clone());
        Ok(())
    }

    async fn save_push_result(&self, result: &PushResult) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let key = (result.campaign_guid.clone(), result.token.clone());
        if inner.results.contains_key(&key) {
            return Err(StoreError::Duplicate("push result"));
        }
        inner.results.insert(key, result.clone());
        Ok(())
    }

    async fn campaigns_by_guid(
        &self,
        campaign_guid: &str,
        device_type: Option<DeviceType>,
        campaign_type: Option<CampaignType>,
    ) -> Result<Vec<Campaign>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(inner
            .campaigns
            .iter()
            .filter(|c| c.campaign_guid == campaign_guid)
            .filter(|c| device_type.map_or(true, |d| c.device_type == d))
            .filter(|c| campaign_type.map_or(true, |t| c.campaign_type == t))
            .cloned()
            .collect())
    }

    async fn results_by_guid(&self, campaign_guid: &str) -> Result<Vec<PushResult>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(inner
            .results
            .values()
            .filter(|r| r.campaign_guid == campaign_guid)
            .cloned()
            .collect())
    }
}
