use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Platforms a campaign can target. Serialized lowercase on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Android,
    Ios,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Android => "android",
            DeviceType::Ios => "ios",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only `push` campaigns drive dispatch; `in_app` and `feed` are persisted
/// for the downstream surfaces but never sent from here.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Push,
    InApp,
    Feed,
}

/// Provider credentials as they arrive on the wire. For android the
/// `certificate` field carries the service-account JSON (object or string);
/// for ios it carries a base64-encoded PKCS#12 bundle.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CampaignCredentials {
    pub certificate: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_password: Option<String>,
}

/// One delivery target derived from one inbound broker message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Campaign {
    pub campaign_guid: String,
    pub token: String,
    pub device_type: DeviceType,
    pub campaign_type: CampaignType,
    pub credentials: CampaignCredentials,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushAction {
    Deeplink,
    Url,
    OpenApp,
}

impl PushAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushAction::Deeplink => "deeplink",
            PushAction::Url => "url",
            PushAction::OpenApp => "open_app",
        }
    }

    /// Actions that carry a target URL into the outbound message.
    pub fn carries_url(&self) -> bool {
        matches!(self, PushAction::Deeplink | PushAction::Url)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    Deeplink,
    Url,
    OpenApp,
    Dismiss,
}

impl ButtonAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonAction::Deeplink => "deeplink",
            ButtonAction::Url => "url",
            ButtonAction::OpenApp => "open_app",
            ButtonAction::Dismiss => "dismiss",
        }
    }

    pub fn carries_url(&self) -> bool {
        matches!(self, ButtonAction::Deeplink | ButtonAction::Url)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PushButton {
    #[serde(rename = "buttonPosition")]
    pub position: i64,
    #[serde(rename = "buttonLabel")]
    pub label: String,
    #[serde(rename = "buttonAction")]
    pub action: ButtonAction,
    #[serde(rename = "button_action_url", skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

/// Validated payload of a `push` campaign. Deep URL/deeplink format checks
/// happen upstream; this only enforces the structural contract.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PushPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_title: Option<String>,
    pub push_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_sub_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_rich_media: Option<String>,
    pub push_action: PushAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_action_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_buttons: Option<Vec<PushButton>>,
}

impl PushPayload {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ServiceError> {
        let payload: PushPayload = serde_json::from_value(value.clone())
            .map_err(|e| ServiceError::Validation(format!("invalid push payload: {}", e)))?;

        if payload.push_action.carries_url() && payload.push_action_url.is_none() {
            return Err(ServiceError::Validation(format!(
                "push_action_url is required when push_action is {}",
                payload.push_action.as_str()
            )));
        }

        Ok(payload)
    }

    /// Buttons sorted by their explicit position, regardless of wire order.
    pub fn sorted_buttons(&self) -> Vec<PushButton> {
        let mut buttons = self.push_buttons.clone().unwrap_or_default();
        buttons.sort_by_key(|b| b.position);
        buttons
    }
}

/// One terminal delivery outcome per `(campaign_guid, token)`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PushResult {
    pub campaign_guid: String,
    pub token: String,
    pub platform: DeviceType,
    pub was_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl PushResult {
    pub fn success(campaign: &Campaign) -> Self {
        Self {
            campaign_guid: campaign.campaign_guid.clone(),
            token: campaign.token.clone(),
            platform: campaign.device_type,
            was_success: true,
            error: None,
            processed_at: Utc::now(),
        }
    }

    pub fn failure(campaign: &Campaign, error: impl Into<String>) -> Self {
        Self {
            campaign_guid: campaign.campaign_guid.clone(),
            token: campaign.token.clone(),
            platform: campaign.device_type,
            was_success: false,
            error: Some(error.into()),
            processed_at: Utc::now(),
        }
    }
}

/// Raw inbound broker message, before normalization.
#[derive(Debug, Deserialize, Clone)]
pub struct CampaignMessage {
    pub campaign_guid: String,
    pub token: String,
    pub device_type: String,
    pub campaign_type: String,
    #[serde(default)]
    pub credentials: CampaignCredentials,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CampaignMessage {
    /// Normalizes and validates one broker message into a `Campaign`.
    /// `device_type` and `campaign_type` are lowercased before matching.
    pub fn into_campaign(self) -> Result<Campaign, ServiceError> {
        if self.campaign_guid.is_empty() {
            return Err(ServiceError::Validation("campaign_guid is empty".into()));
        }
        if self.token.is_empty() {
            return Err(ServiceError::Validation("token is empty".into()));
        }

        let device_type = match self.device_type.to_lowercase().as_str() {
            "android" => DeviceType::Android,
            "ios" => DeviceType::Ios,
            other => {
                return Err(ServiceError::Validation(format!(
                    "unknown device_type: {}",
                    other
                )))
            }
        };

        let campaign_type = match self.campaign_type.to_lowercase().as_str() {
            "push" => CampaignType::Push,
            "in_app" => CampaignType::InApp,
            "feed" => CampaignType::Feed,
            other => {
                return Err(ServiceError::Validation(format!(
                    "unknown campaign_type: {}",
                    other
                )))
            }
        };

        if campaign_type == CampaignType::Push {
            if self.credentials.certificate.is_null() {
                return Err(ServiceError::Validation(
                    "credentials must contain certificate".into(),
                ));
            }
            // Fail structural payload problems before anything is dispatched.
            PushPayload::from_value(&self.payload)?;
        }

        Ok(Campaign {
            campaign_guid: self.campaign_guid,
            token: self.token,
            device_type,
            campaign_type,
            credentials: self.credentials,
            payload: self.payload,
            processed_at: Utc::now(),
        })
    }
}
