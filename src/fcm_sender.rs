use crate::classifier::ProviderFailure;
use crate::config::FcmSettings;
use crate::error::ServiceError;
use crate::models::{Campaign, PushPayload};
use crate::token_cache::{ServiceAccountKey, TokenCache};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// FCM v1 message envelope, shaped like the REST API expects.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmMessage {
    pub message: FcmMessageBody,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmMessageBody {
    pub token: String,
    pub notification: FcmNotification,
    pub android: FcmAndroidConfig,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmAndroidConfig {
    pub notification: FcmAndroidNotification,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmAndroidNotification {
    pub click_action: String,
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<FcmButton>>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FcmButton {
    pub button_text: String,
    pub button_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_action_url: Option<String>,
}

/// Builds the provider-A message for one campaign. Buttons are emitted in
/// explicit position order regardless of how they arrived on the wire.
pub fn build_fcm_message(campaign: &Campaign, payload: &PushPayload) -> FcmMessage {
    let mut data = BTreeMap::new();
    if payload.push_action.carries_url() {
        if let Some(url) = &payload.push_action_url {
            data.insert("action_url".to_string(), url.clone());
        }
    }

    let sorted = payload.sorted_buttons();
    let buttons = if sorted.is_empty() {
        None
    } else {
        Some(
            sorted
                .into_iter()
                .map(|b| FcmButton {
                    button_text: b.label,
                    button_action: b.action.as_str().to_string(),
                    button_action_url: if b.action.carries_url() { b.action_url } else { None },
                })
                .collect(),
        )
    };

    FcmMessage {
        message: FcmMessageBody {
            token: campaign.token.clone(),
            notification: FcmNotification {
                title: payload.push_title.clone(),
                body: payload.push_text.clone(),
                subtitle: payload.push_sub_title.clone(),
                image: payload.push_rich_media.clone(),
            },
            android: FcmAndroidConfig {
                notification: FcmAndroidNotification {
                    click_action: payload.push_action.as_str().to_string(),
                    channel_id: "default".to_string(),
                    buttons,
                },
            },
            data,
        },
    }
}

/// Bearer-authenticated HTTP client for provider A. One instance is shared
/// by all workers; tokens come from the shared cache.
pub struct FcmClient {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    endpoint: String,
}

impl FcmClient {
    pub fn new(settings: &FcmSettings, tokens: Arc<TokenCache>) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            tokens,
            endpoint: settings.endpoint.clone(),
        })
    }

    /// Sends one message, flattening every failure mode into a
    /// `ProviderFailure` for the classifier.
    pub async fn send(
        &self,
        campaign: &Campaign,
        message: &FcmMessage,
    ) -> Result<(), ProviderFailure> {
        let key = ServiceAccountKey::from_value(&campaign.credentials.certificate)?;
        let bearer = self
            .tokens
            .resolve(&campaign.credentials.certificate, &key)
            .await?;

        let url = self.endpoint.replace("{project_id}", &key.project_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderFailure::network(format!("request timed out: {}", e))
                } else {
                    ProviderFailure::network(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(campaign_guid = %campaign.campaign_guid, "Provider accepted message");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(_) => serde_json::Value::Null,
        };
        let code = body
            .pointer("/error/status")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let message_text = body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("provider rejected the request")
            .to_string();

        Err(ProviderFailure {
            status: Some(status.as_u16()),
            code,
            message: message_text,
            retry_after,
        })
    }
}

impl std::fmt::Debug for FcmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
