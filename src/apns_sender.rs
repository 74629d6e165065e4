use crate::classifier::ProviderFailure;
use crate::models::{Campaign, CampaignCredentials, PushPayload};
use a2::{
    Client, ClientConfig, DefaultNotificationBuilder, Endpoint, NotificationBuilder,
    NotificationOptions,
};
use base64::Engine;
use serde_json::json;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

fn invalid_credential(message: String) -> ProviderFailure {
    ProviderFailure {
        status: None,
        code: Some("INVALID_CREDENTIAL".to_string()),
        message,
        retry_after: None,
    }
}

/// The `certificate` field carries a base64-encoded PKCS#12 bundle for iOS.
fn decode_certificate(credentials: &CampaignCredentials) -> Result<Vec<u8>, ProviderFailure> {
    let raw = credentials
        .certificate
        .as_str()
        .ok_or_else(|| invalid_credential("certificate must be a base64 string".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| invalid_credential(format!("certificate is not valid base64: {}", e)))
}

/// Ordered button descriptors carried as custom data; the id is derived from
/// the explicit position.
pub fn button_descriptors(payload: &PushPayload) -> Vec<serde_json::Value> {
    payload
        .sorted_buttons()
        .into_iter()
        .map(|button| {
            let mut descriptor = serde_json::Map::new();
            descriptor.insert("id".to_string(), json!(format!("btn_{}", button.position)));
            descriptor.insert("label".to_string(), json!(button.label));
            descriptor.insert("action".to_string(), json!(button.action.as_str()));
            if let Some(url) = button.action_url {
                descriptor.insert("action_url".to_string(), json!(url));
            }
            serde_json::Value::Object(descriptor)
        })
        .collect()
}

fn map_apns_error(error: a2::Error) -> ProviderFailure {
    match error {
        a2::Error::ResponseError(response) => {
            let reason = response
                .error
                .as_ref()
                .map(|body| format!("{:?}", body.reason));
            // Dead-token rejections map onto the shared permanent code so the
            // classifier treats both providers alike.
            let code = match reason.as_deref() {
                Some("Unregistered") | Some("BadDeviceToken") | Some("DeviceTokenNotForTopic") => {
                    Some("UNREGISTERED".to_string())
                }
                _ => None,
            };
            ProviderFailure {
                status: Some(response.code),
                code,
                message: format!(
                    "APNs rejected the notification: {}",
                    reason.as_deref().unwrap_or("unknown reason")
                ),
                retry_after: None,
            }
        }
        other => ProviderFailure::network(format!("APNs send failed: {}", other)),
    }
}

/// Sends one notification over a certificate-authenticated channel built
/// fresh from the campaign's certificate and optional passphrase.
pub async fn send(
    campaign: &Campaign,
    payload: &PushPayload,
    sandbox: bool,
    request_timeout: Duration,
) -> Result<(), ProviderFailure> {
    let pkcs12 = decode_certificate(&campaign.credentials)?;
    let password = campaign
        .credentials
        .certificate_password
        .as_deref()
        .unwrap_or("");
    let endpoint = if sandbox {
        Endpoint::Sandbox
    } else {
        Endpoint::Production
    };

    let client = Client::certificate(
        &mut Cursor::new(pkcs12),
        password,
        ClientConfig::new(endpoint),
    )
    .map_err(|e| invalid_credential(format!("failed to open certificate channel: {}", e)))?;

    let mut builder = DefaultNotificationBuilder::new().set_body(&payload.push_text);
    if let Some(title) = &payload.push_title {
        builder = builder.set_title(title);
    }
    if let Some(subtitle) = &payload.push_sub_title {
        builder = builder.set_subtitle(subtitle);
    }
    if payload.push_rich_media.is_some() {
        builder = builder.set_mutable_content().set_content_available();
    }

    let category = format!("CAMPAIGN_{}", campaign.campaign_guid);
    let has_buttons = payload
        .push_buttons
        .as_ref()
        .map_or(false, |b| !b.is_empty());
    if has_buttons {
        builder = builder.set_category(&category);
    }

    let mut notification = builder.build(&campaign.token, NotificationOptions::default());

    if let Some(rich_media) = &payload.push_rich_media {
        notification
            .add_custom_data("rich_media_url", rich_media)
            .map_err(|e| ProviderFailure::network(format!("invalid custom data: {}", e)))?;
    }

    notification
        .add_custom_data("action", &payload.push_action.as_str())
        .map_err(|e| ProviderFailure::network(format!("invalid custom data: {}", e)))?;
    if payload.push_action.carries_url() {
        if let Some(url) = &payload.push_action_url {
            notification
                .add_custom_data("action_url", url)
                .map_err(|e| ProviderFailure::network(format!("invalid custom data: {}", e)))?;
        }
    }

    if has_buttons {
        notification
            .add_custom_data("buttons", &button_descriptors(payload))
            .map_err(|e| ProviderFailure::network(format!("invalid custom data: {}", e)))?;
    }

    let response = tokio::time::timeout(request_timeout, client.send(notification))
        .await
        .map_err(|_| ProviderFailure::network("APNs request timed out".to_string()))?;

    match response {
        Ok(accepted) => {
            debug!(
                campaign_guid = %campaign.campaign_guid,
                apns_id = ?accepted.apns_id,
                "APNs accepted notification"
            );
            Ok(())
        }
        Err(e) => Err(map_apns_error(e)),
    }
}
