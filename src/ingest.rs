use crate::models::{CampaignMessage, CampaignType};
use crate::state::AppState;
use crate::store::StoreError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumes raw campaign messages until the channel closes or shutdown is
/// requested. Every message is consumed exactly once; bad input is logged
/// and dropped, never retried.
pub async fn run(state: Arc<AppState>, mut rx: mpsc::Receiver<Vec<u8>>, token: CancellationToken) {
    info!("Campaign ingest loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Campaign ingest loop shutting down");
                return;
            }
            message = rx.recv() => {
                match message {
                    Some(raw) => handle_message(&state, &raw).await,
                    None => {
                        info!("Campaign ingest channel closed");
                        return;
                    }
                }
            }
        }
    }
}

/// Decodes, normalizes, persists, and (for push campaigns) dispatches one
/// inbound message.
pub async fn handle_message(state: &Arc<AppState>, raw: &[u8]) {
    let message: CampaignMessage = match serde_json::from_slice(raw) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Discarding malformed campaign message");
            return;
        }
    };
    let guid = message.campaign_guid.clone();

    let campaign = match message.into_campaign() {
        Ok(campaign) => campaign,
        Err(e) => {
            warn!(campaign_guid = %guid, error = %e, "Discarding invalid campaign message");
            return;
        }
    };

    match state.store.save_campaign(&campaign).await {
        Ok(()) => {}
        Err(StoreError::Duplicate(_)) => {
            // Redelivery from the broker; the first copy already ran.
            let token_prefix: String = campaign.token.chars().take(8).collect();
            info!(
                campaign_guid = %campaign.campaign_guid,
                token_prefix = %token_prefix,
                "Skipping duplicate campaign message"
            );
            return;
        }
        Err(e) => {
            warn!(campaign_guid = %campaign.campaign_guid, error = %e, "Failed to persist campaign");
            return;
        }
    }

    if campaign.campaign_type == CampaignType::Push {
        debug!(
            campaign_guid = %campaign.campaign_guid,
            device_type = %campaign.device_type,
            "Dispatching push campaign"
        );
        state.engine.dispatch(campaign);
    } else {
        debug!(
            campaign_guid = %campaign.campaign_guid,
            "Persisted non-push campaign without dispatching"
        );
    }
}
