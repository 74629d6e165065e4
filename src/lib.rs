//! campaign_push_service Library Crate

pub mod api;
pub mod apns_sender;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fcm_sender;
pub mod ingest;
pub mod models;
pub mod retry_queue;
pub mod state;
pub mod store;
pub mod token_cache;
