use crate::classifier::ProviderFailure;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
/// Chance per lookup of sweeping expired entries, instead of a dedicated timer.
const CLEANUP_PROBABILITY: f64 = 0.01;

/// Service-account material parsed out of a campaign's `certificate` field.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    /// Accepts the service-account JSON either inline as an object or as an
    /// embedded JSON string.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ProviderFailure> {
        let parsed = match value {
            serde_json::Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| ProviderFailure {
            status: None,
            code: Some("INVALID_CREDENTIAL".to_string()),
            message: format!("invalid service account credentials: {}", e),
            retry_after: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Provider token-exchange protocol: a signed assertion traded for a bearer
/// token. Behind a trait so tests can count and script exchanges.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(
        &self,
        key: &ServiceAccountKey,
        scope: &str,
    ) -> Result<ExchangedToken, ProviderFailure>;
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Real OAuth2 JWT-bearer exchanger.
pub struct OauthExchanger {
    http: reqwest::Client,
}

impl OauthExchanger {
    pub fn new(request_timeout: Duration) -> Result<Self, crate::error::ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http })
    }

    fn signed_assertion(key: &ServiceAccountKey, scope: &str) -> Result<String, ProviderFailure> {
        let iat = chrono::Utc::now().timestamp() as u64;
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope,
            aud: &key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let encoding_key =
            EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| ProviderFailure {
                status: None,
                code: Some("INVALID_CREDENTIAL".to_string()),
                message: format!("invalid service account private key: {}", e),
                retry_after: None,
            })?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key).map_err(|e| {
            ProviderFailure {
                status: None,
                code: Some("INVALID_CREDENTIAL".to_string()),
                message: format!("failed to sign token assertion: {}", e),
                retry_after: None,
            }
        })
    }
}

#[async_trait]
impl TokenExchange for OauthExchanger {
    async fn exchange(
        &self,
        key: &ServiceAccountKey,
        scope: &str,
    ) -> Result<ExchangedToken, ProviderFailure> {
        let assertion = Self::signed_assertion(key, scope)?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| ProviderFailure::network(format!("token exchange failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderFailure::response(
                status,
                None,
                format!("token endpoint rejected assertion: {}", body),
            ));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ProviderFailure::network(format!("invalid token endpoint response: {}", e))
        })?;

        Ok(ExchangedToken {
            access_token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
    project_id: String,
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedToken>,
}

/// Bearer-token cache keyed by credential fingerprint.
///
/// The outer map lock is held only to look up or create a slot; the
/// check-then-refresh critical section runs under a per-fingerprint async
/// mutex, so concurrent resolves of the same credentials perform a single
/// exchange while unrelated credentials refresh in parallel.
pub struct TokenCache {
    exchanger: Arc<dyn TokenExchange>,
    scope: String,
    safety_margin: Duration,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
}

/// SHA-256 over the canonicalized credential JSON. `serde_json` maps are
/// ordered, so key order on the wire does not change the fingerprint.
pub fn fingerprint(credentials: &serde_json::Value) -> String {
    let canonical = credentials.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

impl TokenCache {
    pub fn new(exchanger: Arc<dyn TokenExchange>, scope: String, safety_margin: Duration) -> Self {
        Self {
            exchanger,
            scope,
            safety_margin,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a bearer token valid for at least the safety margin, minting
    /// one through the exchange protocol on miss or expiry.
    pub async fn resolve(
        &self,
        credentials: &serde_json::Value,
        key: &ServiceAccountKey,
    ) -> Result<String, ProviderFailure> {
        if rand::random::<f64>() < CLEANUP_PROBABILITY {
            self.sweep_expired();
        }

        let slot = {
            let mut slots = self.slots.lock().expect("token cache lock poisoned");
            Arc::clone(slots.entry(fingerprint(credentials)).or_default())
        };

        let mut slot = slot.lock().await;
        if let Some(cached) = &slot.cached {
            if cached.expires_at > Instant::now() {
                debug!(project_id = %cached.project_id, "Using cached provider token");
                return Ok(cached.token.clone());
            }
        }

        info!(project_id = %key.project_id, "Minting new provider token");
        let exchanged = self.exchanger.exchange(key, &self.scope).await?;

        // Expire conservatively below the provider-stated lifetime.
        let lifetime = exchanged
            .expires_in
            .checked_sub(self.safety_margin)
            .unwrap_or(exchanged.expires_in);
        slot.cached = Some(CachedToken {
            token: exchanged.access_token.clone(),
            expires_at: Instant::now() + lifetime,
            project_id: key.project_id.clone(),
        });

        Ok(exchanged.access_token)
    }

    /// Drops all expired entries. Slots with a refresh in progress are left
    /// alone; the refresh will overwrite them anyway.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("token cache lock poisoned");
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard
                .cached
                .as_ref()
                .map_or(false, |cached| cached.expires_at > now),
            Err(_) => true,
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, "Swept expired provider tokens");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchanger {
        calls: AtomicUsize,
        expires_in: Duration,
    }

    impl CountingExchanger {
        fn new(expires_in: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expires_in,
            }
        }
    }

    #[async_trait]
    impl TokenExchange for CountingExchanger {
        async fn exchange(
            &self,
            key: &ServiceAccountKey,
            _scope: &str,
        ) -> Result<ExchangedToken, ProviderFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExchangedToken {
                access_token: format!("token-{}-{}", key.project_id, n),
                expires_in: self.expires_in,
            })
        }
    }

    fn test_key() -> ServiceAccountKey {
        ServiceAccountKey {
            project_id: "demo".to_string(),
            client_email: "svc@demo.iam.example.com".to_string(),
            private_key: "unused".to_string(),
            token_uri: default_token_uri(),
        }
    }

    fn creds() -> serde_json::Value {
        json!({ "project_id": "demo", "client_email": "svc@demo.iam.example.com" })
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_resolves_within_validity_reuse_the_token() {
        let exchanger = Arc::new(CountingExchanger::new(Duration::from_secs(3600)));
        let cache = TokenCache::new(
            exchanger.clone(),
            "scope".to_string(),
            Duration::from_secs(100),
        );

        let first = cache.resolve(&creds(), &test_key()).await.unwrap();
        for _ in 0..10 {
            let again = cache.resolve(&creds(), &test_key()).await.unwrap();
            assert_eq!(first, again);
        }
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refreshed() {
        let exchanger = Arc::new(CountingExchanger::new(Duration::from_secs(3600)));
        let cache = TokenCache::new(
            exchanger.clone(),
            "scope".to_string(),
            Duration::from_secs(100),
        );

        let first = cache.resolve(&creds(), &test_key()).await.unwrap();
        // Valid for 3500s after the margin; step past it.
        tokio::time::advance(Duration::from_secs(3501)).await;
        let second = cache.resolve(&creds(), &test_key()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_of_same_credentials_exchange_once() {
        let exchanger = Arc::new(CountingExchanger::new(Duration::from_secs(3600)));
        let cache = Arc::new(TokenCache::new(
            exchanger.clone(),
            "scope".to_string(),
            Duration::from_secs(100),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.resolve(&creds(), &test_key()).await.unwrap()
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap());
        }
        tokens.dedup();
        assert_eq!(tokens.len(), 1);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_expired_entries() {
        let exchanger = Arc::new(CountingExchanger::new(Duration::from_secs(200)));
        let cache = TokenCache::new(
            exchanger.clone(),
            "scope".to_string(),
            Duration::from_secs(100),
        );

        cache.resolve(&creds(), &test_key()).await.unwrap();
        let other = json!({ "project_id": "other" });
        let mut other_key = test_key();
        other_key.project_id = "other".to_string();
        cache.resolve(&other, &other_key).await.unwrap();
        assert_eq!(cache.len(), 2);

        // Nothing is expired yet.
        cache.sweep_expired();
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(101)).await;
        cache.sweep_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = json!({ "project_id": "demo", "client_email": "a@b.c" });
        let b = json!({ "client_email": "a@b.c", "project_id": "demo" });
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = json!({ "project_id": "demo2", "client_email": "a@b.c" });
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }
}
