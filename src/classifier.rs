use std::time::Duration;

/// Error codes the providers report for permanent failures. These abort the
/// attempt regardless of the HTTP status they arrived with.
pub const NON_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    ("INVALID_ARGUMENT", "Invalid message format or invalid fields"),
    ("UNREGISTERED", "Token is not registered/invalid"),
    ("SENDER_ID_MISMATCH", "Token does not match sender ID"),
    ("THIRD_PARTY_AUTH_ERROR", "Invalid credentials"),
    ("INVALID_CREDENTIAL", "Invalid credentials or project ID"),
];

/// A failed provider call, flattened to what classification needs: the HTTP
/// status (absent for network-level failures), the parsed provider error
/// code/message, and any `retry-after` hint the provider supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    /// Timeout, connection failure, or any other failure without a response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn response(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, self.status) {
            (Some(code), _) => match non_retryable_description(code) {
                Some(desc) => write!(f, "{} - {}", code, desc),
                None => write!(f, "{}: {}", code, self.message),
            },
            (None, Some(status)) => write!(f, "HTTP {}: {}", status, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// How the scheduler should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Permanent failure; record and stop.
    Abort,
    /// Rate limited; the delay is the provider hint or the configured default.
    RetryHinted(Duration),
    /// Transient; seed the standard backoff curve.
    RetryDefault,
}

fn non_retryable_description(code: &str) -> Option<&'static str> {
    NON_RETRYABLE_ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, desc)| *desc)
}

/// Maps a provider failure to an abort/retry decision.
///
/// Named permanent error codes win over the HTTP status. 400/401/403/404
/// abort; 429 retries with the provider hint (or `rate_limit_delay`); 5xx,
/// unrecognized statuses, and network failures retry on the default curve.
pub fn classify(failure: &ProviderFailure, rate_limit_delay: Duration) -> Disposition {
    if let Some(code) = &failure.code {
        if non_retryable_description(code).is_some() {
            return Disposition::Abort;
        }
    }

    match failure.status {
        Some(400) | Some(401) | Some(403) | Some(404) => Disposition::Abort,
        Some(429) => Disposition::RetryHinted(failure.retry_after.unwrap_or(rate_limit_delay)),
        _ => Disposition::RetryDefault,
    }
}
