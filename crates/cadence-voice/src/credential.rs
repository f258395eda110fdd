//! Ephemeral credentials from the auth/billing layer.
//!
//! The realtime socket is never opened with a long-lived API key. Each `connect`
//! asks a `CredentialProvider` exactly once for a short-lived secret; `None` means
//! the user is signed out or out of balance, which is terminal for that attempt.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Short-lived secret minted per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCredential {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` when unauthenticated or the billing balance is exhausted.
    async fn ephemeral_credential(&self) -> Option<EphemeralCredential>;
}

/// Fixed secret, for local development and tests.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    secret: Option<String>,
    ttl: ChronoDuration,
}

impl StaticCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ttl: ChronoDuration::minutes(1),
        }
    }

    /// A provider that always refuses (signed-out user).
    pub fn unavailable() -> Self {
        Self {
            secret: None,
            ttl: ChronoDuration::zero(),
        }
    }

    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn ephemeral_credential(&self) -> Option<EphemeralCredential> {
        self.secret.as_ref().map(|secret| EphemeralCredential {
            secret: secret.clone(),
            expires_at: Utc::now() + self.ttl,
        })
    }
}

/// Credential endpoint client. POSTs to the app backend, which checks the user's
/// session and balance before minting a realtime secret.
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    /// Full URL of the session-minting endpoint.
    pub url: String,
    /// App session token forwarded as `Authorization: Bearer`.
    pub bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpCredentialProvider {
    pub fn new(url: impl Into<String>, bearer: Option<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            bearer,
            client,
        })
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn ephemeral_credential(&self) -> Option<EphemeralCredential> {
        let mut request = self.client.post(&self.url);
        if let Some(ref bearer) = self.bearer {
            request = request.bearer_auth(bearer);
        }

        let res = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Credential request failed: {}", e);
                return None;
            }
        };

        let status = res.status();
        if !status.is_success() {
            // 401 = signed out, 402 = no credits; neither is retried.
            warn!("Credential endpoint refused ({})", status);
            return None;
        }

        let body: Value = match res.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Credential response was not JSON: {}", e);
                return None;
            }
        };

        let credential = parse_credential(&body);
        if credential.is_none() {
            warn!("Credential response missing secret");
        } else {
            debug!("Ephemeral credential issued");
        }
        credential
    }
}

/// Accepts `{ "secret", "expiresAt" }` or the provider-native
/// `{ "client_secret": { "value", "expires_at" } }` shape.
pub fn parse_credential(body: &Value) -> Option<EphemeralCredential> {
    let (secret, expires) = if let Some(secret) = body.get("secret").and_then(Value::as_str) {
        (secret, body.get("expiresAt").or_else(|| body.get("expires_at")))
    } else {
        let nested = body.get("client_secret")?;
        (
            nested.get("value").and_then(Value::as_str)?,
            nested.get("expires_at"),
        )
    };

    if secret.is_empty() {
        return None;
    }

    let expires_at = match expires {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc),
        Some(Value::Number(n)) => {
            let raw = n.as_i64()?;
            // Millisecond epochs are 13 digits.
            let secs = if raw > 1_000_000_000_000 { raw / 1000 } else { raw };
            DateTime::<Utc>::from_timestamp(secs, 0)?
        }
        _ => Utc::now() + ChronoDuration::minutes(1),
    };

    Some(EphemeralCredential {
        secret: secret.to_string(),
        expires_at,
    })
}
