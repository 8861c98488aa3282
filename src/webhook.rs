//! Webhook delivery engine — component K.
//!
//! Delivers a task envelope to one push-notification target. Each
//! [`PushConfig`] is signed according to its own [`PushAuth`] scheme and
//! retried independently of every other target — callers should spawn one
//! [`WebhookEngine::deliver`] per config (see [`deliver_all`]) rather than
//! awaiting them in sequence, so a slow or down target never delays the
//! others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::store::{PushConfigStore, TaskEventHook};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{Envelope, PushAuth, PushConfig, Task};

type HmacSha256 = Hmac<Sha256>;

fn sign_hmac(secret: &str, timestamp: &str, body: &[u8]) -> GatewayResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Invalid(format!("invalid hmac secret: {e}")))?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn content_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
struct PushClaims {
    iat: i64,
    exp: i64,
    nbf: i64,
    hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
}

/// Delivers task envelopes to registered push-notification targets,
/// signing each request per its `PushAuth` scheme and retrying transient
/// failures with exponential backoff.
pub struct WebhookEngine {
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    telemetry: TelemetrySink,
    max_attempts: u32,
    retry_base_ms: u64,
}

impl WebhookEngine {
    pub fn new(
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        telemetry: TelemetrySink,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            http,
            clock,
            telemetry,
            max_attempts: config.push_max_attempts,
            retry_base_ms: config.push_retry_base_ms,
        }
    }

    /// Delivers `envelope` to `push`, retrying retryable failures up to
    /// the configured attempt cap with base-doubling backoff
    /// (`retry_base_ms * 2^(attempt-1)`). The envelope is wrapped as
    /// `{"streamResponse": envelope}` before signing/sending, matching the
    /// shape a receiving agent expects from a push delivery.
    pub async fn deliver(&self, envelope: &Envelope, push: &PushConfig) -> GatewayResult<()> {
        self.telemetry.publish(TelemetryEvent::PushStart {
            task_id: Some(push.task_id.clone()),
            config_id: push.id.clone(),
        });

        let wrapped = serde_json::json!({ "streamResponse": envelope });
        let body = serde_json::to_vec(&wrapped)?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt_once(&body, push).await {
                Ok(()) => {
                    self.telemetry.publish(TelemetryEvent::PushSuccess {
                        task_id: Some(push.task_id.clone()),
                        config_id: push.id.clone(),
                        attempts: attempt,
                    });
                    return Ok(());
                }
                Err(e) if Self::is_retryable(&e) && attempt < self.max_attempts.max(1) => {
                    let delay_ms = self.retry_base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                    debug!(config_id = %push.id, attempt, delay_ms, "retrying webhook delivery");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    warn!(config_id = %push.id, attempt, reason = e.reason(), "webhook delivery failed");
                    self.telemetry.publish(TelemetryEvent::PushFailure {
                        task_id: Some(push.task_id.clone()),
                        config_id: push.id.clone(),
                        reason: e.reason().to_string(),
                        attempts: attempt,
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn attempt_once(&self, body: &[u8], push: &PushConfig) -> GatewayResult<()> {
        if push.url.is_empty() {
            return Err(GatewayError::NoUrl(push.id.clone()));
        }

        let request = self.http.post(&push.url).header("content-type", "application/json");
        let request = self.apply_auth(request, body, push)?;

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(push.id.clone(), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        Err(GatewayError::Remote {
            status: status.as_u16(),
            body: body_text,
        })
    }

    /// Applies the header set for `push.auth`. Header construction order
    /// matters for parity with how a receiving agent would expect to find
    /// them: content-type is always set first, then exactly one of the
    /// scheme-specific headers below.
    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        body: &[u8],
        push: &PushConfig,
    ) -> GatewayResult<reqwest::RequestBuilder> {
        match &push.auth {
            PushAuth::None => Ok(request),
            PushAuth::Bearer { token } => Ok(request.header("x-a2a-token", token)),
            PushAuth::Hmac { secret } => {
                let timestamp = self.clock.now_unix_seconds().to_string();
                let signature = sign_hmac(secret, &timestamp, body)?;
                Ok(request
                    .header("x-a2a-signature", signature)
                    .header("x-a2a-timestamp", timestamp))
            }
            PushAuth::Jwt {
                secret,
                issuer,
                audience,
                kid,
                ttl_seconds,
                clock_skew_seconds,
            } => {
                let token = self.sign_jwt(
                    secret,
                    issuer.as_deref(),
                    audience.as_deref(),
                    kid.as_deref(),
                    *ttl_seconds,
                    *clock_skew_seconds,
                    body,
                    &push.task_id,
                )?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn sign_jwt(
        &self,
        secret: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
        kid: Option<&str>,
        ttl_seconds: u64,
        skew_seconds: u64,
        body: &[u8],
        task_id: &str,
    ) -> GatewayResult<String> {
        let now = self.clock.now_unix_seconds();
        let claims = PushClaims {
            iat: now,
            exp: now + ttl_seconds as i64,
            nbf: now - skew_seconds as i64,
            hash: content_hash(body),
            iss: issuer.map(ToString::to_string),
            aud: audience.map(ToString::to_string),
            task_id: Some(task_id.to_string()),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(ToString::to_string);
        let key = EncodingKey::from_secret(secret.as_bytes());
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| GatewayError::Invalid(format!("jwt signing failed: {e}")))
    }

    fn is_retryable(err: &GatewayError) -> bool {
        matches!(err, GatewayError::Remote { status, .. } if *status >= 500)
            || matches!(err, GatewayError::Unreachable(_, _) | GatewayError::Timeout(_))
    }
}

/// Fans `envelope` out to every config in `targets`, each as its own
/// detached task so one slow or unreachable target can't delay delivery to
/// the others.
pub fn deliver_all(engine: Arc<WebhookEngine>, envelope: Envelope, targets: Vec<PushConfig>) {
    for push in targets {
        let engine = engine.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            let _ = engine.deliver(&envelope, &push).await;
        });
    }
}

/// Adapts [`WebhookEngine`] into a [`TaskEventHook`], letting the task store
/// fan a task's current snapshot out to its registered push targets on
/// every mutation without the store depending on this module directly.
pub struct PushNotificationHook {
    push_configs: Arc<dyn PushConfigStore>,
    webhook: Arc<WebhookEngine>,
}

impl PushNotificationHook {
    pub fn new(push_configs: Arc<dyn PushConfigStore>, webhook: Arc<WebhookEngine>) -> Self {
        Self { push_configs, webhook }
    }
}

#[async_trait]
impl TaskEventHook for PushNotificationHook {
    async fn on_task_event(&self, task: &Task) {
        let Ok(configs) = self.push_configs.list(&task.id).await else {
            return;
        };
        if configs.is_empty() {
            return;
        }
        let Ok(data) = serde_json::to_value(task) else {
            return;
        };
        deliver_all(self.webhook.clone(), Envelope::new("task", data), configs);
    }
}
