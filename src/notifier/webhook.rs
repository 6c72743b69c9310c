//! Webhook delivery with bounded retries.
//!
//! POSTs `{event, timestamp, data}` to the registered URL. Three attempts
//! with exponential backoff (2 s initial, factor 2), 10 s per-attempt
//! timeout; only 200/201/202/204 count as delivered. Failures are logged
//! and counted, never escalated into the pipeline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook to {url} failed after {attempts} attempts")]
    Failed { url: String, attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub request_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
    cfg: WebhookConfig,
    clock: Arc<dyn Clock>,
}

impl WebhookSink {
    pub fn new(cfg: WebhookConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
            clock,
        }
    }

    /// Deliver one event. Non-2xx responses count as failures but are only
    /// retried up to the configured attempt limit.
    pub async fn send(
        &self,
        url: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<(), WebhookError> {
        let payload = serde_json::json!({
            "event": event,
            "timestamp": self.clock.now().to_rfc3339(),
            "data": data,
        });

        for attempt in 0..self.cfg.max_attempts {
            let response = self
                .client
                .post(url)
                .timeout(self.cfg.request_timeout)
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) if matches!(resp.status().as_u16(), 200 | 201 | 202 | 204) => {
                    tracing::info!(url, event, status = resp.status().as_u16(), "webhook delivered");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::warn!(
                        url,
                        event,
                        status = resp.status().as_u16(),
                        attempt = attempt + 1,
                        "webhook returned non-success status"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        url,
                        event,
                        attempt = attempt + 1,
                        error = %e,
                        "webhook request failed"
                    );
                }
            }

            if attempt + 1 < self.cfg.max_attempts {
                let delay = self
                    .cfg
                    .initial_delay
                    .mul_f64(self.cfg.backoff_factor.powi(attempt as i32));
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(url, event, attempts = self.cfg.max_attempts, "webhook gave up");
        Err(WebhookError::Failed {
            url: url.to_string(),
            attempts: self.cfg.max_attempts,
        })
    }

    pub async fn notify_application_status(
        &self,
        url: &str,
        application_id: Uuid,
        status: &str,
        extra: serde_json::Value,
    ) -> Result<(), WebhookError> {
        let mut data = serde_json::json!({
            "application_id": application_id.to_string(),
            "status": status,
        });
        if let (Some(obj), Some(extra_obj)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.send(url, &format!("application.{status}"), data).await
    }

    pub async fn notify_identity_created(
        &self,
        url: &str,
        application_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), WebhookError> {
        self.send(
            url,
            "identity.created",
            serde_json::json!({
                "application_id": application_id.to_string(),
                "identity_id": identity_id.to_string(),
            }),
        )
        .await
    }

    pub async fn notify_duplicate_detected(
        &self,
        url: &str,
        application_id: Uuid,
        matched_application_id: Uuid,
        confidence: f32,
    ) -> Result<(), WebhookError> {
        self.send(
            url,
            "duplicate.detected",
            serde_json::json!({
                "application_id": application_id.to_string(),
                "matched_application_id": matched_application_id.to_string(),
                "confidence": confidence,
            }),
        )
        .await
    }
}
