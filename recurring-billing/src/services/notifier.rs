//! Notification collaborator clients.
//!
//! The jobs only see the `Notifier` trait. Production wiring posts events to
//! the notification service (`HttpNotifier`), which dedupes on its side;
//! `LedgerNotifier` performs the same dedupe in-process against the billing
//! store for deployments without that service-side guarantee.

use super::store::BillingStore;
use crate::config::NotificationServiceConfig;
use crate::models::NotificationEvent;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),
    #[error("notification service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("notification dedupe ledger unavailable: {0}")]
    Ledger(#[from] AppError),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Transport(err.to_string())
    }
}

/// Collaborator response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationOutcome {
    pub success: bool,
    pub sent: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

impl NotificationOutcome {
    pub fn sent() -> Self {
        Self {
            success: true,
            sent: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        !self.success || self.error.is_some()
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        if self.is_failure() {
            "error"
        } else if self.skipped {
            "skipped"
        } else {
            "sent"
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationOutcome, NotifyError>;
}

/// Posts events to `{base}/internal/notifications/{family}/{event}`.
#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    config: NotificationServiceConfig,
    correlation_id: Option<String>,
}

impl HttpNotifier {
    pub fn new(config: NotificationServiceConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            correlation_id: None,
        })
    }

    /// Tag every request with the job run's correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn endpoint(&self, event: &NotificationEvent) -> String {
        format!(
            "{}/internal/notifications/{}/{}",
            self.config.url.trim_end_matches('/'),
            event.family.as_str(),
            event.notification_type.as_str()
        )
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(
        skip(self, event),
        fields(event = event.notification_type.as_str(), entity_id = %event.entity_id)
    )]
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationOutcome, NotifyError> {
        let mut request = self
            .client
            .traced_post(&self.endpoint(event))
            .correlation_id(self.correlation_id.as_deref())
            .json(event);
        if let Some(token) = &self.config.internal_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| NotifyError::Transport(e.to_string()))
    }
}

/// Delivers each event at most once by claiming its dedupe key first.
pub struct LedgerNotifier<S: ?Sized, N> {
    store: Arc<S>,
    inner: N,
}

impl<S: BillingStore + ?Sized, N: Notifier> LedgerNotifier<S, N> {
    pub fn new(store: Arc<S>, inner: N) -> Self {
        Self { store, inner }
    }
}

#[async_trait]
impl<S: BillingStore + ?Sized, N: Notifier> Notifier for LedgerNotifier<S, N> {
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationOutcome, NotifyError> {
        let key = event.dedupe_key();
        if !self.store.insert_notification_dedupe(&key).await? {
            tracing::debug!(
                event = event.notification_type.as_str(),
                entity_id = %event.entity_id,
                "Notification already sent"
            );
            return Ok(NotificationOutcome::skipped());
        }

        let result = self.inner.notify(event).await;
        let delivered = matches!(&result, Ok(outcome) if !outcome.is_failure());
        if !delivered {
            if let Err(e) = self.store.delete_notification_dedupe(&key).await {
                tracing::warn!(error = %e, "Failed to release notification claim");
            }
        }
        result
    }
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationOutcome, NotifyError> {
        (**self).notify(event).await
    }
}
