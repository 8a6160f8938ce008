//! Payment processor seam.
//!
//! Each plan names the processor that bills it. The charge jobs look the
//! handler up in a `ProcessorRegistry` built once at process start; tests
//! register a fake under the same key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor credentials not configured")]
    NotConfigured,
    #[error("no processor customer found for payer {0}")]
    CustomerNotFound(Uuid),
    #[error("customer {0} has no default payment method")]
    PaymentMethodMissing(String),
    #[error("processor request failed: {0}")]
    Transport(String),
    #[error("processor returned an unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The key was already used with different parameters and the original
    /// charge could not be found. The outcome of that charge is unknown.
    #[error("idempotency key {0} conflicts with an earlier request")]
    IdempotencyConflict(String),
}

impl From<reqwest::Error> for ProcessorError {
    fn from(err: reqwest::Error) -> Self {
        ProcessorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::UnexpectedResponse(err.to_string())
    }
}

/// What the handler knows about a payer before resolution.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub payer_id: Uuid,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
}

/// Customer and payment method to charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorContext {
    pub customer_id: String,
    pub payment_method_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Same key for every attempt at the same (plan, scheduled date). Every
    /// other field must be identical between those attempts too.
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded { processor_payment_id: String },
    Failed { error: String },
}

#[async_trait]
pub trait ProcessorHandler: Send + Sync {
    /// Registry key, matched against `ProcessorLink::processor`.
    fn processor(&self) -> &str;

    /// Resolve the customer and payment method for a payer, falling back to a
    /// lookup when references are not cached.
    async fn resolve_context(
        &self,
        request: &ContextRequest,
    ) -> Result<ProcessorContext, ProcessorError>;

    /// Charge off-session. Declines are `Ok(ChargeOutcome::Failed)`; transport
    /// and protocol problems are `Err`. `IdempotencyConflict` means the charge
    /// may or may not have happened.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProcessorError>;
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    handlers: HashMap<String, Arc<dyn ProcessorHandler>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ProcessorHandler>) {
        self.handlers
            .insert(handler.processor().to_string(), handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProcessorHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, processor: &str) -> Option<&dyn ProcessorHandler> {
        self.handlers.get(processor).map(|h| h.as_ref())
    }
}
