//! Stripe processor handler.
//!
//! Charges stored payment methods off-session through the PaymentIntents API.
//! Every charge carries the caller's idempotency key in the `Idempotency-Key`
//! header, so a retried request for the same scheduled date returns the
//! original PaymentIntent instead of charging again.

use super::processor::{
    ChargeOutcome, ChargeRequest, ContextRequest, ProcessorContext, ProcessorError,
    ProcessorHandler,
};
use crate::config::StripeConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::instrument;

pub const STRIPE_PROCESSOR: &str = "stripe";

/// Stripe client for interacting with the Stripe API.
#[derive(Clone)]
pub struct StripeProcessor {
    client: Client,
    config: StripeConfig,
}

/// Response from customer search.
#[derive(Debug, Deserialize)]
struct CustomerList {
    data: Vec<StripeCustomer>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
    #[serde(default)]
    invoice_settings: Option<InvoiceSettings>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSettings {
    default_payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentMethodList {
    data: Vec<PaymentMethod>,
}

#[derive(Debug, Deserialize)]
struct PaymentMethod {
    id: String,
}

/// PaymentIntent fields the jobs care about.
#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
}

impl PaymentIntent {
    fn into_outcome(self) -> ChargeOutcome {
        if self.status == "succeeded" {
            ChargeOutcome::Succeeded {
                processor_payment_id: self.id,
            }
        } else {
            ChargeOutcome::Failed {
                error: format!("payment intent {} is {}", self.id, self.status),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentList {
    data: Vec<PaymentIntent>,
}

/// Stripe API error response.
#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

impl StripeErrorDetail {
    fn describe(&self) -> String {
        let reason = self
            .decline_code
            .as_deref()
            .or(self.code.as_deref())
            .unwrap_or("unknown");
        match &self.message {
            Some(message) => format!("{}: {}", reason, message),
            None => reason.to_string(),
        }
    }
}

impl StripeProcessor {
    pub fn new(config: StripeConfig) -> Result<Self, ProcessorError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ProcessorError::from)?;
        Ok(Self { client, config })
    }

    /// Check if Stripe is configured (secret key is set).
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProcessorError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.config.secret_key.expose_secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            Err(ProcessorError::UnexpectedResponse(format!(
                "GET {} returned {}: {}",
                path, status, body
            )))
        }
    }

    async fn find_customer(&self, payer_id: uuid::Uuid) -> Result<StripeCustomer, ProcessorError> {
        let query = format!("metadata['payer_id']:'{}'", payer_id);
        let customers: CustomerList = self
            .get_json("/customers/search", &[("query", query.as_str()), ("limit", "1")])
            .await?;
        customers
            .data
            .into_iter()
            .next()
            .ok_or(ProcessorError::CustomerNotFound(payer_id))
    }

    async fn default_payment_method(
        &self,
        customer: &StripeCustomer,
    ) -> Result<String, ProcessorError> {
        if let Some(pm) = customer
            .invoice_settings
            .as_ref()
            .and_then(|s| s.default_payment_method.clone())
        {
            return Ok(pm);
        }

        let methods: PaymentMethodList = self
            .get_json(
                "/payment_methods",
                &[("customer", customer.id.as_str()), ("type", "card"), ("limit", "1")],
            )
            .await?;
        methods
            .data
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| ProcessorError::PaymentMethodMissing(customer.id.clone()))
    }

    /// Find the PaymentIntent created by the first request under
    /// `idempotency_key`.
    async fn original_charge(
        &self,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome, ProcessorError> {
        let query = format!("metadata['idempotency_key']:'{}'", idempotency_key);
        let conflict = || ProcessorError::IdempotencyConflict(idempotency_key.to_string());

        let intents: PaymentIntentList = self
            .get_json(
                "/payment_intents/search",
                &[("query", query.as_str()), ("limit", "1")],
            )
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Original payment intent lookup failed");
                conflict()
            })?;

        let intent = intents.data.into_iter().next().ok_or_else(conflict)?;
        tracing::info!(
            payment_intent = %intent.id,
            status = %intent.status,
            "Found payment intent of earlier request"
        );
        Ok(intent.into_outcome())
    }
}

#[async_trait]
impl ProcessorHandler for StripeProcessor {
    fn processor(&self) -> &str {
        STRIPE_PROCESSOR
    }

    #[instrument(skip(self, request), fields(payer_id = %request.payer_id))]
    async fn resolve_context(
        &self,
        request: &ContextRequest,
    ) -> Result<ProcessorContext, ProcessorError> {
        if let (Some(customer_id), Some(payment_method_id)) =
            (&request.customer_id, &request.payment_method_id)
        {
            return Ok(ProcessorContext {
                customer_id: customer_id.clone(),
                payment_method_id: payment_method_id.clone(),
            });
        }
        if !self.is_configured() {
            return Err(ProcessorError::NotConfigured);
        }

        let customer = match &request.customer_id {
            Some(id) => {
                self.get_json::<StripeCustomer>(&format!("/customers/{}", id), &[])
                    .await?
            }
            None => self.find_customer(request.payer_id).await?,
        };

        let payment_method_id = match &request.payment_method_id {
            Some(pm) => pm.clone(),
            None => self.default_payment_method(&customer).await?,
        };

        tracing::info!(
            customer_id = %customer.id,
            "Resolved Stripe customer and payment method"
        );

        Ok(ProcessorContext {
            customer_id: customer.id,
            payment_method_id,
        })
    }

    #[instrument(
        skip(self, request),
        fields(idempotency_key = %request.idempotency_key, amount = request.amount_cents)
    )]
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProcessorError> {
        if !self.is_configured() {
            return Err(ProcessorError::NotConfigured);
        }

        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("customer".to_string(), request.customer_id.clone()),
            ("payment_method".to_string(), request.payment_method_id.clone()),
            ("off_session".to_string(), "true".to_string()),
            ("confirm".to_string(), "true".to_string()),
        ];
        let mut metadata: Vec<_> = request.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }
        form.push((
            "metadata[idempotency_key]".to_string(),
            request.idempotency_key.clone(),
        ));

        let response = self
            .client
            .post(self.url("/payment_intents"))
            .bearer_auth(self.config.secret_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, "Stripe create payment intent response");

        if status.is_success() {
            let intent: PaymentIntent = serde_json::from_str(&body)?;
            tracing::info!(
                payment_intent = %intent.id,
                status = %intent.status,
                "Stripe payment intent created"
            );
            return Ok(intent.into_outcome());
        }

        let detail = serde_json::from_str::<StripeErrorBody>(&body).map(|b| b.error);

        match (status, detail) {
            // Same key, different parameters: Stripe did not run this request,
            // but an earlier one under the key may have charged.
            (StatusCode::BAD_REQUEST, Ok(detail))
                if detail.kind.as_deref() == Some("idempotency_error") =>
            {
                tracing::warn!(
                    reason = %detail.describe(),
                    "Stripe rejected reused idempotency key"
                );
                self.original_charge(&request.idempotency_key).await
            }
            // Card declines and invalid payment details will not fix themselves
            // on an immediate retry; they count towards the default threshold.
            (StatusCode::PAYMENT_REQUIRED | StatusCode::BAD_REQUEST, Ok(detail)) => {
                tracing::warn!(
                    kind = detail.kind.as_deref().unwrap_or("unknown"),
                    reason = %detail.describe(),
                    "Stripe charge declined"
                );
                Ok(ChargeOutcome::Failed {
                    error: detail.describe(),
                })
            }
            (status, _) => {
                tracing::error!(status = %status, body = %body, "Stripe charge request failed");
                Err(ProcessorError::UnexpectedResponse(format!(
                    "POST /payment_intents returned {}",
                    status
                )))
            }
        }
    }
}
