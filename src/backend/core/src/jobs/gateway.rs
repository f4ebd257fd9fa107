//! Ledger gateway used by the executor to submit one transaction.
//!
//! Every failure is classified here, at the boundary, into
//! [`ErrorClass::Transient`] or [`ErrorClass::Permanent`]. The executor never
//! inspects messages to decide whether to retry.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::job::{ErrorClass, JobError};
use crate::config::GatewayConfig;
use crate::error::{ErrorContext, ErrorCode, Result};

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Ledger transaction id, when the gateway reports one
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Payload returned by the contract
    #[serde(default)]
    pub payload: String,
}

/// A classified gateway failure.
#[derive(Debug, Clone, Error)]
#[error("{class} gateway error: {message}")]
pub struct GatewayError {
    pub class: ErrorClass,
    pub message: String,
    pub code: Option<String>,
    /// Set when the failure happened after a transaction was created
    pub transaction_id: Option<String>,
}

impl GatewayError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            code: None,
            transaction_id: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
            code: None,
            transaction_id: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

impl From<GatewayError> for JobError {
    fn from(error: GatewayError) -> Self {
        JobError {
            class: error.class,
            message: error.message,
            code: error.code,
        }
    }
}

/// Submits state-changing operations to the ledger.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Endorse, order and commit one transaction.
    async fn invoke(
        &self,
        operation: &str,
        arguments: &[String],
        identity: &str,
    ) -> std::result::Result<Invocation, GatewayError>;
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    channel: &'a str,
    contract: &'a str,
    function: &'a str,
    args: &'a [String],
    identity: &'a str,
}

/// Gateway adapter for a ledger REST gateway exposing `POST /invoke`.
pub struct HttpLedgerGateway {
    client: Client,
    base_url: String,
    channel: String,
    contract: String,
}

impl HttpLedgerGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.endorse_timeout_secs))
            .build()
            .with_error_code(ErrorCode::InvalidConfiguration)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            channel: config.channel.clone(),
            contract: config.contract.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Classify a transport-level failure.
pub fn classify_transport(error: &reqwest::Error) -> ErrorClass {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        ErrorClass::Transient
    } else if let Some(status) = error.status() {
        classify_status(status)
    } else if error.is_decode() || error.is_builder() {
        ErrorClass::Permanent
    } else {
        ErrorClass::Transient
    }
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn invoke(
        &self,
        operation: &str,
        arguments: &[String],
        identity: &str,
    ) -> std::result::Result<Invocation, GatewayError> {
        let url = format!("{}/invoke", self.base_url);
        let body = InvokeRequest {
            channel: &self.channel,
            contract: &self.contract,
            function: operation,
            args: arguments,
            identity,
        };

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            GatewayError {
                class: classify_transport(&e),
                message: format!("POST {} failed: {}", url, e),
                code: None,
                transaction_id: None,
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(status = %status, operation, "Ledger gateway rejected submission");
            return Err(GatewayError {
                class: classify_status(status),
                message: format!("Ledger gateway error ({}): {}", status, text),
                code: Some(status.as_u16().to_string()),
                transaction_id: None,
            });
        }

        resp.json::<Invocation>().await.map_err(|e| GatewayError {
            class: classify_transport(&e),
            message: format!("Failed to parse response from {}: {}", url, e),
            code: None,
            transaction_id: None,
        })
    }
}
