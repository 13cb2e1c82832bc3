//! Retrying HTTP transport and the export call built on top of it.
//!
//! [`RetryingTransport`] retries a POST while the server answers with one of
//! the configured transient statuses, doubling the delay after every attempt.
//! Connection-level faults are returned to the caller untouched; the fetch
//! orchestrator owns that retry budget.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use tracing::debug;

use crate::epias::tools::config::TransportConfig;
use crate::epias::tools::error::{Result, TransportError};
use crate::epias::tools::model::{AuthTicket, FetchRequest, ServiceTicket};

/// Content type of an xlsx body. Anything else on a 200 is a non-delivery.
pub const SPREADSHEET_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Header carrying the ticket-granting ticket on export calls.
pub const TGT_HEADER: &str = "TGT";

/// Wire-level retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            retry_statuses: config.retry_statuses.clone(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Delay after the `attempt`-th failed attempt (1-based): base, 2x, 4x, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Shared HTTP client plus the wire-level retry policy.
///
/// `reqwest::Client` pools connections internally, so clones share one pool and
/// the transport can be used from every worker without extra locking.
#[derive(Debug, Clone)]
pub struct RetryingTransport {
    client: Client,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Builds a client with the configured per-request timeout.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::new(client, RetryPolicy::from(config)))
    }

    /// Sends the request built by `build`, retrying on transient statuses.
    ///
    /// Non-retryable statuses are returned as-is for the caller to judge.
    pub async fn post<F>(&self, build: F) -> std::result::Result<Response, TransportError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let response = build(&self.client).send().await?;
            let status = response.status().as_u16();
            if !self.policy.is_retryable(status) {
                return Ok(response);
            }
            if attempt >= self.policy.max_attempts {
                return Err(TransportError::RetriesExhausted {
                    status,
                    attempts: attempt,
                });
            }

            let delay = self.policy.backoff(attempt);
            debug!(
                status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient status, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Raw answer of one export call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ExportResponse {
    /// A 200 carrying an xlsx body. Any other combination is a non-delivery.
    pub fn is_spreadsheet(&self) -> bool {
        self.status == 200 && self.content_type.contains(SPREADSHEET_CONTENT_TYPE)
    }
}

/// Performs one export call for one meter.
#[async_trait]
pub trait ExportClient: Send + Sync {
    async fn export(
        &self,
        auth: &AuthTicket,
        ticket: &ServiceTicket,
        request: &FetchRequest,
    ) -> std::result::Result<ExportResponse, TransportError>;
}

/// Export client talking to the reporting endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpExportClient {
    transport: RetryingTransport,
    service_url: String,
}

impl HttpExportClient {
    pub fn new(transport: RetryingTransport, service_url: impl Into<String>) -> Self {
        Self {
            transport,
            service_url: service_url.into(),
        }
    }
}

#[async_trait]
impl ExportClient for HttpExportClient {
    async fn export(
        &self,
        auth: &AuthTicket,
        ticket: &ServiceTicket,
        request: &FetchRequest,
    ) -> std::result::Result<ExportResponse, TransportError> {
        let response = self
            .transport
            .post(|client| {
                client
                    .post(&self.service_url)
                    .query(&[("ticket", ticket.as_str())])
                    .header(reqwest::header::ACCEPT, "application/json")
                    .header(TGT_HEADER, auth.as_str())
                    .json(request)
            })
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?.to_vec();

        Ok(ExportResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epias::tools::model::{EntityId, ReportingPeriod};
    use httpmock::prelude::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            retry_statuses: vec![500, 502, 503, 504],
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            ..fast_policy()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn only_listed_statuses_are_retryable() {
        let policy = fast_policy();
        assert!(policy.is_retryable(503));
        assert!(!policy.is_retryable(404));
        assert!(!policy.is_retryable(200));
    }

    #[test]
    fn wrong_content_type_is_not_a_spreadsheet() {
        let json = ExportResponse {
            status: 200,
            content_type: "application/json".into(),
            body: b"{}".to_vec(),
        };
        let xlsx = ExportResponse {
            content_type: format!("{SPREADSHEET_CONTENT_TYPE}; charset=binary"),
            ..json.clone()
        };
        assert!(!json.is_spreadsheet());
        assert!(xlsx.is_spreadsheet());
    }

    #[tokio::test]
    async fn transient_status_is_retried_until_budget_is_spent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/export");
                then.status(503);
            })
            .await;

        let transport = RetryingTransport::new(Client::new(), fast_policy());
        let url = server.url("/export");
        let result = transport.post(|client| client.post(&url)).await;

        assert!(matches!(
            result,
            Err(TransportError::RetriesExhausted {
                status: 503,
                attempts: 5
            })
        ));
        mock.assert_hits_async(5).await;
    }

    #[tokio::test]
    async fn transient_statuses_then_success_returns_the_success() {
        let server = MockServer::start_async().await;
        let mut unavailable = server
            .mock_async(|when, then| {
                when.method(POST).path("/export");
                then.status(503);
            })
            .await;

        // Long enough backoff for the mock swap to land before the third attempt.
        let transport = RetryingTransport::new(
            Client::new(),
            RetryPolicy {
                base_delay: Duration::from_millis(300),
                ..fast_policy()
            },
        );
        let url = server.url("/export");
        let request = async {
            let response = transport
                .post(|client| client.post(&url))
                .await
                .expect("response returned");
            let status = response.status().as_u16();
            (status, response.text().await.expect("body read"))
        };
        let recover = async {
            while unavailable.hits_async().await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let failed_hits = unavailable.hits_async().await;
            unavailable.delete_async().await;
            let available = server
                .mock_async(|when, then| {
                    when.method(POST).path("/export");
                    then.status(200).body("recovered");
                })
                .await;
            (failed_hits, available)
        };

        let ((status, body), (failed_hits, available)) = tokio::join!(request, recover);

        assert_eq!(status, 200);
        assert_eq!(body, "recovered");
        assert_eq!(failed_hits + available.hits_async().await, 3);
        available.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn client_errors_are_returned_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/export");
                then.status(404);
            })
            .await;

        let transport = RetryingTransport::new(Client::new(), fast_policy());
        let url = server.url("/export");
        let response = transport
            .post(|client| client.post(&url))
            .await
            .expect("response returned");

        assert_eq!(response.status().as_u16(), 404);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn export_call_sends_tickets_and_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/export")
                    .query_param("ticket", "ST-1")
                    .header("tgt", "TGT-1")
                    .body_contains("\"meterId\":77");
                then.status(200)
                    .header("content-type", SPREADSHEET_CONTENT_TYPE)
                    .body("xlsx-bytes");
            })
            .await;

        let transport = RetryingTransport::new(Client::new(), fast_policy());
        let client = HttpExportClient::new(transport, server.url("/export"));
        let request = FetchRequest::new(EntityId(77), ReportingPeriod::default());
        let response = client
            .export(
                &AuthTicket::new("TGT-1"),
                &ServiceTicket::new("ST-1"),
                &request,
            )
            .await
            .expect("export answered");

        mock.assert_hits_async(1).await;
        assert!(response.is_spreadsheet());
        assert_eq!(response.body, b"xlsx-bytes".to_vec());
    }
}
