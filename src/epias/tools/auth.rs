//! CAS ticket authority client.
//!
//! One ticket-granting ticket (TGT) is obtained per run; every export call then
//! needs its own service ticket (ST) minted against that TGT.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use tracing::debug;

use crate::epias::tools::config::AuthConfig;
use crate::epias::tools::error::{AuthError, Result};
use crate::epias::tools::model::{AuthTicket, ServiceTicket};
use crate::epias::tools::transport::RetryingTransport;

/// Username/password pair presented to the ticket authority.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl From<&AuthConfig> for Credentials {
    fn from(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Issues authorization and service tickets.
#[async_trait]
pub trait TicketAuthority: Send + Sync {
    /// Obtains the run-scoped ticket-granting ticket. Failures are fatal.
    async fn acquire_auth_ticket(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<AuthTicket, AuthError>;

    /// Mints a single-use service ticket for `service`.
    async fn acquire_service_ticket(
        &self,
        auth: &AuthTicket,
        service: &str,
    ) -> std::result::Result<ServiceTicket, AuthError>;
}

/// Ticket authority backed by the CAS REST protocol.
#[derive(Debug, Clone)]
pub struct CasClient {
    base_url: String,
    /// Used for the TGT request: no redirects, no retries.
    login_client: Client,
    transport: RetryingTransport,
}

impl CasClient {
    pub fn new(
        base_url: impl Into<String>,
        login_client: Client,
        transport: RetryingTransport,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            login_client,
            transport,
        }
    }

    /// Builds the client from configuration, sharing `transport` with the
    /// export calls. The login request gets the same per-request `timeout`.
    pub fn from_config(
        config: &AuthConfig,
        timeout: Duration,
        transport: RetryingTransport,
    ) -> Result<Self> {
        Ok(Self::new(
            config.cas_base_url.clone(),
            login_client(timeout)?,
            transport,
        ))
    }

    fn tickets_url(&self) -> String {
        format!("{}/tickets", self.base_url)
    }
}

/// Client for the TGT request: redirects are not followed, since the ticket
/// arrives in the `Location` header of the 201 itself.
fn login_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .timeout(timeout)
        .build()
}

/// Extracts the TGT id from a `Location` header such as
/// `https://cas/cas/v1/tickets/TGT-1-abc`.
pub fn parse_ticket_location(location: &str) -> std::result::Result<AuthTicket, AuthError> {
    if !location.contains("TGT") {
        return Err(AuthError::MissingTicket {
            location: location.to_string(),
        });
    }
    let ticket = location
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim();
    if ticket.is_empty() {
        return Err(AuthError::MissingTicket {
            location: location.to_string(),
        });
    }
    Ok(AuthTicket::new(ticket))
}

#[async_trait]
impl TicketAuthority for CasClient {
    async fn acquire_auth_ticket(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<AuthTicket, AuthError> {
        let params = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ];
        let response = self
            .login_client
            .post(self.tickets_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let ticket = parse_ticket_location(location)?;
        debug!("ticket-granting ticket acquired");
        Ok(ticket)
    }

    async fn acquire_service_ticket(
        &self,
        auth: &AuthTicket,
        service: &str,
    ) -> std::result::Result<ServiceTicket, AuthError> {
        let url = format!(
            "{}/{}",
            self.tickets_url(),
            urlencoding::encode(auth.as_str())
        );
        let response = self
            .transport
            .post(|client| client.post(&url).form(&[("service", service)]))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.into()))?;
        let ticket = body.trim();
        if ticket.is_empty() {
            return Err(AuthError::EmptyServiceTicket);
        }
        Ok(ServiceTicket::new(ticket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epias::tools::error::TransportError;
    use crate::epias::tools::transport::RetryPolicy;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> CasClient {
        let transport = RetryingTransport::new(
            Client::new(),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                retry_statuses: vec![503],
            },
        );
        CasClient::new(
            server.url("/cas/v1"),
            login_client(Duration::from_secs(5)).expect("client built"),
            transport,
        )
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "alice".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn ticket_id_is_last_location_segment() {
        let ticket = parse_ticket_location("https://cas.example/cas/v1/tickets/TGT-9-xyz ")
            .expect("ticket parsed");
        assert_eq!(ticket.as_str(), "TGT-9-xyz");
    }

    #[test]
    fn location_without_tgt_is_rejected() {
        assert!(matches!(
            parse_ticket_location("https://cas.example/login"),
            Err(AuthError::MissingTicket { .. })
        ));
        assert!(matches!(
            parse_ticket_location(""),
            Err(AuthError::MissingTicket { .. })
        ));
    }

    #[tokio::test]
    async fn auth_ticket_is_read_from_location_header() {
        let server = MockServer::start_async().await;
        let location = server.url("/cas/v1/tickets/TGT-1-abc");
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cas/v1/tickets")
                    .body_contains("username=alice")
                    .body_contains("password=secret");
                then.status(201).header("Location", location.as_str());
            })
            .await;

        let ticket = client_for(&server)
            .acquire_auth_ticket(&credentials())
            .await
            .expect("ticket acquired");

        mock.assert_hits_async(1).await;
        assert_eq!(ticket.as_str(), "TGT-1-abc");
    }

    #[tokio::test]
    async fn bad_credentials_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/cas/v1/tickets");
                then.status(401);
            })
            .await;

        let result = client_for(&server).acquire_auth_ticket(&credentials()).await;

        assert!(matches!(result, Err(AuthError::Rejected { status: 401 })));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn service_ticket_is_response_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cas/v1/tickets/TGT-1")
                    .body_contains("service=");
                then.status(200).body("ST-42-def\n");
            })
            .await;

        let ticket = client_for(&server)
            .acquire_service_ticket(&AuthTicket::new("TGT-1"), "https://svc.example/export")
            .await
            .expect("service ticket minted");

        mock.assert_hits_async(1).await;
        assert_eq!(ticket.as_str(), "ST-42-def");
    }

    #[tokio::test]
    async fn stalled_login_times_out() {
        let server = MockServer::start_async().await;
        let location = server.url("/cas/v1/tickets/TGT-1-abc");
        server
            .mock_async(|when, then| {
                when.method(POST).path("/cas/v1/tickets");
                then.status(201)
                    .header("Location", location.as_str())
                    .delay(Duration::from_secs(3));
            })
            .await;
        let config = AuthConfig {
            cas_base_url: server.url("/cas/v1"),
            ..AuthConfig::default()
        };
        let client = CasClient::from_config(
            &config,
            Duration::from_millis(200),
            client_for(&server).transport,
        )
        .expect("client built");

        let started = std::time::Instant::now();
        let result = client.acquire_auth_ticket(&credentials()).await;

        assert!(matches!(
            result,
            Err(AuthError::Transport(TransportError::Timeout))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
