use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::{halo, AuthConfig, RelyingParty, OAUTH_SCOPE, XBL_CONTRACT_VERSION};
use crate::errors::{ensure_success, Error, RequestOrigin, Result, XstsError};
use crate::models::*;
use crate::tokens::{OAuthToken, SpartanToken, XboxTicket};

/// HTTP client for the Xbox Live and Halo Waypoint token endpoints
///
/// Each method performs exactly one request. Caching, persistence and retries
/// live in [`TokenChain`](crate::chain::TokenChain).
#[derive(Debug, Clone)]
pub struct AuthClient {
    config: AuthConfig,
    http: Client,
}

impl AuthClient {
    /// Create a new authentication client
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or(halo::USER_AGENT))
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Refresh a Microsoft access token using a refresh token
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_access_token(&self, client_id: &str, refresh_token: &str) -> Result<OAuthToken> {
        let form = [
            ("client_id", client_id),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", OAUTH_SCOPE),
        ];

        debug!("Refreshing Microsoft access token");
        let response = self
            .http
            .post(self.config.endpoints.oauth_token.clone())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let url = response.url().clone();
            let body = response.text().await.unwrap_or_default();

            if body.contains("invalid_grant") {
                return Err(Error::OAuthInvalidGrant);
            }

            return Err(Error::Request {
                origin: RequestOrigin::OAuth,
                url,
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let token_response: OAuthTokenResponse = response.json().await?;
        OAuthToken::new(
            token_response.access_token,
            token_response.refresh_token,
            token_response.expires_in,
        )
    }

    /// Exchange a Microsoft access token for an Xbox Live user token
    #[instrument(skip(self, access_token))]
    pub async fn user_token(&self, access_token: &str) -> Result<XboxTicket> {
        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("d={}", access_token),
            },
            relying_party: "http://auth.xboxlive.com".to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authenticating with Xbox Live");
        let response = self
            .http
            .post(self.config.endpoints.user_authenticate.clone())
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", XBL_CONTRACT_VERSION)
            .json(&request)
            .send()
            .await?;

        let response = ensure_success(RequestOrigin::UserAuthentication, response).await?;
        let ticket_response: XboxTicketResponse = response.json().await?;
        XboxTicket::try_from(ticket_response)
    }

    /// Authorize an Xbox Live user token for a relying party
    ///
    /// A 401 carrying a known account `XErr` code becomes [`Error::XstsDenied`];
    /// any other 401 is reported as a plain XSTS request failure so the caller
    /// can retry with a fresh user token.
    #[instrument(skip(self, user_token))]
    pub async fn xsts_ticket(&self, user_token: &str, relying_party: RelyingParty) -> Result<XboxTicket> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![user_token.to_string()],
            },
            relying_party: relying_party.as_str().to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authorizing with XSTS");
        let response = self
            .http
            .post(self.config.endpoints.xsts_authorize.clone())
            .header("Accept", "application/json")
            .header("x-xbl-contract-version", XBL_CONTRACT_VERSION)
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let url = response.url().clone();
            let body = response.text().await.unwrap_or_default();

            if let Ok(error_response) = serde_json::from_str::<XstsErrorResponse>(&body) {
                let xsts_error = XstsError::from_xerr(error_response.xerr);
                if xsts_error.is_account_problem() {
                    warn!("XSTS denied authorization: {}", xsts_error);
                    return Err(xsts_error.into());
                }
            }

            return Err(Error::Request {
                origin: RequestOrigin::XstsAuthorization,
                url,
                status: StatusCode::UNAUTHORIZED,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let response = ensure_success(RequestOrigin::XstsAuthorization, response).await?;
        let ticket_response: XboxTicketResponse = response.json().await?;
        XboxTicket::try_from(ticket_response)
    }

    /// Exchange a Halo Waypoint XSTS ticket for a Spartan token
    #[instrument(skip(self, xsts_ticket))]
    pub async fn spartan_token(&self, xsts_ticket: &XboxTicket) -> Result<SpartanToken> {
        let request = SpartanTokenRequest {
            audience: halo::SPARTAN_AUDIENCE.to_string(),
            min_version: halo::SPARTAN_MIN_VERSION.to_string(),
            proof: vec![SpartanTokenProof {
                token: xsts_ticket.token.clone(),
                token_type: halo::PROOF_TOKEN_TYPE.to_string(),
            }],
        };

        debug!("Requesting Spartan token");
        let response = self
            .http
            .post(self.config.endpoints.spartan_token.clone())
            .header("Accept", "application/json")
            .header("Content-Type", "application/json; charset=utf-8")
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;

        let response = ensure_success(RequestOrigin::SpartanToken, response).await?;
        let spartan_response: SpartanTokenResponse = response.json().await?;
        SpartanToken::try_from(spartan_response)
    }
}
