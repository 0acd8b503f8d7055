use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tracing::{debug, instrument};

use crate::client::AuthClient;
use crate::errors::{Error, Result};
use crate::expiry_cache::ExpiryCache;
use crate::store::{persist, TokenPersister};
use crate::tokens::OAuthToken;

/// Durable record name of the refreshed OAuth2 token
pub const ACCESS_TOKEN_NAME: &str = "xbox.authToken";

/// Source of the Microsoft OAuth2 access token at the bottom of the chain
///
/// Failures here are fatal for the whole chain; nothing above retries them.
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed access token, e.g. one obtained by an interactive login elsewhere
#[derive(Clone)]
pub struct StaticAccessToken(String);

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticAccessToken").field(&"[REDACTED]").finish()
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Access token kept fresh with the OAuth2 `refresh_token` grant
///
/// The refresh token rotates on every grant. The newest one is written back to
/// the persister under [`ACCESS_TOKEN_NAME`] and also kept in memory, so a
/// cleared or missing record does not lose it.
pub struct RefreshingAccessToken {
    cache: ExpiryCache<(), OAuthToken, Error>,
    persister: Arc<dyn TokenPersister>,
}

impl RefreshingAccessToken {
    pub fn new(
        client: AuthClient,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
        persister: Arc<dyn TokenPersister>,
    ) -> Self {
        let client_id: Arc<str> = client_id.into().into();
        let seed = Arc::new(Mutex::new(refresh_token.into()));
        let skew = client.config().expiry_skew;

        let generate = {
            let persister = Arc::clone(&persister);
            move |()| {
                let client = client.clone();
                let client_id = Arc::clone(&client_id);
                let seed = Arc::clone(&seed);
                let persister = Arc::clone(&persister);
                async move {
                    let persisted = persister
                        .load(ACCESS_TOKEN_NAME)
                        .await?
                        .and_then(|record| record.get("refreshToken")?.as_str().map(str::to_string));
                    let refresh_token = match persisted {
                        Some(token) => token,
                        None => seed.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                    };

                    let mut token = client.refresh_access_token(&client_id, &refresh_token).await?;
                    let rotated = token.refresh_token.get_or_insert(refresh_token).clone();
                    *seed.lock().unwrap_or_else(PoisonError::into_inner) = rotated;

                    persist(persister.as_ref(), ACCESS_TOKEN_NAME, &token).await?;
                    debug!("Refreshed Microsoft access token");
                    Ok(token)
                }
                .boxed()
            }
        };

        let load_existing = {
            let persister = Arc::clone(&persister);
            move || {
                let persister = Arc::clone(&persister);
                async move { persister.load(ACCESS_TOKEN_NAME).await }.boxed()
            }
        };

        Self {
            cache: ExpiryCache::new(generate, load_existing).with_expiry_skew(skew),
            persister,
        }
    }

    /// Drop the cached access token; the next call refreshes again
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        self.persister.clear(ACCESS_TOKEN_NAME).await?;
        self.cache.clear_token();
        Ok(())
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for RefreshingAccessToken {
    async fn access_token(&self) -> Result<String> {
        self.cache
            .get_token(())
            .await
            .map(|token| token.token)
            .map_err(|e| match e {
                Error::AccessToken(_) | Error::OAuthInvalidGrant => e,
                other => Error::AccessToken(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Endpoints};
    use crate::store::MemoryTokenPersister;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AuthClient {
        let config = AuthConfig::default().with_endpoints(Endpoints::with_base(&server.uri()).unwrap());
        AuthClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn static_token_is_returned_as_is() {
        let provider = StaticAccessToken::new("abc");
        assert_eq!(provider.access_token().await.unwrap(), "abc");
        assert!(!format!("{:?}", provider).contains("abc"));
    }

    #[tokio::test]
    async fn refresh_rotates_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains("refresh_token=seed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "refresh_token": "rotated",
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let persister = Arc::new(MemoryTokenPersister::new());
        let provider = RefreshingAccessToken::new(client(&server), "client", "seed", persister.clone());

        assert_eq!(provider.access_token().await.unwrap(), "access-1");
        assert_eq!(provider.access_token().await.unwrap(), "access-1");

        let record = persister.load(ACCESS_TOKEN_NAME).await.unwrap().unwrap();
        assert_eq!(record["refreshToken"], "rotated");
    }

    #[tokio::test]
    async fn persisted_refresh_token_wins_over_seed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains("refresh_token=stored"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let persister = Arc::new(MemoryTokenPersister::new());
        let expired = (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339();
        persister
            .save(
                ACCESS_TOKEN_NAME,
                &json!({ "token": "old", "expiresAt": expired, "refreshToken": "stored" }),
            )
            .await
            .unwrap();

        let provider = RefreshingAccessToken::new(client(&server), "client", "seed", persister.clone());
        assert_eq!(provider.access_token().await.unwrap(), "access-2");

        // The grant did not rotate, so the refresh token in use is kept
        let record = persister.load(ACCESS_TOKEN_NAME).await.unwrap().unwrap();
        assert_eq!(record["refreshToken"], "stored");
    }

    #[tokio::test]
    async fn invalid_grant_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let provider = RefreshingAccessToken::new(
            client(&server),
            "client",
            "seed",
            Arc::new(MemoryTokenPersister::new()),
        );
        assert!(matches!(provider.access_token().await, Err(Error::OAuthInvalidGrant)));
    }
}
