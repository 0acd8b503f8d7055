use std::sync::Arc;

use futures::FutureExt;
use hw_auth::errors::ensure_success;
use hw_auth::{
    AttemptInput, AuthConfig, Error, RequestOrigin, Result, RetryEvent, RetryPolicy,
    SpartanTokenProvider, XboxTokenProvider,
};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

pub const SPARTAN_HEADER: &str = "x-343-authorization-spartan";
pub const XBL_CONTRACT_VERSION_HEADER: &str = "x-xbl-contract-version";

/// Attaches a credential to outgoing requests and drops it when the service
/// rejects it
#[async_trait::async_trait]
pub trait RequestAuthorizer: Send + Sync {
    /// The credential for the next request
    async fn credential(&self) -> Result<String>;

    fn attach(&self, request: RequestBuilder, credential: &str) -> RequestBuilder;

    /// Forget the rejected `stale` credential so the next
    /// [`credential`](Self::credential) obtains a new one. A credential that
    /// was already replaced is kept.
    async fn invalidate(&self, stale: &str) -> Result<()>;
}

/// Halo Waypoint services, authorized by the Spartan token
#[derive(Clone)]
pub struct SpartanAuthorizer {
    provider: Arc<dyn SpartanTokenProvider>,
}

impl SpartanAuthorizer {
    pub fn new(provider: Arc<dyn SpartanTokenProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl RequestAuthorizer for SpartanAuthorizer {
    async fn credential(&self) -> Result<String> {
        Ok(self.provider.spartan_token().await?.token)
    }

    fn attach(&self, request: RequestBuilder, credential: &str) -> RequestBuilder {
        request.header(SPARTAN_HEADER, credential)
    }

    async fn invalidate(&self, stale: &str) -> Result<()> {
        if !self.provider.clear_spartan_token_if(stale).await? {
            debug!("Spartan token already replaced, retrying with the new one");
        }
        Ok(())
    }
}

/// Xbox Live services, authorized by an `XBL3.0` header
#[derive(Clone)]
pub struct XboxLiveAuthorizer {
    provider: Arc<dyn XboxTokenProvider>,
}

impl XboxLiveAuthorizer {
    pub fn new(provider: Arc<dyn XboxTokenProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl RequestAuthorizer for XboxLiveAuthorizer {
    async fn credential(&self) -> Result<String> {
        self.provider.xbox_live_v3_token().await
    }

    fn attach(&self, request: RequestBuilder, credential: &str) -> RequestBuilder {
        request
            .header(AUTHORIZATION, credential)
            .header(XBL_CONTRACT_VERSION_HEADER, "1")
    }

    async fn invalidate(&self, stale: &str) -> Result<()> {
        if !self.provider.clear_xbox_live_v3_token_if(stale).await? {
            debug!("XSTS ticket already replaced, retrying with the new one");
        }
        Ok(())
    }
}

/// Executes authorized requests against a protected service
///
/// A 401 from the service invalidates the credential that request carried and
/// the request is sent once more with a fresh one. Every other failure is
/// returned as is.
pub struct RequestExecutor {
    http: Client,
    authorizer: Arc<dyn RequestAuthorizer>,
    retry: RetryPolicy<Error>,
}

impl RequestExecutor {
    pub fn new(config: &AuthConfig, authorizer: Arc<dyn RequestAuthorizer>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(
                config
                    .user_agent
                    .as_deref()
                    .unwrap_or(hw_auth::config::halo::USER_AGENT),
            )
            .build()?;

        let retry = RetryPolicy::new(&config.retry, |e: &Error| {
            e.is_unauthorized_from(RequestOrigin::Service)
        });

        Ok(Self {
            http,
            authorizer,
            retry,
        })
    }

    /// Executor for Halo Waypoint services
    pub fn halo(config: &AuthConfig, provider: Arc<dyn SpartanTokenProvider>) -> Result<Self> {
        Self::new(config, Arc::new(SpartanAuthorizer::new(provider)))
    }

    /// Executor for Xbox Live services
    pub fn xbox(config: &AuthConfig, provider: Arc<dyn XboxTokenProvider>) -> Result<Self> {
        Self::new(config, Arc::new(XboxLiveAuthorizer::new(provider)))
    }

    #[instrument(skip(self, url, body), fields(url = %url))]
    pub async fn execute(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Response> {
        let attempted = AttemptInput::<String>::new();
        let invalidate = {
            let authorizer = Arc::clone(&self.authorizer);
            let attempted = attempted.clone();
            move |_: &Error, event: RetryEvent| {
                let authorizer = Arc::clone(&authorizer);
                let stale = attempted.take();
                async move {
                    debug!(attempt = event.attempt, "Service rejected the credential, invalidating it");
                    match stale {
                        Some(stale) => authorizer.invalidate(&stale).await,
                        None => Ok(()),
                    }
                }
                .boxed()
            }
        };

        self.retry
            .execute_with_hook(invalidate, || async {
                let mut request = self
                    .http
                    .request(method.clone(), url.clone())
                    .header(ACCEPT, "application/json");
                if let Some(body) = body {
                    request = request.json(body);
                }

                let credential = self.authorizer.credential().await?;
                attempted.record(credential.clone());
                let response = self.authorizer.attach(request, &credential).send().await?;
                ensure_success(RequestOrigin::Service, response).await
            })
            .await
    }

    /// GET `url` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.execute(Method::GET, url, None).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use hw_auth::SpartanToken;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out `token-<n>`, bumping `n` on every clear
    #[derive(Default)]
    struct CountingProvider {
        generation: AtomicUsize,
        clears: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SpartanTokenProvider for CountingProvider {
        async fn spartan_token(&self) -> Result<SpartanToken> {
            Ok(SpartanToken {
                token: format!("token-{}", self.generation.load(Ordering::SeqCst)),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn clear_spartan_token(&self) -> Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn current_expiration(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }

        async fn clear_spartan_token_if(&self, stale: &str) -> Result<bool> {
            let current = format!("token-{}", self.generation.load(Ordering::SeqCst));
            if stale != current {
                return Ok(false);
            }
            self.clear_spartan_token().await?;
            Ok(true)
        }
    }

    fn executor(provider: &Arc<CountingProvider>) -> RequestExecutor {
        let mut config = AuthConfig::default();
        config.retry.backoff = std::time::Duration::ZERO;
        let provider: Arc<dyn SpartanTokenProvider> = provider.clone();
        RequestExecutor::halo(&config, provider).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_invalidates_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hi/users/Chief"))
            .and(header(SPARTAN_HEADER, "token-0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hi/users/Chief"))
            .and(header(SPARTAN_HEADER, "token-1"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "gamertag": "Chief" })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = Arc::new(CountingProvider::default());
        let url = Url::parse(&format!("{}/hi/users/Chief", server.uri())).unwrap();
        let user: Value = executor(&provider).get_json(url).await.unwrap();

        assert_eq!(user["gamertag"], "Chief");
        assert_eq!(provider.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_rejection_keeps_the_replacement() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hi/fast"))
            .and(header(SPARTAN_HEADER, "token-0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hi/slow"))
            .and(header(SPARTAN_HEADER, "token-0"))
            .respond_with(ResponseTemplate::new(401).set_delay(std::time::Duration::from_millis(200)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header(SPARTAN_HEADER, "token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(2)
            .mount(&server)
            .await;

        let provider = Arc::new(CountingProvider::default());
        let executor = executor(&provider);
        let fast = Url::parse(&format!("{}/hi/fast", server.uri())).unwrap();
        let slow = Url::parse(&format!("{}/hi/slow", server.uri())).unwrap();

        let (fast, slow) = tokio::join!(
            executor.get_json::<Value>(fast),
            executor.get_json::<Value>(slow),
        );
        fast.unwrap();
        slow.unwrap();
        assert_eq!(provider.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_are_returned_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hi/search"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = Arc::new(CountingProvider::default());
        let url = Url::parse(&format!("{}/hi/search", server.uri())).unwrap();
        let err = executor(&provider)
            .execute(Method::POST, url, Some(&json!({ "q": "Chief" })))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::NOT_FOUND));
        assert_eq!(provider.clears.load(Ordering::SeqCst), 0);
    }
}
