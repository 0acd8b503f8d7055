use std::time::Duration;
use url::Url;

use crate::errors::Result;

/// Xbox Live and Halo Waypoint authentication endpoints
pub mod endpoints {
    pub const MS_TOKEN: &str = "https://login.live.com/oauth20_token.srf";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const SPARTAN_TOKEN: &str = "https://settings.svc.halowaypoint.com/spartan-token";
}

/// Values the Halo Waypoint settings service expects on the token exchange
pub mod halo {
    pub const SPARTAN_AUDIENCE: &str = "urn:343:s3:services";
    pub const SPARTAN_MIN_VERSION: &str = "4";
    pub const PROOF_TOKEN_TYPE: &str = "Xbox_XSTSv3";
    pub const USER_AGENT: &str = "HaloWaypoint/2021112313511900 CFNetwork/1327.0.4 Darwin/21.2.0";
}

/// OAuth scopes requested by the refresh grant
pub const OAUTH_SCOPE: &str = "Xboxlive.signin Xboxlive.offline_access";

/// Value of the `x-xbl-contract-version` header
pub const XBL_CONTRACT_VERSION: &str = "1";

/// Audience an XSTS ticket is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelyingParty {
    /// Xbox Live services (people hub, user search, ...)
    Xbox,
    /// Halo Waypoint services
    Halo,
}

impl RelyingParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xbox => "http://xboxlive.com",
            Self::Halo => "https://prod.xsts.halowaypoint.com/",
        }
    }
}

impl std::fmt::Display for RelyingParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint URLs used by the token chain
///
/// Defaults point at production; [`Endpoints::with_base`] rebases every path onto
/// another host, which is how the tests talk to a mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub oauth_token: Url,
    pub user_authenticate: Url,
    pub xsts_authorize: Url,
    pub spartan_token: Url,
}

impl Endpoints {
    pub fn with_base(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        Ok(Self {
            oauth_token: base.join("/oauth20_token.srf")?,
            user_authenticate: base.join("/user/authenticate")?,
            xsts_authorize: base.join("/xsts/authorize")?,
            spartan_token: base.join("/spartan-token")?,
        })
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            oauth_token: Url::parse(endpoints::MS_TOKEN).expect("valid OAuth endpoint"),
            user_authenticate: Url::parse(endpoints::XBL_AUTHENTICATE).expect("valid XBL endpoint"),
            xsts_authorize: Url::parse(endpoints::XSTS_AUTHORIZE).expect("valid XSTS endpoint"),
            spartan_token: Url::parse(endpoints::SPARTAN_TOKEN).expect("valid Spartan endpoint"),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Retry policy configuration for authorization failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Constant delay before each retry
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Configuration for the token chain
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Endpoint URLs
    pub endpoints: Endpoints,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    /// Retry policy
    pub retry: RetryConfig,

    /// Tokens expiring within this window are treated as already expired.
    /// Zero means strict `expires_at > now`.
    pub expiry_skew: Duration,
}

impl AuthConfig {
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some(halo::USER_AGENT.to_string()),
            retry: RetryConfig::default(),
            expiry_skew: Duration::ZERO,
        }
    }
}
