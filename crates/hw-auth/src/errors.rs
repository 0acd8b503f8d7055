use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::resolvable::Abandoned;

/// Which hop of the token chain (or the protected service) issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    /// Microsoft OAuth2 token endpoint
    OAuth,
    /// Xbox Live user.authenticate
    UserAuthentication,
    /// XSTS authorize
    XstsAuthorization,
    /// Halo Waypoint spartan-token exchange
    SpartanToken,
    /// A protected game-service endpoint
    Service,
}

impl fmt::Display for RequestOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OAuth => "OAuth",
            Self::UserAuthentication => "Xbox user authentication",
            Self::XstsAuthorization => "XSTS authorization",
            Self::SpartanToken => "Spartan token",
            Self::Service => "Service",
        };
        f.write_str(name)
    }
}

/// Halo Waypoint authentication error types
///
/// Errors are shared between every caller waiting on the same token generation,
/// so the enum is `Clone` and keeps non-cloneable sources behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(Arc<reqwest::Error>),

    #[error("{origin} request to {url} failed with HTTP {status}: {body_snippet}")]
    Request {
        origin: RequestOrigin,
        url: Url,
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("XSTS authorization denied: {0}")]
    XstsDenied(#[from] XstsError),

    #[error("OAuth2 access token unavailable: {0}")]
    AccessToken(String),

    #[error("Missing XUI claims in Xbox ticket")]
    MissingClaims,

    #[error("OAuth invalid_grant - refresh token may be expired")]
    OAuthInvalidGrant,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(Arc<serde_json::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Token generation stopped before producing a result")]
    Abandoned,

    #[error("Token store is locked by another process")]
    StoreLock,
}

impl Error {
    /// True for an HTTP 401 returned to a request issued by `origin`
    pub fn is_unauthorized_from(&self, origin: RequestOrigin) -> bool {
        matches!(
            self,
            Self::Request { origin: o, status, .. }
                if *o == origin && *status == reqwest::StatusCode::UNAUTHORIZED
        )
    }

    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Request { status, .. } => Some(*status),
            Self::Network(err) => err.status(),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::Request { url, .. } => Some(url),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<Abandoned> for Error {
    fn from(_: Abandoned) -> Self {
        Self::Abandoned
    }
}

/// XSTS-specific error codes from XErr field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsError {
    #[error("Account doesn't have an Xbox account (XErr: 2148916233)")]
    NoXboxAccount,

    #[error("Xbox Live not available in this country (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("Adult verification required on Xbox page (XErr: 2148916236/2148916237)")]
    AdultVerificationRequired,

    #[error("Child account requires Family (XErr: 2148916238)")]
    ChildAccountRequiresFamily,

    #[error("Unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsError {
    /// Parse XErr code from XSTS response
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }

    /// Account-level denials that a fresh user token cannot fix
    pub fn is_account_problem(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Turn a non-2xx response into [`Error::Request`], keeping a short body snippet.
pub async fn ensure_success(
    origin: RequestOrigin,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Request {
        origin,
        url,
        status,
        body_snippet: body.chars().take(200).collect(),
    })
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn request_error(origin: RequestOrigin, status: u16) -> Error {
        Error::Request {
            origin,
            url: Url::parse("https://settings.svc.halowaypoint.com/spartan-token").unwrap(),
            status: reqwest::StatusCode::from_u16(status).unwrap(),
            body_snippet: String::new(),
        }
    }

    #[test]
    fn unauthorized_is_scoped_to_origin() {
        let err = request_error(RequestOrigin::SpartanToken, 401);
        assert!(err.is_unauthorized_from(RequestOrigin::SpartanToken));
        assert!(!err.is_unauthorized_from(RequestOrigin::Service));
        assert!(!request_error(RequestOrigin::SpartanToken, 403)
            .is_unauthorized_from(RequestOrigin::SpartanToken));
    }

    #[test]
    fn request_error_exposes_url_and_status() {
        let err = request_error(RequestOrigin::Service, 500);
        assert_eq!(err.status(), Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(err.url().unwrap().path(), "/spartan-token");
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn xerr_codes() {
        assert_eq!(XstsError::from_xerr(2148916233), XstsError::NoXboxAccount);
        assert_eq!(XstsError::from_xerr(2148916237), XstsError::AdultVerificationRequired);
        assert!(XstsError::from_xerr(2148916238).is_account_problem());
        assert!(!XstsError::from_xerr(42).is_account_problem());
    }
}
