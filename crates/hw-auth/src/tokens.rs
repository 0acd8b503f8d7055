use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::date_time::parse_timestamp;
use crate::errors::{Error, Result};
use crate::models::{DisplayClaims, SpartanTokenResponse, XboxTicketResponse};

/// A credential with an absolute expiry
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;

    /// Usable iff `expires_at > now + skew`. A skew past the representable
    /// range makes every token unusable.
    fn is_valid_at(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        now.checked_add_signed(skew)
            .is_some_and(|deadline| self.expires_at() > deadline)
    }
}

/// Xbox user token or XSTS ticket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct XboxTicket {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub display_claims: DisplayClaims,
}

impl XboxTicket {
    /// User hash of the first claim set
    pub fn user_hash(&self) -> Option<&str> {
        self.display_claims.xui.first().map(|claims| claims.uhs.as_str())
    }

    pub fn xuid(&self) -> Option<&str> {
        self.display_claims.xui.first().and_then(|claims| claims.xid.as_deref())
    }

    pub fn gamertag(&self) -> Option<&str> {
        self.display_claims.xui.first().and_then(|claims| claims.gtg.as_deref())
    }

    /// `XBL3.0 x=<uhs>;<token>` authorization value for Xbox Live services
    pub fn xbox_live_v3_header(&self) -> Result<String> {
        let uhs = self.user_hash().ok_or(Error::MissingClaims)?;
        Ok(format!("XBL3.0 x={};{}", uhs, self.token))
    }
}

impl Expiring for XboxTicket {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl TryFrom<XboxTicketResponse> for XboxTicket {
    type Error = Error;

    fn try_from(response: XboxTicketResponse) -> Result<Self> {
        let expires_at = parse_timestamp(&response.not_after).ok_or_else(|| {
            Error::InvalidResponse(format!("Unparsable NotAfter: {}", response.not_after))
        })?;

        Ok(Self {
            token: response.token,
            issued_at: response.issue_instant.as_deref().and_then(parse_timestamp),
            expires_at,
            display_claims: response.display_claims,
        })
    }
}

/// Halo Waypoint service token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpartanToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for SpartanToken {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl TryFrom<SpartanTokenResponse> for SpartanToken {
    type Error = Error;

    fn try_from(response: SpartanTokenResponse) -> Result<Self> {
        let raw = response.expires_utc.iso8601_date;
        let expires_at = parse_timestamp(&raw)
            .ok_or_else(|| Error::InvalidResponse(format!("Unparsable ExpiresUtc: {raw}")))?;

        Ok(Self {
            token: response.spartan_token,
            expires_at,
        })
    }
}

/// Microsoft OAuth2 access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl OAuthToken {
    pub fn new(token: String, refresh_token: Option<String>, expires_in: u64) -> Result<Self> {
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| Error::InvalidResponse(format!("Out of range expires_in: {expires_in}")))?;

        Ok(Self {
            token,
            expires_at,
            refresh_token,
        })
    }
}

impl Expiring for OAuthToken {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiFormattedDate, XboxUserClaims};

    fn ticket_response() -> XboxTicketResponse {
        XboxTicketResponse {
            token: "xsts-token".to_string(),
            display_claims: DisplayClaims {
                xui: vec![XboxUserClaims {
                    uhs: "1234".to_string(),
                    xid: Some("2533274800000000".to_string()),
                    gtg: Some("Chief".to_string()),
                    agg: None,
                    usr: None,
                    utr: None,
                    prv: None,
                }],
            },
            issue_instant: Some("2024-05-01T12:00:00.0000000Z".to_string()),
            not_after: "2024-05-02T04:00:00.0000000Z".to_string(),
        }
    }

    #[test]
    fn ticket_from_response() {
        let ticket = XboxTicket::try_from(ticket_response()).unwrap();
        assert_eq!(ticket.expires_at.to_rfc3339(), "2024-05-02T04:00:00+00:00");
        assert_eq!(ticket.user_hash(), Some("1234"));
        assert_eq!(ticket.xuid(), Some("2533274800000000"));
        assert_eq!(ticket.gamertag(), Some("Chief"));
        assert_eq!(ticket.xbox_live_v3_header().unwrap(), "XBL3.0 x=1234;xsts-token");
    }

    #[test]
    fn ticket_rejects_bad_not_after() {
        let mut response = ticket_response();
        response.not_after = "soon".to_string();
        assert!(matches!(
            XboxTicket::try_from(response),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn header_requires_claims() {
        let mut ticket = XboxTicket::try_from(ticket_response()).unwrap();
        ticket.display_claims.xui.clear();
        assert!(matches!(ticket.xbox_live_v3_header(), Err(Error::MissingClaims)));
    }

    #[test]
    fn spartan_token_from_response() {
        let token = SpartanToken::try_from(SpartanTokenResponse {
            spartan_token: "v4=abc".to_string(),
            expires_utc: ApiFormattedDate {
                iso8601_date: "2024-05-01T16:00:00Z".to_string(),
            },
            token_duration: Some("PT4H".to_string()),
        })
        .unwrap();
        assert_eq!(token.token, "v4=abc");
        assert_eq!(token.expires_at.to_rfc3339(), "2024-05-01T16:00:00+00:00");
    }

    #[test]
    fn oauth_lifetime_must_be_representable() {
        let token = OAuthToken::new("access".to_string(), None, 3600).unwrap();
        assert!(token.is_valid_at(Utc::now(), chrono::Duration::minutes(59)));

        assert!(matches!(
            OAuthToken::new("access".to_string(), None, u64::MAX),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(
            OAuthToken::new("access".to_string(), None, i64::MAX as u64),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn validity_honours_skew() {
        let now = Utc::now();
        let token = SpartanToken {
            token: "t".to_string(),
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(token.is_valid_at(now, chrono::Duration::zero()));
        assert!(!token.is_valid_at(now, chrono::Duration::minutes(1)));
    }

    #[test]
    fn persisted_shape_is_camel_case() {
        let ticket = XboxTicket::try_from(ticket_response()).unwrap();
        let value = serde_json::to_value(&ticket).unwrap();
        assert_eq!(
            parse_timestamp(value["expiresAt"].as_str().unwrap()),
            Some(ticket.expires_at)
        );
        assert_eq!(value["displayClaims"]["xui"][0]["uhs"], "1234");
    }
}
