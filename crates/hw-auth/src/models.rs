use serde::{Deserialize, Serialize};

/// Microsoft OAuth token response (refresh_token grant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Xbox Live user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthRequest {
    pub properties: XblAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// XSTS authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
}

/// Response shared by user.authenticate and xsts/authorize
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxTicketResponse {
    pub token: String,
    pub display_claims: DisplayClaims,
    #[serde(default)]
    pub issue_instant: Option<String>,
    pub not_after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayClaims {
    #[serde(default)]
    pub xui: Vec<XboxUserClaims>,
}

/// Per-user claims; which fields are present depends on the relying party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XboxUserClaims {
    pub uhs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prv: Option<String>,
}

/// XSTS error response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsErrorResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Halo Waypoint spartan-token request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpartanTokenRequest {
    pub audience: String,
    pub min_version: String,
    pub proof: Vec<SpartanTokenProof>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpartanTokenProof {
    pub token: String,
    pub token_type: String,
}

/// Halo Waypoint spartan-token response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpartanTokenResponse {
    pub spartan_token: String,
    pub expires_utc: ApiFormattedDate,
    #[serde(default)]
    pub token_duration: Option<String>,
}

/// Date wrapper used across the Halo Waypoint APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFormattedDate {
    #[serde(rename = "ISO8601Date")]
    pub iso8601_date: String,
}
