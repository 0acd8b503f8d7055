use hw_auth::Result;
use url::Url;

/// Subdomains of the Halo Waypoint service domain
pub mod origins {
    pub const SKILL: &str = "skill";
    pub const PROFILE: &str = "profile";
    pub const STATS: &str = "halostats";
    pub const GAME_CMS: &str = "gamecms-hacs";
    pub const DISCOVERY: &str = "discovery-infiniteugc";
    pub const COMMS: &str = "wpcomms";
}

pub const SERVICE_DOMAIN: &str = "svc.halowaypoint.com:443";

/// Build `https://<origin>.svc.halowaypoint.com:443<path>`
pub fn service_url(origin: &str, path: &str) -> Result<Url> {
    Ok(Url::parse(&format!("https://{}.{}{}", origin, SERVICE_DOMAIN, path))?)
}

/// Wrap a bare XUID as `xuid(<id>)`; already-wrapped ids are returned as is
pub fn wrap_player_id(player_id: &str) -> String {
    if parse_wrapped(player_id).is_some() {
        player_id.to_string()
    } else {
        format!("xuid({})", player_id)
    }
}

/// Strip the `kind(...)` wrapper from a numeric player id
pub fn unwrap_player_id(player_id: &str) -> &str {
    parse_wrapped(player_id).unwrap_or(player_id)
}

fn parse_wrapped(player_id: &str) -> Option<&str> {
    let (kind, rest) = player_id.split_once('(')?;
    let inner = rest.strip_suffix(')')?;
    let valid_kind = !kind.is_empty() && kind.chars().all(|c| c.is_alphanumeric() || c == '_');
    let valid_inner = !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit());
    (valid_kind && valid_inner).then_some(inner)
}
