//! `Link` header entries returned to WHIP clients

use crate::webrtc::IceServer;

/// Link relation for the broadcaster channel a resource publishes into
pub const CHANNEL_REL: &str = "urn:ietf:params:whip:eyevinn-wrtc-channel";

/// Whether `presented` (an `Authorization` header value) matches `api_key`
///
/// Accepts the key verbatim or as a bearer token.
pub fn is_authorized(api_key: Option<&str>, presented: Option<&str>) -> bool {
    let (Some(key), Some(presented)) = (api_key, presented) else {
        return false;
    };
    if key.is_empty() {
        return false;
    }
    let presented = presented.trim();
    presented == key || presented.strip_prefix("Bearer ").map(str::trim) == Some(key)
}

/// Format one ICE server as a `Link` entry
pub fn ice_server_link(server: &IceServer) -> String {
    let mut link = format!("<{}>; rel=\"ice-server\"", server.url);
    if let Some(username) = &server.username {
        link.push_str(&format!("; username=\"{}\"", username));
    }
    if let Some(credential) = &server.credential {
        link.push_str(&format!("; credential=\"{}\"; credential-type=\"password\"", credential));
    }
    link
}

/// ICE server entries, disclosed only to clients presenting the API key
pub fn ice_server_links(servers: &[IceServer], api_key: Option<&str>, presented: Option<&str>) -> Vec<String> {
    if servers.is_empty() || !is_authorized(api_key, presented) {
        return Vec::new();
    }
    servers.iter().map(ice_server_link).collect()
}

pub fn channel_link(channel_url: &str) -> String {
    format!("<{}>; rel=\"{}\"", channel_url, CHANNEL_REL)
}
