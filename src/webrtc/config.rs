//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default bounded wait for ICE gathering before an offer/answer is returned
pub const DEFAULT_ICE_GATHERING_TIMEOUT_MS: u64 = 4000;

/// Default time a viewer gets to reach "connected"
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 60_000;

/// WebRTC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// ICE candidate gathering timeout (ms)
    pub ice_gathering_timeout_ms: u64,
    /// Viewer connection timeout (ms)
    pub connection_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout_ms: DEFAULT_ICE_GATHERING_TIMEOUT_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

impl WebRtcConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// STUN/TURN server passed through to peer connections and advertised to
/// authorized WHIP clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URL (e.g. "stun:stun.l.google.com:19302" or "turn:turn.example.com:3478")
    pub url: String,
    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

/// Parses `URL[;USERNAME;CREDENTIAL]`, the form accepted on the command line
impl FromStr for IceServer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';').map(str::trim);
        let url = parts.next().filter(|u| !u.is_empty()).ok_or("empty ICE server URL")?;
        if !(url.starts_with("stun:") || url.starts_with("stuns:") || url.starts_with("turn:") || url.starts_with("turns:")) {
            return Err(format!("unsupported ICE server scheme: {}", url));
        }

        let server = IceServer::new(url);
        match (parts.next(), parts.next()) {
            (None, None) => Ok(server),
            (Some(username), Some(credential)) => Ok(server.with_credentials(username, credential)),
            _ => Err(format!("expected URL;USERNAME;CREDENTIAL, got {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webrtc_config_default() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_gathering_timeout(), Duration::from_millis(4000));
        assert_eq!(config.connection_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_ice_server() {
        let stun: IceServer = "stun:stun.l.google.com:19302".parse().unwrap();
        assert_eq!(stun.url, "stun:stun.l.google.com:19302");
        assert!(stun.username.is_none());

        let turn: IceServer = "turn:turn.example.com:3478;user;secret".parse().unwrap();
        assert_eq!(turn.username.as_deref(), Some("user"));
        assert_eq!(turn.credential.as_deref(), Some("secret"));

        assert!("http://example.com".parse::<IceServer>().is_err());
        assert!("turn:turn.example.com;user".parse::<IceServer>().is_err());
    }
}
