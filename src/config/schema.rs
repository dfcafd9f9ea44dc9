use serde::{Deserialize, Serialize};

use crate::webrtc::config::{IceServer, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// WHIP endpoint settings
    pub whip: WhipConfig,
    /// Broadcaster (viewer fanout) settings
    pub broadcaster: BroadcasterConfig,
    /// Peer connection timeouts
    pub webrtc: WebRtcConfig,
}

/// Web server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
    /// Path prefix the WHIP API is mounted under (e.g. "/api/v2")
    pub prefix: String,
    /// Externally reachable base URL used in `Location` headers
    /// (defaults to http://{bind_address}:{http_port})
    pub public_url: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
            prefix: "/api/v2".to_string(),
            public_url: None,
        }
    }
}

impl WebConfig {
    /// Base URL of this server without a trailing slash
    pub fn server_address(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.bind_address, self.http_port),
        }
    }

    /// Prefix normalized to "" or "/segment[/segment]"
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// WHIP endpoint configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhipConfig {
    /// Shared secret gating ICE server disclosure
    pub api_key: Option<String>,
    /// ICE servers used by ingest peer connections and advertised in `Link` headers
    pub ice_servers: Vec<IceServer>,
}

/// Broadcaster configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Enable the viewer fanout endpoints
    pub enabled: bool,
    /// Path the viewer endpoints are mounted under
    pub path: String,
    /// Externally reachable base URL of the broadcaster
    /// (defaults to the web server address + path)
    pub public_url: Option<String>,
    /// Default preroll manifest applied to new channels
    pub preroll_url: Option<String>,
    /// ICE servers for viewer peer connections
    pub ice_servers: Vec<IceServer>,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/broadcaster".to_string(),
            public_url: None,
            preroll_url: None,
            ice_servers: vec![],
        }
    }
}

impl BroadcasterConfig {
    pub fn normalized_path(&self) -> String {
        format!("/{}", self.path.trim().trim_matches('/'))
    }
}
