//! Signaling payloads exchanged with WHIP publishers and broadcaster viewers

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// ICE candidate handed to a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute value (without the leading "a=")
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Media stream identifier announced to a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerMediaStream {
    pub stream_id: String,
}

/// Server offer returned from a viewer POST
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerOffer {
    pub offer: String,
    pub media_streams: Vec<ViewerMediaStream>,
}

/// Viewer answer (PUT body)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerAnswerRequest {
    pub answer: String,
}

/// Trickled viewer candidate (PATCH body)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerCandidateRequest {
    pub candidate: String,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer will not recover on its own
    ///
    /// `Disconnected` is not terminal: ICE may still reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_offer_json() {
        let offer = ViewerOffer {
            offer: "v=0\r\n".to_string(),
            media_streams: vec![ViewerMediaStream {
                stream_id: "stream-a".to_string(),
            }],
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["offer"], "v=0\r\n");
        assert_eq!(json["mediaStreams"][0]["streamId"], "stream-a");
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["usernameFragment"], "abcd");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Connected), ConnectionState::Connected);
    }
}
