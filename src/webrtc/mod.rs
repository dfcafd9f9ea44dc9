//! WebRTC plumbing shared by WHIP resources and broadcaster viewers
//!
//! ```text
//! WHIP publisher --(offer)--> Resource ---> RtcPeerConnection
//!                                               | on_track: RTP copied into
//!                                               v
//!                                          MediaStream (local tracks)
//!                                               |
//!                     Viewer peer connections <-+ add_stream
//! ```

pub mod config;
pub mod engine;
#[cfg(test)]
pub mod mock;
pub mod peer;
pub mod sdp;
pub mod signaling;

pub use config::{IceServer, WebRtcConfig};
pub use engine::{DataChannel, MediaStream, PeerConnection, PeerEvent, PeerFactory, SdpType};
pub use peer::RtcPeerFactory;
pub use signaling::{ConnectionState, IceCandidate};
