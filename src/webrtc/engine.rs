//! Seam between negotiation logic and the media engine
//!
//! Resources and viewers only talk to peers through [`PeerConnection`] and
//! [`DataChannel`]; the webrtc-rs backed implementation lives in `peer.rs`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::config::IceServer;
use super::signaling::{ConnectionState, IceCandidate};
use crate::error::Result;

/// Notification raised by a peer connection
///
/// Delivered in order on an unbounded queue, so state changes and data
/// channel registrations are never dropped behind a burst of messages.
#[derive(Clone)]
pub enum PeerEvent {
    ConnectionStateChanged(ConnectionState),
    IceGatheringComplete,
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// Text received on a remote-opened data channel
    DataChannelMessage { label: String, data: String },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::ConnectionStateChanged(state) => {
                f.debug_tuple("ConnectionStateChanged").field(state).finish()
            }
            PeerEvent::IceGatheringComplete => write!(f, "IceGatheringComplete"),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::DataChannelMessage { label, data } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Set of local tracks fed by one publisher and shared with its viewers
///
/// Tracks are appended as the publisher's remote tracks arrive, so clones of
/// a stream observe tracks added after they were taken.
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    tracks: Arc<RwLock<Vec<Arc<TrackLocalStaticRTP>>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add_track(&self, track: Arc<TrackLocalStaticRTP>) {
        self.tracks.write().push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.tracks.read().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.track_count())
            .finish()
    }
}

/// A negotiated (or negotiating) peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Take the receiving end of the event queue
    ///
    /// Each peer has a single consumer; later calls return `None`. Events
    /// raised before the queue is taken are buffered.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Add every track of `stream` as a sender
    async fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    async fn create_offer(&self) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    /// Apply a local description; ICE gathering starts here
    async fn set_local_description(&self, kind: SdpType, sdp: String) -> Result<()>;

    async fn set_remote_description(&self, kind: SdpType, sdp: String) -> Result<()>;

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<String>;

    /// Resolves once ICE gathering has completed; callers bound the wait
    async fn wait_ice_gathering_complete(&self);

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Detach all local senders
    async fn remove_all_senders(&self) -> Result<()>;

    /// Stream fed by the tracks this peer receives
    fn remote_stream(&self) -> MediaStream;

    async fn close(&self) -> Result<()>;
}

/// Data channel opened by the remote side
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections configured with a set of ICE servers
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>>;
}
