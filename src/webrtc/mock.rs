//! In-memory peer connections for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::config::IceServer;
use super::engine::{DataChannel, MediaStream, PeerConnection, PeerEvent, PeerFactory, SdpType};
use super::signaling::{ConnectionState, IceCandidate};
use crate::error::{AppError, Result};

/// Offer produced by every mock peer: two m-sections share one stream id
pub const MOCK_OFFER: &str = "v=0\r\n\
    o=- 1 1 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=mid:0\r\n\
    a=msid:mock-stream audio\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    a=mid:1\r\n\
    a=msid:mock-stream video\r\n";

pub const MOCK_ANSWER: &str = "v=0\r\n\
    o=- 2 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=mid:0\r\n";

pub struct MockPeerConnection {
    events: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    pub gathering_completes: AtomicBool,
    pub candidates: Mutex<Vec<IceCandidate>>,
    /// When set, candidates beyond this many are rejected
    pub candidate_limit: Mutex<Option<usize>>,
    pub streams_added: AtomicUsize,
    pub senders_removed: AtomicUsize,
    pub close_count: AtomicUsize,
    pub remote_description: Mutex<Option<String>>,
    local_description: Mutex<Option<String>>,
    remote_stream: MediaStream,
}

impl MockPeerConnection {
    pub fn new() -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            events,
            events_rx: Mutex::new(Some(events_rx)),
            gathering_completes: AtomicBool::new(true),
            candidates: Mutex::new(Vec::new()),
            candidate_limit: Mutex::new(None),
            streams_added: AtomicUsize::new(0),
            senders_removed: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            remote_description: Mutex::new(None),
            local_description: Mutex::new(None),
            remote_stream: MediaStream::new(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Raise an event as if the media engine had
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.emit(PeerEvent::ConnectionStateChanged(state));
    }

    pub fn closed(&self) -> bool {
        self.close_count.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    async fn add_stream(&self, _stream: &MediaStream) -> Result<()> {
        self.streams_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        Ok(MOCK_OFFER.to_string())
    }

    async fn create_answer(&self) -> Result<String> {
        if self.remote_description.lock().is_none() {
            return Err(AppError::Negotiation("no remote description".into()));
        }
        Ok(MOCK_ANSWER.to_string())
    }

    async fn set_local_description(&self, _kind: SdpType, sdp: String) -> Result<()> {
        *self.local_description.lock() = Some(sdp);
        Ok(())
    }

    async fn set_remote_description(&self, _kind: SdpType, sdp: String) -> Result<()> {
        if !sdp.starts_with("v=0") {
            return Err(AppError::Negotiation("Invalid SDP".into()));
        }
        *self.remote_description.lock() = Some(sdp);
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        self.local_description.lock().clone()
    }

    async fn wait_ice_gathering_complete(&self) {
        if !self.gathering_completes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut candidates = self.candidates.lock();
        if let Some(limit) = *self.candidate_limit.lock() {
            if candidates.len() >= limit {
                return Err(AppError::WebRtcError("candidate rejected".into()));
            }
        }
        candidates.push(candidate);
        Ok(())
    }

    async fn remove_all_senders(&self) -> Result<()> {
        self.senders_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remote_stream(&self) -> MediaStream {
        self.remote_stream.clone()
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.emit_state(ConnectionState::Closed);
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    pub open: AtomicBool,
    pub sent: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(label: &str, open: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockPeerConnection`]s and remembering them
#[derive(Default)]
pub struct MockPeerFactory {
    pub peers: Mutex<Vec<Arc<MockPeerConnection>>>,
    /// When set, new peers never finish ICE gathering
    pub stall_gathering: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self) -> Arc<MockPeerConnection> {
        self.peers.lock().last().cloned().unwrap()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create_peer(&self, _ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MockPeerConnection::new());
        peer.gathering_completes
            .store(!self.stall_gathering.load(Ordering::SeqCst), Ordering::SeqCst);
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
