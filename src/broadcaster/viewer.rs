//! A single viewer peer connection fed from a channel's stream

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{debug_throttled, warn_throttled};
use crate::error::{AppError, Result};
use crate::utils::{CancellableTimer, LogThrottler};
use crate::webrtc::engine::{DataChannel, MediaStream, PeerConnection, PeerEvent, SdpType};
use crate::webrtc::sdp;
use crate::webrtc::signaling::{ConnectionState, IceCandidate, ViewerMediaStream, ViewerOffer};
use crate::webrtc::WebRtcConfig;

/// Viewer negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    New,
    Offered,
    GatheringIce,
    AwaitingAnswer,
    Connected,
    Disconnected,
    Closed,
}

impl ViewerState {
    fn is_final(&self) -> bool {
        matches!(self, ViewerState::Disconnected | ViewerState::Closed)
    }
}

/// Notification from a viewer to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Offer handed out, viewer is waiting for the answer
    Connect,
    /// Viewer is gone; raised exactly once
    Disconnect,
    /// Text received on one of the viewer's data channels
    Message(String),
}

pub struct Viewer {
    viewer_id: String,
    channel_id: String,
    peer: Arc<dyn PeerConnection>,
    config: WebRtcConfig,
    state: RwLock<ViewerState>,
    /// Remote-opened data channels, in arrival order
    data_channels: RwLock<Vec<Arc<dyn DataChannel>>>,
    connection_timer: Mutex<Option<CancellableTimer>>,
    destroyed: AtomicBool,
    disconnect_raised: AtomicBool,
    events: mpsc::UnboundedSender<ViewerEvent>,
    send_throttler: LogThrottler,
}

impl Viewer {
    /// Wrap a fresh peer connection; events are delivered on the returned receiver
    pub fn new(
        channel_id: impl Into<String>,
        peer: Arc<dyn PeerConnection>,
        config: WebRtcConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ViewerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let peer_events = peer.take_events();

        let viewer = Arc::new(Self {
            viewer_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            peer,
            config,
            state: RwLock::new(ViewerState::New),
            data_channels: RwLock::new(Vec::new()),
            connection_timer: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            disconnect_raised: AtomicBool::new(false),
            events,
            send_throttler: LogThrottler::default(),
        });

        match peer_events {
            Some(rx) => {
                tokio::spawn(run_peer_events(Arc::downgrade(&viewer), rx));
            }
            None => warn!("Viewer {} peer events already taken", viewer.viewer_id),
        }
        (viewer, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.viewer_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> ViewerState {
        *self.state.read()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn data_channel_labels(&self) -> Vec<String> {
        self.data_channels.read().iter().map(|dc| dc.label().to_string()).collect()
    }

    fn set_state(&self, next: ViewerState) {
        let mut state = self.state.write();
        if !state.is_final() {
            *state = next;
        }
    }

    fn emit(&self, event: ViewerEvent) {
        let _ = self.events.send(event);
    }

    fn raise_disconnect(&self) {
        if !self.disconnect_raised.swap(true, Ordering::SeqCst) {
            self.emit(ViewerEvent::Disconnect);
        }
    }

    /// Offer `stream` to the viewer
    ///
    /// Waits for ICE gathering up to the configured timeout, then returns
    /// whatever candidates were gathered. Arms the connection timeout.
    pub async fn handle_post(self: &Arc<Self>, stream: &MediaStream) -> Result<ViewerOffer> {
        debug!(
            "Viewer {} adding {} tracks from {}",
            self.viewer_id,
            stream.track_count(),
            self.channel_id
        );
        self.peer.add_stream(stream).await?;

        let offer = self.peer.create_offer().await?;
        self.set_state(ViewerState::Offered);
        self.peer.set_local_description(SdpType::Offer, offer).await?;

        self.set_state(ViewerState::GatheringIce);
        let gathering = tokio::time::timeout(
            self.config.ice_gathering_timeout(),
            self.peer.wait_ice_gathering_complete(),
        );
        if gathering.await.is_err() {
            info!("Viewer {} ICE gathering timed out, sending what we have", self.viewer_id);
        }

        let offer = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("No local description after offer".into()))?;
        let media_streams = sdp::media_stream_ids(&offer)?
            .into_iter()
            .map(|stream_id| ViewerMediaStream { stream_id })
            .collect();

        self.set_state(ViewerState::AwaitingAnswer);
        self.arm_connection_timer();
        self.emit(ViewerEvent::Connect);

        Ok(ViewerOffer { offer, media_streams })
    }

    fn arm_connection_timer(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let weak = Arc::downgrade(self);
        let timer = CancellableTimer::start(self.config.connection_timeout(), move || async move {
            if let Some(viewer) = weak.upgrade() {
                viewer.on_connection_timeout().await;
            }
        });
        *self.connection_timer.lock() = Some(timer);
    }

    async fn on_connection_timeout(&self) {
        if self.state() == ViewerState::Connected {
            return;
        }
        warn!("Viewer {} connection timeout", self.viewer_id);
        if let Err(e) = self.destroy().await {
            warn!("Viewer {} teardown after timeout failed: {}", self.viewer_id, e);
        }
        self.raise_disconnect();
    }

    /// Apply the viewer's SDP answer
    pub async fn handle_put(&self, answer: String) -> Result<()> {
        self.peer.set_remote_description(SdpType::Answer, answer).await
    }

    /// Apply one trickled candidate
    pub async fn handle_patch(&self, candidate: String) -> Result<()> {
        sdp::validate_candidate(&candidate)?;
        self.peer.add_ice_candidate(IceCandidate::new(candidate)).await
    }

    /// Send `message` as JSON on the data channel labelled `label`
    ///
    /// Dropped when the channel is missing or not open.
    pub async fn send<T: Serialize + Sync + ?Sized>(&self, label: &str, message: &T) {
        let channel = self
            .data_channels
            .read()
            .iter()
            .find(|dc| dc.label() == label)
            .cloned();

        let Some(channel) = channel else {
            debug_throttled!(
                self.send_throttler,
                label,
                "Viewer {} has no channel '{}', not sending",
                self.viewer_id,
                label
            );
            return;
        };
        if !channel.is_open() {
            debug_throttled!(
                self.send_throttler,
                label,
                "Viewer {} channel '{}' not open, not sending",
                self.viewer_id,
                label
            );
            return;
        }

        match serde_json::to_string(message) {
            Ok(text) => {
                match channel.send_text(text).await {
                    Ok(()) => self.send_throttler.clear(label),
                    Err(e) => warn_throttled!(
                        self.send_throttler,
                        label,
                        "Viewer {} send on '{}' failed: {}",
                        self.viewer_id,
                        label,
                        e
                    ),
                }
            }
            Err(e) => warn!("Failed to serialize message for '{}': {}", label, e),
        }
    }

    /// Detach tracks, close data channels and the peer connection
    ///
    /// Idempotent; safe to call from the viewer's own event handlers.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(timer) = self.connection_timer.lock().take() {
            timer.cancel();
        }
        self.set_state(ViewerState::Closed);
        info!("Destroying viewer {} of {}", self.viewer_id, self.channel_id);

        let mut result = self.peer.remove_all_senders().await;

        let channels: Vec<_> = self.data_channels.read().clone();
        for dc in channels {
            if let Err(e) = dc.close().await {
                debug!("Viewer {} failed to close '{}': {}", self.viewer_id, dc.label(), e);
            }
        }

        let closed = self.peer.close().await;
        if result.is_ok() {
            result = closed;
        }
        result
    }

    /// Returns `true` when the event loop should stop
    async fn handle_peer_event(&self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::ConnectionStateChanged(state) => {
                debug!("Viewer {} connection state: {}", self.viewer_id, state);
                match state {
                    ConnectionState::Connected => {
                        if let Some(timer) = self.connection_timer.lock().take() {
                            timer.cancel();
                        }
                        self.set_state(ViewerState::Connected);
                        info!("Viewer {} connected to {}", self.viewer_id, self.channel_id);
                    }
                    ConnectionState::Disconnected | ConnectionState::Failed => {
                        info!("Viewer {} disconnected ({})", self.viewer_id, state);
                        self.set_state(ViewerState::Disconnected);
                        if let Err(e) = self.destroy().await {
                            warn!("Viewer {} teardown failed: {}", self.viewer_id, e);
                        }
                        self.raise_disconnect();
                        return true;
                    }
                    ConnectionState::Closed => return true,
                    _ => {}
                }
            }
            PeerEvent::DataChannel(dc) => {
                debug!("Viewer {} opened data channel '{}'", self.viewer_id, dc.label());
                self.data_channels.write().push(dc);
            }
            PeerEvent::DataChannelMessage { label, data } => {
                debug!("Viewer {} message on '{}'", self.viewer_id, label);
                self.emit(ViewerEvent::Message(data));
            }
            PeerEvent::IceGatheringComplete => {
                debug!("Viewer {} ICE candidates gathered", self.viewer_id);
            }
        }
        false
    }
}

async fn run_peer_events(viewer: Weak<Viewer>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(viewer) = viewer.upgrade() else { break };
        if viewer.handle_peer_event(event).await {
            break;
        }
    }
}
