//! Peer connections backed by webrtc-rs

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::config::IceServer;
use super::engine::{DataChannel, MediaStream, PeerConnection, PeerEvent, PeerFactory, SdpType};
use super::signaling::{ConnectionState, IceCandidate};
use crate::error::{AppError, Result};

/// Keyframe request period for forwarded video
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Creates [`RtcPeerConnection`]s
#[derive(Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>> {
        let peer = RtcPeerConnection::new(ice_servers).await?;
        Ok(Arc::new(peer))
    }
}

/// webrtc-rs peer connection
pub struct RtcPeerConnection {
    id: String,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    /// Closed by webrtc-rs when gathering for the current local description completes
    gather_complete: Mutex<Option<mpsc::Receiver<()>>>,
    remote_stream: MediaStream,
}

impl RtcPeerConnection {
    pub async fn new(ice_servers: &[IceServer]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: vec![server.url.clone()],
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let (events, events_rx) = mpsc::unbounded_channel();
        let peer = Self {
            remote_stream: MediaStream::new(id.clone()),
            id,
            pc: Arc::new(pc),
            events,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            gather_complete: Mutex::new(None),
        };

        peer.setup_event_handlers();
        Ok(peer)
    }

    /// Handlers hold the event sender and weak peer references only, so the
    /// connection is released when the wrapper is dropped.
    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        let id = self.id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let id = id.clone();
                Box::pin(async move {
                    let state = ConnectionState::from(s);
                    info!("Peer {} connection state: {}", id, state);
                    let _ = events.send(PeerEvent::ConnectionStateChanged(state));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let events = events.clone();
                Box::pin(async move {
                    if s == RTCIceGathererState::Complete {
                        let _ = events.send(PeerEvent::IceGatheringComplete);
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    let label = dc.label().to_string();
                    debug!("Remote opened data channel '{}'", label);

                    let msg_events = events.clone();
                    let msg_label = label.clone();
                    dc.on_message(Box::new(move |msg: DataChannelMessage| {
                        let _ = msg_events.send(PeerEvent::DataChannelMessage {
                            label: msg_label.clone(),
                            data: String::from_utf8_lossy(&msg.data).into_owned(),
                        });
                        Box::pin(async {})
                    }));

                    let _ = events.send(PeerEvent::DataChannel(Arc::new(RtcDataChannel { label, dc })));
                })
            }));

        let stream = self.remote_stream.clone();
        let pc_weak = Arc::downgrade(&self.pc);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let stream = stream.clone();
            let pc_weak = pc_weak.clone();
            Box::pin(async move {
                let codec = track.codec();
                let local = Arc::new(TrackLocalStaticRTP::new(
                    codec.capability.clone(),
                    track.id(),
                    stream.id.clone(),
                ));
                info!(
                    "Forwarding {} track {} into stream {}",
                    codec.capability.mime_type,
                    track.id(),
                    stream.id
                );
                stream.add_track(local.clone());

                if track.kind() == RTPCodecType::Video {
                    spawn_keyframe_requests(pc_weak, track.ssrc());
                }
                tokio::spawn(forward_rtp(track, local));
            })
        }));
    }
}

/// Copy RTP packets from a received track into a local track until the
/// remote track ends
async fn forward_rtp(remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) {
    while let Ok((packet, _)) = remote.read_rtp().await {
        if let Err(e) = local.write_rtp(&packet).await {
            if e == webrtc::Error::ErrClosedPipe {
                break;
            }
            debug!("Failed to forward RTP packet: {}", e);
        }
    }
    debug!("Remote track {} ended", remote.id());
}

/// Periodically ask the publisher for a keyframe so viewers joining mid-GOP
/// can start decoding
fn spawn_keyframe_requests(pc: Weak<RTCPeerConnection>, media_ssrc: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(pc) = pc.upgrade() else { break };
            if pc.connection_state() == RTCPeerConnectionState::Closed {
                break;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!("Stopping keyframe requests for ssrc {}: {}", media_ssrc, e);
                break;
            }
        }
    });
}

fn description(kind: SdpType, sdp: String) -> Result<RTCSessionDescription> {
    let desc = match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    desc.map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        for track in stream.tracks() {
            let sender = self
                .pc
                .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to add track: {}", e)))?;

            // RTCP has to be drained for interceptors (NACK, reports) to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        // Must be taken before the description is applied or completion can be missed
        let gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description(kind, sdp)?)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))?;

        *self.gather_complete.lock().await = Some(gather_complete);
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        self.pc
            .set_remote_description(description(kind, sdp)?)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    async fn wait_ice_gathering_complete(&self) {
        let rx = self.gather_complete.lock().await.take();
        if let Some(mut rx) = rx {
            let _ = rx.recv().await;
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn remove_all_senders(&self) -> Result<()> {
        for sender in self.pc.get_senders().await {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to remove track: {}", e)))?;
        }
        Ok(())
    }

    fn remote_stream(&self) -> MediaStream {
        self.remote_stream.clone()
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer {}: {}", self.id, e);
            return Err(AppError::WebRtcError(format!("Failed to close peer connection: {}", e)));
        }
        debug!("Peer {} closed", self.id);
        Ok(())
    }
}

/// Remote-opened webrtc-rs data channel
pub struct RtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| AppError::WebRtcError(format!("Failed to send on '{}': {}", self.label, e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close data channel '{}': {}", self.label, e)))
    }
}
