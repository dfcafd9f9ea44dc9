//! Selective forwarding of published streams to viewers
//!
//! A [`Broadcaster`] owns the channel map. Each channel carries one
//! publisher stream; viewers negotiate against it with the server acting as
//! offerer (POST offer, PUT answer, PATCH candidate, DELETE).

pub mod channel;
pub mod manifest;
pub mod viewer;

pub use channel::{Channel, ChannelEvent, BACKCHANNEL_LABEL, BROADCASTER_LABEL};
pub use viewer::{Viewer, ViewerEvent, ViewerState};

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::webrtc::engine::{DataChannel, MediaStream, PeerFactory};
use crate::webrtc::signaling::ViewerOffer;
use crate::webrtc::{IceServer, WebRtcConfig};
use self::channel::BackChannelMessage;

/// Link relation advertised for the viewer negotiation endpoint
pub const WHPP_REL: &str = "urn:ietf:params:whip:whpp";

/// Broadcaster construction options
#[derive(Debug, Clone)]
pub struct BroadcasterOptions {
    /// Externally reachable base URL, e.g. "http://localhost:8000/broadcaster"
    pub base_url: String,
    /// ICE servers for viewer peer connections
    pub ice_servers: Vec<IceServer>,
    /// Preroll applied to channels created without one
    pub preroll_url: Option<String>,
    pub webrtc: WebRtcConfig,
}

/// Summary of a channel for listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: String,
    pub viewer_count: usize,
    /// Manifest / viewer negotiation URL
    pub resource: String,
}

pub struct Broadcaster {
    options: BroadcasterOptions,
    factory: Arc<dyn PeerFactory>,
    events: Arc<EventBus>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl Broadcaster {
    pub fn new(options: BroadcasterOptions, factory: Arc<dyn PeerFactory>, events: Arc<EventBus>) -> Self {
        Self {
            options,
            factory,
            events,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        self.options.base_url.trim_end_matches('/')
    }

    pub fn channel_url(&self, channel_id: &str) -> String {
        format!("{}/channel/{}", self.base_url(), channel_id)
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(channel_id).cloned()
    }

    fn require_channel(&self, channel_id: &str) -> Result<Arc<Channel>> {
        self.get_channel(channel_id)
            .ok_or_else(|| AppError::NotFound(format!("channel {}", channel_id)))
    }

    /// Bind `stream` to the channel, creating the channel if needed
    pub fn attach(&self, channel_id: &str, stream: MediaStream) -> Arc<Channel> {
        let (channel, created) = {
            let mut channels = self.channels.write();
            match channels.get(channel_id) {
                Some(existing) => {
                    existing.set_stream(stream);
                    (existing.clone(), false)
                }
                None => {
                    let channel = Arc::new(Channel::new(channel_id, stream));
                    if let Some(url) = &self.options.preroll_url {
                        channel.assign_preroll(url.clone());
                    }
                    channels.insert(channel_id.to_string(), channel.clone());
                    (channel, true)
                }
            }
        };

        if created {
            info!("Created channel {}", channel_id);
            self.events.publish(SystemEvent::ChannelCreated {
                channel_id: channel_id.to_string(),
            });
        } else {
            info!("Rebound channel {} to a new stream", channel_id);
        }
        channel
    }

    pub fn assign_back_channel(&self, channel_id: &str, dc: Arc<dyn DataChannel>) -> Result<()> {
        self.require_channel(channel_id)?.assign_back_channel(dc);
        Ok(())
    }

    /// Remove a channel and destroy every viewer still watching it
    pub async fn remove_channel(&self, channel_id: &str) {
        let removed = self.channels.write().remove(channel_id);
        if let Some(channel) = removed {
            self.teardown_channel(channel).await;
        }
    }

    /// Remove a channel only while it is still fed by `stream_id`
    ///
    /// A publisher that was replaced on its channel leaves the channel to the
    /// publisher that took it over. Returns whether the channel was removed.
    pub async fn detach(&self, channel_id: &str, stream_id: &str) -> bool {
        let removed = {
            let mut channels = self.channels.write();
            match channels.get(channel_id) {
                Some(channel) if channel.stream().id == stream_id => channels.remove(channel_id),
                _ => None,
            }
        };
        match removed {
            Some(channel) => {
                self.teardown_channel(channel).await;
                true
            }
            None => {
                debug!("Channel {} no longer fed by {}, keeping it", channel_id, stream_id);
                false
            }
        }
    }

    async fn teardown_channel(&self, channel: Arc<Channel>) {
        let channel_id = channel.id().to_string();
        let viewers = channel.destroy().await;
        let viewers_closed = viewers.len();
        for viewer in viewers {
            if let Err(e) = viewer.destroy().await {
                warn!("Failed to destroy viewer {}: {}", viewer.id(), e);
            }
        }

        info!("Removed channel {} ({} viewers closed)", channel_id, viewers_closed);
        self.events.publish(SystemEvent::ChannelRemoved {
            channel_id,
            viewers_closed,
        });
    }

    /// Start a viewer on `channel_id` and return its id and the server offer
    pub async fn create_viewer(&self, channel_id: &str) -> Result<(String, ViewerOffer)> {
        let channel = self.require_channel(channel_id)?;

        let peer = self.factory.create_peer(&self.options.ice_servers).await?;
        let (viewer, events_rx) = Viewer::new(channel_id, peer, self.options.webrtc.clone());

        let offer = match viewer.handle_post(&channel.stream()).await {
            Ok(offer) => offer,
            Err(e) => {
                if let Err(close_err) = viewer.destroy().await {
                    debug!("Viewer {} cleanup failed: {}", viewer.id(), close_err);
                }
                return Err(e);
            }
        };

        if viewer.is_destroyed() {
            return Err(AppError::Negotiation(format!(
                "viewer {} closed during negotiation",
                viewer.id()
            )));
        }

        // The channel may have been removed while the offer was gathering
        if !channel.add_viewer(viewer.clone()).await {
            if let Err(e) = viewer.destroy().await {
                debug!("Viewer {} cleanup failed: {}", viewer.id(), e);
            }
            return Err(AppError::NotFound(format!("channel {}", channel_id)));
        }
        self.publish_viewer_count(&channel);
        tokio::spawn(pump_viewer_events(
            Arc::downgrade(&channel),
            viewer.id().to_string(),
            events_rx,
            self.events.clone(),
        ));

        Ok((viewer.id().to_string(), offer))
    }

    fn require_viewer(&self, channel_id: &str, viewer_id: &str) -> Result<Arc<Viewer>> {
        self.require_channel(channel_id)?
            .get_viewer(viewer_id)
            .ok_or_else(|| AppError::NotFound(format!("viewer {}", viewer_id)))
    }

    pub async fn viewer_answer(&self, channel_id: &str, viewer_id: &str, answer: String) -> Result<()> {
        self.require_viewer(channel_id, viewer_id)?.handle_put(answer).await
    }

    pub async fn viewer_candidate(&self, channel_id: &str, viewer_id: &str, candidate: String) -> Result<()> {
        self.require_viewer(channel_id, viewer_id)?
            .handle_patch(candidate)
            .await
    }

    /// Remove a viewer from its channel and tear it down
    pub async fn remove_viewer(&self, channel_id: &str, viewer_id: &str) -> Result<()> {
        let channel = self.require_channel(channel_id)?;
        let viewer = channel
            .remove_viewer(viewer_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("viewer {}", viewer_id)))?;
        self.publish_viewer_count(&channel);

        if let Err(e) = viewer.destroy().await {
            warn!("Failed to destroy viewer {}: {}", viewer_id, e);
        }
        Ok(())
    }

    pub fn generate_manifest(&self, channel_id: &str) -> Result<String> {
        let channel = self.require_channel(channel_id)?;
        channel.generate_manifest(&self.channel_url(channel_id), WHPP_REL)
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut list: Vec<ChannelInfo> = self
            .channels
            .read()
            .values()
            .map(|channel| ChannelInfo {
                channel_id: channel.id().to_string(),
                viewer_count: channel.viewer_count(),
                resource: self.channel_url(channel.id()),
            })
            .collect();
        list.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        list
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Remove every channel
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.channels.read().keys().cloned().collect();
        for id in ids {
            self.remove_channel(&id).await;
        }
    }

    fn publish_viewer_count(&self, channel: &Channel) {
        self.events.publish(SystemEvent::ViewersChanged {
            channel_id: channel.id().to_string(),
            viewer_count: channel.viewer_count(),
        });
    }
}

/// Route a viewer's events to its channel until it disconnects
async fn pump_viewer_events(
    channel: Weak<Channel>,
    viewer_id: String,
    mut rx: mpsc::UnboundedReceiver<ViewerEvent>,
    events: Arc<EventBus>,
) {
    while let Some(event) = rx.recv().await {
        let Some(channel) = channel.upgrade() else { break };
        match event {
            ViewerEvent::Connect => {
                events.publish(SystemEvent::ViewerConnected {
                    channel_id: channel.id().to_string(),
                    viewer_id: viewer_id.clone(),
                });
            }
            ViewerEvent::Disconnect => {
                if channel.remove_viewer(&viewer_id).await.is_some() {
                    events.publish(SystemEvent::ViewersChanged {
                        channel_id: channel.id().to_string(),
                        viewer_count: channel.viewer_count(),
                    });
                }
                events.publish(SystemEvent::ViewerDisconnected {
                    channel_id: channel.id().to_string(),
                    viewer_id: viewer_id.clone(),
                });
                break;
            }
            ViewerEvent::Message(data) => {
                let message = serde_json::from_str::<serde_json::Value>(&data)
                    .unwrap_or(serde_json::Value::String(data));
                channel
                    .send_on_back_channel(&BackChannelMessage {
                        viewer_id: Some(&viewer_id),
                        message,
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::engine::PeerEvent;
    use crate::webrtc::mock::{MockDataChannel, MockPeerFactory};
    use crate::webrtc::ConnectionState;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn broadcaster(factory: Arc<MockPeerFactory>) -> Broadcaster {
        Broadcaster::new(
            BroadcasterOptions {
                base_url: "http://localhost:8000/broadcaster/".to_string(),
                ice_servers: vec![],
                preroll_url: None,
                webrtc: WebRtcConfig::default(),
            },
            factory,
            Arc::new(EventBus::new()),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_attach_get_or_create() {
        let b = broadcaster(MockPeerFactory::new());
        let first = b.attach("ch", MediaStream::new("s1"));
        let second = b.attach("ch", MediaStream::new("s2"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.stream().id, "s2");
        assert_eq!(b.channel_count(), 1);
        assert_eq!(b.list_channels()[0].resource, "http://localhost:8000/broadcaster/channel/ch");
    }

    #[tokio::test]
    async fn test_viewer_negotiation() {
        let factory = MockPeerFactory::new();
        let b = broadcaster(factory.clone());
        b.attach("ch", MediaStream::new("s"));

        let (viewer_id, offer) = b.create_viewer("ch").await.unwrap();
        assert_eq!(offer.media_streams[0].stream_id, "mock-stream");
        assert_eq!(b.list_channels()[0].viewer_count, 1);

        b.viewer_answer("ch", &viewer_id, "v=0\r\n".to_string()).await.unwrap();
        b.viewer_candidate("ch", &viewer_id, "candidate:1 1 udp 1 192.0.2.1 5000 typ host".to_string())
            .await
            .unwrap();
        assert_eq!(factory.last().candidates.lock().len(), 1);

        b.remove_viewer("ch", &viewer_id).await.unwrap();
        assert!(factory.last().closed());
        assert_eq!(b.list_channels()[0].viewer_count, 0);

        assert!(matches!(
            b.remove_viewer("ch", &viewer_id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let b = broadcaster(MockPeerFactory::new());
        assert!(matches!(b.create_viewer("nope").await, Err(AppError::NotFound(_))));
        assert!(matches!(b.generate_manifest("nope"), Err(AppError::NotFound(_))));
        assert!(matches!(
            b.viewer_answer("nope", "v", "v=0".into()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_removes_viewer_and_notifies_publisher() {
        let factory = MockPeerFactory::new();
        let b = broadcaster(factory.clone());
        let channel = b.attach("ch", MediaStream::new("s"));
        let back = MockDataChannel::new(BACKCHANNEL_LABEL, true);
        b.assign_back_channel("ch", back.clone()).unwrap();

        b.create_viewer("ch").await.unwrap();
        b.create_viewer("ch").await.unwrap();
        assert_eq!(channel.viewer_count(), 2);

        factory.last().emit_state(ConnectionState::Disconnected);
        settle().await;

        assert_eq!(channel.viewer_count(), 1);
        let counts: Vec<_> = back
            .sent_json()
            .iter()
            .map(|m| m["message"]["viewercount"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn test_viewer_message_forwarded_to_back_channel() {
        let factory = MockPeerFactory::new();
        let b = broadcaster(factory.clone());
        b.attach("ch", MediaStream::new("s"));
        let back = MockDataChannel::new(BACKCHANNEL_LABEL, true);
        b.assign_back_channel("ch", back.clone()).unwrap();

        let (viewer_id, _) = b.create_viewer("ch").await.unwrap();
        back.sent.lock().clear();

        factory.last().emit(PeerEvent::DataChannelMessage {
            label: "reactions".to_string(),
            data: "{\"event\":\"reaction\",\"reaction\":\"clap\"}".to_string(),
        });
        settle().await;

        assert_eq!(
            back.sent_json(),
            vec![serde_json::json!({
                "viewerId": viewer_id,
                "message": {"event": "reaction", "reaction": "clap"}
            })]
        );
    }

    #[tokio::test]
    async fn test_remove_channel_destroys_viewers() {
        let factory = MockPeerFactory::new();
        let b = broadcaster(factory.clone());
        b.attach("ch", MediaStream::new("s"));
        let back = MockDataChannel::new(BACKCHANNEL_LABEL, true);
        b.assign_back_channel("ch", back.clone()).unwrap();

        b.create_viewer("ch").await.unwrap();
        b.create_viewer("ch").await.unwrap();

        b.remove_channel("ch").await;
        assert_eq!(b.channel_count(), 0);
        assert!(back.closed.load(Ordering::SeqCst));
        for peer in factory.peers.lock().iter() {
            assert!(peer.closed());
        }

        // Removing again is a no-op
        b.remove_channel("ch").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_removed_while_viewer_gathers() {
        let factory = MockPeerFactory::new();
        factory.stall_gathering.store(true, Ordering::SeqCst);
        let b = Arc::new(broadcaster(factory.clone()));
        b.attach("ch", MediaStream::new("s"));

        let joining = {
            let b = b.clone();
            tokio::spawn(async move { b.create_viewer("ch").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.remove_channel("ch").await;

        let result = joining.await.unwrap();
        assert!(matches!(result, Err(AppError::NotFound(_))));
        let peer = factory.last();
        assert!(peer.closed());

        // Nothing is left behind to fire later
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(peer.close_count.load(Ordering::SeqCst), 1);
        assert_eq!(b.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_keeps_channel_taken_over_by_new_stream() {
        let factory = MockPeerFactory::new();
        let b = broadcaster(factory.clone());
        b.attach("ch", MediaStream::new("first"));
        b.create_viewer("ch").await.unwrap();
        b.attach("ch", MediaStream::new("second"));

        assert!(!b.detach("ch", "first").await);
        let channel = b.get_channel("ch").unwrap();
        assert_eq!(channel.viewer_count(), 1);
        assert!(!factory.last().closed());

        assert!(b.detach("ch", "second").await);
        assert!(b.get_channel("ch").is_none());
        assert!(factory.last().closed());
    }

    #[tokio::test]
    async fn test_default_preroll_applies_to_new_channels() {
        let b = Broadcaster::new(
            BroadcasterOptions {
                base_url: "http://localhost:8000/broadcaster".to_string(),
                ice_servers: vec![],
                preroll_url: Some("http://ads/preroll.mpd".to_string()),
                webrtc: WebRtcConfig::default(),
            },
            MockPeerFactory::new(),
            Arc::new(EventBus::new()),
        );
        b.attach("ch", MediaStream::new("s"));

        let xml = b.generate_manifest("ch").unwrap();
        assert!(xml.contains("http://ads/preroll.mpd"));
        assert!(xml.contains("xlink:href=\"http://localhost:8000/broadcaster/channel/ch\""));
        assert!(xml.contains(WHPP_REL));
    }
}
