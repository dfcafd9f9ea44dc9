//! Channel: one published stream and the viewers watching it

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::manifest;
use super::viewer::Viewer;
use crate::error::Result;
use crate::webrtc::engine::{DataChannel, MediaStream};

/// Label of the viewer data channel that receives channel-wide messages
pub const BROADCASTER_LABEL: &str = "broadcaster";

/// Label of the publisher data channel used as back-channel
pub const BACKCHANNEL_LABEL: &str = "backchannel";

/// Server-generated channel events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum ChannelEvent {
    #[serde(rename = "viewerschange")]
    ViewersChange { viewercount: usize },
}

/// Message sent to the publisher over the back-channel
#[derive(Debug, Serialize)]
pub struct BackChannelMessage<'a, T: Serialize> {
    #[serde(rename = "viewerId", skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<&'a str>,
    pub message: T,
}

/// Message fanned out to viewers
#[derive(Debug, Serialize)]
pub struct BroadcastMessage<T: Serialize> {
    pub message: T,
}

pub struct Channel {
    channel_id: String,
    stream: RwLock<MediaStream>,
    viewers: RwLock<HashMap<String, Arc<Viewer>>>,
    back_channel: RwLock<Option<Arc<dyn DataChannel>>>,
    preroll: RwLock<Option<String>>,
    /// Set by `destroy`; a closed channel accepts no viewers
    closed: AtomicBool,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, stream: MediaStream) -> Self {
        Self {
            channel_id: channel_id.into(),
            stream: RwLock::new(stream),
            viewers: RwLock::new(HashMap::new()),
            back_channel: RwLock::new(None),
            preroll: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.channel_id
    }

    pub fn stream(&self) -> MediaStream {
        self.stream.read().clone()
    }

    /// Rebind the channel to a new publisher stream
    pub fn set_stream(&self, stream: MediaStream) {
        *self.stream.write() = stream;
    }

    pub fn assign_back_channel(&self, dc: Arc<dyn DataChannel>) {
        info!("[{}] Assigning back-channel '{}'", self.channel_id, dc.label());
        *self.back_channel.write() = Some(dc);
    }

    pub fn assign_preroll(&self, mpd_url: impl Into<String>) {
        *self.preroll.write() = Some(mpd_url.into());
    }

    pub fn preroll(&self) -> Option<String> {
        self.preroll.read().clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().len()
    }

    pub fn get_viewer(&self, viewer_id: &str) -> Option<Arc<Viewer>> {
        self.viewers.read().get(viewer_id).cloned()
    }

    pub fn viewers(&self) -> Vec<Arc<Viewer>> {
        self.viewers.read().values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Add a viewer; returns `false` without adding it once the channel is closed
    pub async fn add_viewer(&self, viewer: Arc<Viewer>) -> bool {
        let size = {
            let mut viewers = self.viewers.write();
            // Checked under the lock `destroy` drains with
            if self.is_closed() {
                return false;
            }
            viewers.insert(viewer.id().to_string(), viewer.clone());
            viewers.len()
        };
        info!("[{}] Added viewer {}, size {}", self.channel_id, viewer.id(), size);
        self.on_viewers_change().await;
        true
    }

    /// Remove a viewer; notifies only when it was a member
    pub async fn remove_viewer(&self, viewer_id: &str) -> Option<Arc<Viewer>> {
        let removed = self.viewers.write().remove(viewer_id);
        if removed.is_some() {
            info!("[{}] Removed viewer {}", self.channel_id, viewer_id);
            self.on_viewers_change().await;
        }
        removed
    }

    /// Report the live viewer count to the publisher and every viewer
    pub async fn on_viewers_change(&self) {
        let event = ChannelEvent::ViewersChange {
            viewercount: self.viewer_count(),
        };
        self.send_on_back_channel(&BackChannelMessage {
            viewer_id: None,
            message: &event,
        })
        .await;
        self.broadcast_message(BROADCASTER_LABEL, &BroadcastMessage { message: &event })
            .await;
    }

    /// Send to the publisher; dropped if there is no open back-channel
    pub async fn send_on_back_channel<T: Serialize + Sync>(&self, message: &BackChannelMessage<'_, T>) {
        let dc = self.back_channel.read().clone();
        let Some(dc) = dc else {
            debug!("[{}] No back-channel, not sending", self.channel_id);
            return;
        };
        if !dc.is_open() {
            debug!("[{}] Back-channel not open, not sending", self.channel_id);
            return;
        }

        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = dc.send_text(text).await {
                    debug!("[{}] Back-channel send failed: {}", self.channel_id, e);
                }
            }
            Err(e) => debug!("[{}] Failed to serialize back-channel message: {}", self.channel_id, e),
        }
    }

    /// Send `message` to every current viewer on data channel `label`
    pub async fn broadcast_message<T: Serialize + Sync + ?Sized>(&self, label: &str, message: &T) {
        let viewers = self.viewers();
        join_all(viewers.iter().map(|viewer| viewer.send(label, message))).await;
    }

    pub fn generate_manifest(&self, link: &str, rel: &str) -> Result<String> {
        manifest::generate(link, rel, self.preroll().as_deref())
    }

    /// Close the back-channel and hand back the viewers still attached
    pub async fn destroy(&self) -> Vec<Arc<Viewer>> {
        let viewers: Vec<_> = {
            let mut viewers = self.viewers.write();
            self.closed.store(true, Ordering::SeqCst);
            viewers.drain().map(|(_, viewer)| viewer).collect()
        };

        let dc = self.back_channel.write().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("[{}] Failed to close back-channel: {}", self.channel_id, e);
            }
        }
        viewers
    }
}
