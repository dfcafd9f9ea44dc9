//! System event types

use serde::{Deserialize, Serialize};

/// Lifecycle events of resources, channels and viewers
///
/// Serialized as `{ "event": "resource.created", "data": { ... } }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A WHIP resource finished negotiation and was registered
    #[serde(rename = "resource.created")]
    ResourceCreated {
        resource_id: String,
        resource_type: String,
        channel_id: Option<String>,
    },

    /// A WHIP resource was torn down
    #[serde(rename = "resource.deleted")]
    ResourceDeleted { resource_id: String },

    #[serde(rename = "channel.created")]
    ChannelCreated { channel_id: String },

    #[serde(rename = "channel.removed")]
    ChannelRemoved {
        channel_id: String,
        /// Viewers destroyed together with the channel
        viewers_closed: usize,
    },

    /// Viewer answered and was added to a channel
    #[serde(rename = "viewer.connected")]
    ViewerConnected { channel_id: String, viewer_id: String },

    #[serde(rename = "viewer.disconnected")]
    ViewerDisconnected { channel_id: String, viewer_id: String },

    /// Channel membership changed
    #[serde(rename = "viewer.count_changed")]
    ViewersChanged { channel_id: String, viewer_count: usize },
}

impl SystemEvent {
    /// Event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ResourceCreated { .. } => "resource.created",
            Self::ResourceDeleted { .. } => "resource.deleted",
            Self::ChannelCreated { .. } => "channel.created",
            Self::ChannelRemoved { .. } => "channel.removed",
            Self::ViewerConnected { .. } => "viewer.connected",
            Self::ViewerDisconnected { .. } => "viewer.disconnected",
            Self::ViewersChanged { .. } => "viewer.count_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = SystemEvent::ViewersChanged {
            channel_id: "ch".to_string(),
            viewer_count: 2,
        };
        assert_eq!(event.event_name(), "viewer.count_changed");
    }

    #[test]
    fn test_serialization() {
        let event = SystemEvent::ResourceDeleted {
            resource_id: "r1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "resource.deleted");
        assert_eq!(json["data"]["resource_id"], "r1");

        let back: SystemEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, SystemEvent::ResourceDeleted { .. }));
    }
}
