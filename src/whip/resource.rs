//! WHIP resource: one publisher's negotiated peer connection

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::links;
use crate::broadcaster::{Broadcaster, BACKCHANNEL_LABEL};
use crate::error::{AppError, Result};
use crate::webrtc::engine::{PeerConnection, PeerEvent, SdpType};
use crate::webrtc::sdp;
use crate::webrtc::{ConnectionState, IceServer};

/// Kind of resource, selected by the `{type}` path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Publishes into a broadcaster channel
    Broadcaster,
    /// Negotiates and discards the media
    Dummy,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Broadcaster => "broadcaster",
            ResourceType::Dummy => "dummy",
        }
    }
}

impl FromStr for ResourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broadcaster" => Ok(ResourceType::Broadcaster),
            "dummy" => Ok(ResourceType::Dummy),
            other => Err(AppError::Creation(format!("Unsupported resource type: {}", other))),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Negotiating,
    Active,
    Closed,
}

/// Query parameters of a create request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceParams {
    #[serde(rename = "channelId")]
    pub channel_id: Option<String>,
    /// Base64 encoded JSON [`ResourceOptions`]
    pub b64json: Option<String>,
}

/// Options carried in `b64json`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOptions {
    /// Preroll manifest played before the live stream
    pub mpd_url: Option<String>,
}

impl ResourceParams {
    pub fn options(&self) -> Result<ResourceOptions> {
        let Some(encoded) = self.b64json.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(ResourceOptions::default());
        };
        let json = BASE64
            .decode(encoded)
            .map_err(|e| AppError::Creation(format!("Invalid b64json: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| AppError::Creation(format!("Invalid b64json options: {}", e)))
    }
}

/// Collaborators a resource is created with
#[derive(Clone)]
pub struct ResourceContext {
    pub ice_servers: Vec<IceServer>,
    pub ice_gathering_timeout: Duration,
    pub broadcaster: Option<Arc<Broadcaster>>,
    /// Receives the id of a resource whose publisher connection failed
    pub terminated: Option<mpsc::UnboundedSender<String>>,
}

pub struct Resource {
    id: String,
    resource_type: ResourceType,
    channel_id: String,
    options: ResourceOptions,
    peer: Arc<dyn PeerConnection>,
    ice_servers: Vec<IceServer>,
    ice_gathering_timeout: Duration,
    broadcaster: Option<Arc<Broadcaster>>,
    sdp_offer: String,
    sdp_answer: RwLock<Option<String>>,
    /// Held for the whole compare-and-swap of a PATCH
    etag: Mutex<String>,
    state: RwLock<ResourceState>,
    attached: AtomicBool,
    terminated: Option<mpsc::UnboundedSender<String>>,
}

fn generate_etag() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn rotate_etag(current: &mut String) -> String {
    let mut next = generate_etag();
    while next == *current {
        next = generate_etag();
    }
    *current = next.clone();
    next
}

/// Strip quoting and weak prefix from an `If-Match`/`ETag` header value
fn normalize_etag(value: &str) -> &str {
    let value = value.trim();
    value.strip_prefix("W/").unwrap_or(value).trim_matches('"')
}

impl Resource {
    pub fn new(
        resource_type: ResourceType,
        params: &ResourceParams,
        sdp_offer: String,
        peer: Arc<dyn PeerConnection>,
        ctx: ResourceContext,
    ) -> Result<Arc<Self>> {
        if let Err(e) = sdp::parse_session(&sdp_offer) {
            return Err(AppError::Creation(format!("Malformed SDP offer: {}", e)));
        }
        let options = params.options()?;

        let id = uuid::Uuid::new_v4().to_string();
        let channel_id = params
            .channel_id
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| id.clone());

        Ok(Arc::new(Self {
            id,
            resource_type,
            channel_id,
            options,
            peer,
            ice_servers: ctx.ice_servers,
            ice_gathering_timeout: ctx.ice_gathering_timeout,
            broadcaster: ctx.broadcaster,
            sdp_offer,
            sdp_answer: RwLock::new(None),
            etag: Mutex::new(generate_etag()),
            state: RwLock::new(ResourceState::Negotiating),
            attached: AtomicBool::new(false),
            terminated: ctx.terminated,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> ResourceState {
        *self.state.read()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn sdp_offer(&self) -> &str {
        &self.sdp_offer
    }

    pub fn sdp_answer(&self) -> Option<String> {
        self.sdp_answer.read().clone()
    }

    pub async fn etag(&self) -> String {
        self.etag.lock().await.clone()
    }

    /// `{prefix}/whip/{type}/{id}`
    pub fn locator(&self, prefix: &str) -> String {
        format!("{}/whip/{}/{}", prefix, self.resource_type, self.id)
    }

    fn broadcaster(&self) -> Option<&Arc<Broadcaster>> {
        match self.resource_type {
            ResourceType::Broadcaster => self.broadcaster.as_ref(),
            ResourceType::Dummy => None,
        }
    }

    /// Answer the publisher's offer
    ///
    /// Returns the SDP answer containing the candidates gathered within the
    /// gathering timeout. On success the resource is active and, for
    /// broadcaster resources, its incoming stream is attached to the channel.
    pub async fn negotiate(self: &Arc<Self>) -> Result<String> {
        match self.peer.take_events() {
            Some(rx) => {
                tokio::spawn(run_publisher_events(Arc::downgrade(self), rx));
            }
            None => warn!("Resource {} peer events already taken", self.id),
        }

        self.peer
            .set_remote_description(SdpType::Offer, self.sdp_offer.clone())
            .await
            .map_err(creation)?;
        let answer = self.peer.create_answer().await.map_err(creation)?;
        self.peer
            .set_local_description(SdpType::Answer, answer)
            .await
            .map_err(creation)?;

        if tokio::time::timeout(self.ice_gathering_timeout, self.peer.wait_ice_gathering_complete())
            .await
            .is_err()
        {
            info!("Resource {} ICE gathering timed out, answering with what we have", self.id);
        }

        let answer = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| AppError::Creation("No local description after answer".into()))?;

        {
            let mut state = self.state.write();
            if *state == ResourceState::Closed {
                return Err(AppError::Creation("Resource closed during negotiation".into()));
            }
            *state = ResourceState::Active;
        }
        *self.sdp_answer.write() = Some(answer.clone());

        if let Some(broadcaster) = self.broadcaster() {
            let channel = broadcaster.attach(&self.channel_id, self.peer.remote_stream());
            self.attached.store(true, Ordering::SeqCst);
            if let Some(mpd_url) = &self.options.mpd_url {
                channel.assign_preroll(mpd_url.clone());
            }
        }

        info!("Resource {} ({}) active", self.id, self.resource_type);
        Ok(answer)
    }

    /// Apply a trickle-ICE fragment if `presented_etag` is current
    ///
    /// Returns the new ETag. A missing or stale ETag is a conflict and leaves
    /// the resource untouched, as does a fragment with an unparsable
    /// candidate. If the peer rejects a candidate after others were applied
    /// the ETag still rotates, so the caller's tag goes stale.
    pub async fn patch(&self, fragment: &str, presented_etag: Option<&str>) -> Result<String> {
        let mut etag = self.etag.lock().await;
        if self.state() == ResourceState::Closed {
            return Err(AppError::NotFound(format!("resource {}", self.id)));
        }
        if presented_etag.map(normalize_etag) != Some(etag.as_str()) {
            return Err(AppError::Conflict(self.id.clone()));
        }

        let candidates = sdp::parse_trickle_fragment(fragment);
        for candidate in &candidates {
            sdp::validate_candidate(&candidate.candidate)?;
        }

        debug!("Resource {} applying {} trickled candidates", self.id, candidates.len());
        let mut applied = 0;
        for candidate in candidates {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                if applied > 0 {
                    rotate_etag(&mut etag);
                }
                return Err(e);
            }
            applied += 1;
        }

        Ok(rotate_etag(&mut etag))
    }

    /// Extension `Link` entries advertised on creation
    pub fn protocol_extensions(&self) -> Vec<String> {
        match self.broadcaster() {
            Some(broadcaster) => vec![links::channel_link(&broadcaster.channel_url(&self.channel_id))],
            None => Vec::new(),
        }
    }

    /// Tear down; later calls are no-ops
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == ResourceState::Closed {
                return Ok(());
            }
            *state = ResourceState::Closed;
        }

        if self.attached.swap(false, Ordering::SeqCst) {
            if let Some(broadcaster) = self.broadcaster() {
                broadcaster
                    .detach(&self.channel_id, &self.peer.remote_stream().id)
                    .await;
            }
        }

        info!("Resource {} closed", self.id);
        self.peer.close().await
    }
}

fn creation(e: AppError) -> AppError {
    match e {
        AppError::Creation(_) => e,
        other => AppError::Creation(other.to_string()),
    }
}

/// Hand the publisher's back-channel to its broadcaster channel and report
/// a failed publisher connection
async fn run_publisher_events(
    resource: Weak<Resource>,
    mut rx: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(resource) = resource.upgrade() else { break };

        match event {
            PeerEvent::DataChannel(dc) if dc.label() == BACKCHANNEL_LABEL => {
                let Some(broadcaster) = resource.broadcaster() else { continue };
                if let Err(e) = broadcaster.assign_back_channel(&resource.channel_id, dc) {
                    warn!("Resource {} back-channel not assigned: {}", resource.id, e);
                }
            }
            PeerEvent::DataChannel(dc) => {
                debug!("Resource {} ignoring data channel '{}'", resource.id, dc.label());
            }
            PeerEvent::ConnectionStateChanged(ConnectionState::Closed) => break,
            PeerEvent::ConnectionStateChanged(state) if state.is_terminal() => {
                warn!("Publisher {} connection {}, tearing down", resource.id, state);
                if let Some(terminated) = &resource.terminated {
                    let _ = terminated.send(resource.id.clone());
                }
                break;
            }
            PeerEvent::ConnectionStateChanged(state) => {
                info!("Publisher {} connection state: {}", resource.id, state);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::BroadcasterOptions;
    use crate::events::EventBus;
    use crate::webrtc::mock::{MockDataChannel, MockPeerConnection, MockPeerFactory, MOCK_OFFER};
    use crate::webrtc::WebRtcConfig;

    fn broadcaster() -> Arc<Broadcaster> {
        Arc::new(Broadcaster::new(
            BroadcasterOptions {
                base_url: "http://localhost:8000/broadcaster".to_string(),
                ice_servers: vec![],
                preroll_url: None,
                webrtc: WebRtcConfig::default(),
            },
            MockPeerFactory::new(),
            Arc::new(EventBus::new()),
        ))
    }

    fn ctx(broadcaster: Option<Arc<Broadcaster>>) -> ResourceContext {
        ResourceContext {
            ice_servers: vec![],
            ice_gathering_timeout: Duration::from_millis(4000),
            broadcaster,
            terminated: None,
        }
    }

    fn params(channel_id: Option<&str>, b64json: Option<String>) -> ResourceParams {
        ResourceParams {
            channel_id: channel_id.map(str::to_string),
            b64json,
        }
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!("broadcaster".parse::<ResourceType>().unwrap(), ResourceType::Broadcaster);
        assert_eq!("dummy".parse::<ResourceType>().unwrap(), ResourceType::Dummy);
        assert!(matches!("sfu".parse::<ResourceType>(), Err(AppError::Creation(_))));
    }

    #[test]
    fn test_options_decode() {
        let encoded = BASE64.encode(r#"{"mpdUrl":"http://ads/preroll.mpd"}"#);
        let options = params(None, Some(encoded)).options().unwrap();
        assert_eq!(options.mpd_url.as_deref(), Some("http://ads/preroll.mpd"));

        assert!(params(None, Some("%%%".into())).options().is_err());
        assert_eq!(params(None, None).options().unwrap(), ResourceOptions::default());
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag(" abc "), "abc");
    }

    #[test]
    fn test_malformed_offer_rejected() {
        let result = Resource::new(
            ResourceType::Dummy,
            &params(None, None),
            "hello".to_string(),
            Arc::new(MockPeerConnection::new()),
            ctx(None),
        );
        assert!(matches!(result, Err(AppError::Creation(_))));
    }

    #[tokio::test]
    async fn test_negotiate_attaches_to_channel() {
        let b = broadcaster();
        let peer = Arc::new(MockPeerConnection::new());
        let encoded = BASE64.encode(r#"{"mpdUrl":"http://ads/preroll.mpd"}"#);
        let resource = Resource::new(
            ResourceType::Broadcaster,
            &params(Some("ch"), Some(encoded)),
            MOCK_OFFER.to_string(),
            peer.clone(),
            ctx(Some(b.clone())),
        )
        .unwrap();

        let answer = resource.negotiate().await.unwrap();
        assert!(answer.starts_with("v=0"));
        assert_eq!(resource.state(), ResourceState::Active);
        assert_eq!(resource.sdp_answer().as_deref(), Some(answer.as_str()));

        let channel = b.get_channel("ch").unwrap();
        assert_eq!(channel.preroll().as_deref(), Some("http://ads/preroll.mpd"));
        assert_eq!(
            resource.protocol_extensions(),
            vec!["<http://localhost:8000/broadcaster/channel/ch>; rel=\"urn:ietf:params:whip:eyevinn-wrtc-channel\"".to_string()]
        );

        // Publisher back-channel reaches the channel
        let back = MockDataChannel::new(BACKCHANNEL_LABEL, true);
        peer.emit(PeerEvent::DataChannel(back.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.on_viewers_change().await;
        assert_eq!(back.sent_json().len(), 1);

        resource.destroy().await.unwrap();
        assert!(b.get_channel("ch").is_none());
        assert!(back.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_channel_defaults_to_resource_id() {
        let resource = Resource::new(
            ResourceType::Broadcaster,
            &params(None, None),
            MOCK_OFFER.to_string(),
            Arc::new(MockPeerConnection::new()),
            ctx(None),
        )
        .unwrap();
        assert_eq!(resource.channel_id(), resource.id());
        assert!(resource.protocol_extensions().is_empty());
    }

    #[tokio::test]
    async fn test_patch_etag_compare_and_swap() {
        let peer = Arc::new(MockPeerConnection::new());
        let resource = Resource::new(
            ResourceType::Dummy,
            &params(None, None),
            MOCK_OFFER.to_string(),
            peer.clone(),
            ctx(None),
        )
        .unwrap();
        resource.negotiate().await.unwrap();

        let fragment = "a=ice-ufrag:abcd\r\nm=audio 9 RTP/AVP 0\r\na=mid:0\r\na=candidate:1 1 udp 1 192.0.2.1 5000 typ host\r\n";
        let e1 = resource.etag().await;

        let e2 = resource.patch(fragment, Some(&format!("\"{}\"", e1))).await.unwrap();
        assert_ne!(e1, e2);
        assert_eq!(peer.candidates.lock().len(), 1);

        // Stale tag: conflict, no mutation
        let stale = resource.patch(fragment, Some(&e1)).await;
        assert!(matches!(stale, Err(AppError::Conflict(_))));
        assert_eq!(resource.etag().await, e2);
        assert_eq!(peer.candidates.lock().len(), 1);

        // Missing tag is a conflict too
        assert!(matches!(resource.patch(fragment, None).await, Err(AppError::Conflict(_))));

        let e3 = resource.patch(fragment, Some(&e2)).await.unwrap();
        assert_ne!(e2, e3);
        assert_eq!(peer.candidates.lock().len(), 2);
    }

    async fn active_dummy(peer: Arc<MockPeerConnection>) -> Arc<Resource> {
        let resource = Resource::new(
            ResourceType::Dummy,
            &params(None, None),
            MOCK_OFFER.to_string(),
            peer,
            ctx(None),
        )
        .unwrap();
        resource.negotiate().await.unwrap();
        resource
    }

    const TWO_CANDIDATES: &str = "m=audio 9 RTP/AVP 0\r\n\
        a=mid:0\r\n\
        a=candidate:1 1 udp 1 192.0.2.1 5000 typ host\r\n\
        a=candidate:2 1 udp 1 192.0.2.2 5001 typ host\r\n";

    #[tokio::test]
    async fn test_concurrent_patches_with_same_etag() {
        let peer = Arc::new(MockPeerConnection::new());
        let resource = active_dummy(peer.clone()).await;
        let etag = resource.etag().await;

        let (first, second) = tokio::join!(
            resource.patch(TWO_CANDIDATES, Some(&etag)),
            resource.patch(TWO_CANDIDATES, Some(&etag))
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AppError::Conflict(_))))
                .count(),
            1
        );
        // One batch of two candidates
        assert_eq!(peer.candidates.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_patch_with_bad_candidate_applies_nothing() {
        let peer = Arc::new(MockPeerConnection::new());
        let resource = active_dummy(peer.clone()).await;
        let etag = resource.etag().await;

        let fragment = "m=audio 9 RTP/AVP 0\r\n\
            a=mid:0\r\n\
            a=candidate:1 1 udp 1 192.0.2.1 5000 typ host\r\n\
            a=candidate:garbage\r\n";
        let result = resource.patch(fragment, Some(&etag)).await;

        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(peer.candidates.lock().is_empty());
        assert_eq!(resource.etag().await, etag);
    }

    #[tokio::test]
    async fn test_partially_applied_patch_rotates_etag() {
        let peer = Arc::new(MockPeerConnection::new());
        *peer.candidate_limit.lock() = Some(1);
        let resource = active_dummy(peer.clone()).await;
        let etag = resource.etag().await;

        assert!(resource.patch(TWO_CANDIDATES, Some(&etag)).await.is_err());
        assert_eq!(peer.candidates.lock().len(), 1);
        assert_ne!(resource.etag().await, etag);
    }

    #[tokio::test]
    async fn test_replaced_publisher_leaves_channel() {
        let b = broadcaster();
        let first_peer = Arc::new(MockPeerConnection::new());
        let second_peer = Arc::new(MockPeerConnection::new());
        let first = Resource::new(
            ResourceType::Broadcaster,
            &params(Some("live"), None),
            MOCK_OFFER.to_string(),
            first_peer,
            ctx(Some(b.clone())),
        )
        .unwrap();
        let second = Resource::new(
            ResourceType::Broadcaster,
            &params(Some("live"), None),
            MOCK_OFFER.to_string(),
            second_peer.clone(),
            ctx(Some(b.clone())),
        )
        .unwrap();
        first.negotiate().await.unwrap();
        second.negotiate().await.unwrap();
        b.create_viewer("live").await.unwrap();

        first.destroy().await.unwrap();
        let channel = b.get_channel("live").unwrap();
        assert_eq!(channel.stream().id, second_peer.remote_stream().id);
        assert_eq!(channel.viewer_count(), 1);

        second.destroy().await.unwrap();
        assert!(b.get_channel("live").is_none());
    }

    #[tokio::test]
    async fn test_failed_publisher_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeerConnection::new());
        let mut context = ctx(Some(broadcaster()));
        context.terminated = Some(tx);
        let resource = Resource::new(
            ResourceType::Broadcaster,
            &params(Some("live"), None),
            MOCK_OFFER.to_string(),
            peer.clone(),
            context,
        )
        .unwrap();
        resource.negotiate().await.unwrap();

        peer.emit_state(ConnectionState::Connected);
        peer.emit_state(ConnectionState::Failed);
        assert_eq!(rx.recv().await.as_deref(), Some(resource.id()));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let peer = Arc::new(MockPeerConnection::new());
        let resource = Resource::new(
            ResourceType::Dummy,
            &params(None, None),
            MOCK_OFFER.to_string(),
            peer.clone(),
            ctx(None),
        )
        .unwrap();
        resource.negotiate().await.unwrap();

        resource.destroy().await.unwrap();
        resource.destroy().await.unwrap();
        assert_eq!(peer.close_count.load(Ordering::SeqCst), 1);
        assert_eq!(resource.state(), ResourceState::Closed);

        let etag = resource.etag().await;
        assert!(matches!(
            resource.patch("", Some(&etag)).await,
            Err(AppError::NotFound(_))
        ));
    }
}
