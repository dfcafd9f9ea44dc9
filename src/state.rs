use std::sync::Arc;
use tracing::info;

use crate::broadcaster::{Broadcaster, BroadcasterOptions};
use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::webrtc::PeerFactory;
use crate::whip::ResourceRegistry;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Live WHIP resources
    pub registry: Arc<ResourceRegistry>,
    /// Viewer fanout (absent when disabled in configuration)
    pub broadcaster: Option<Arc<Broadcaster>>,
    /// Event bus for lifecycle notifications
    pub events: Arc<EventBus>,
}

impl AppState {
    /// Wire the registry and broadcaster from the current configuration
    pub fn new(
        config: ConfigStore,
        factory: Arc<dyn PeerFactory>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let snapshot = config.get();

        let broadcaster = snapshot.broadcaster.enabled.then(|| {
            let base_url = snapshot.broadcaster.public_url.clone().unwrap_or_else(|| {
                let path = snapshot.broadcaster.normalized_path();
                format!("{}{}", snapshot.web.server_address(), path.trim_end_matches('/'))
            });
            info!("Broadcaster enabled at {}", base_url);
            Arc::new(Broadcaster::new(
                BroadcasterOptions {
                    base_url,
                    ice_servers: snapshot.broadcaster.ice_servers.clone(),
                    preroll_url: snapshot.broadcaster.preroll_url.clone(),
                    webrtc: snapshot.webrtc.clone(),
                },
                factory.clone(),
                events.clone(),
            ))
        });

        let registry = ResourceRegistry::new(
            factory,
            broadcaster.clone(),
            snapshot.whip.ice_servers.clone(),
            snapshot.webrtc.clone(),
            events.clone(),
        );

        Arc::new(Self {
            config,
            registry,
            broadcaster,
            events,
        })
    }

    /// Tear down every resource and channel
    pub async fn cleanup(&self) {
        let resources = self.registry.len();
        self.registry.close_all().await;
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.close_all().await;
        }
        info!("Closed {} resources", resources);
    }
}
