//! Registry of live WHIP resources

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::resource::{Resource, ResourceContext, ResourceParams, ResourceType};
use crate::broadcaster::Broadcaster;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::webrtc::engine::PeerFactory;
use crate::webrtc::{IceServer, WebRtcConfig};

/// Owns every negotiated resource, keyed by id
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, Arc<Resource>>>,
    factory: Arc<dyn PeerFactory>,
    broadcaster: Option<Arc<Broadcaster>>,
    ice_servers: Vec<IceServer>,
    webrtc: WebRtcConfig,
    events: Arc<EventBus>,
    terminated: mpsc::UnboundedSender<String>,
}

impl ResourceRegistry {
    /// Create the registry and start reaping resources whose publisher
    /// connection failed
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        broadcaster: Option<Arc<Broadcaster>>,
        ice_servers: Vec<IceServer>,
        webrtc: WebRtcConfig,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (terminated, terminated_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            resources: RwLock::new(HashMap::new()),
            factory,
            broadcaster,
            ice_servers,
            webrtc,
            events,
            terminated,
        });
        tokio::spawn(reap_terminated(Arc::downgrade(&registry), terminated_rx));
        registry
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Create and negotiate a resource
    ///
    /// Returns the registered resource and its SDP answer. Nothing is
    /// registered when negotiation fails.
    pub async fn create(&self, resource_type: &str, params: &ResourceParams, offer: String) -> Result<(Arc<Resource>, String)> {
        let resource_type: ResourceType = resource_type.parse()?;

        let peer = self
            .factory
            .create_peer(&self.ice_servers)
            .await
            .map_err(|e| AppError::Creation(e.to_string()))?;

        let ctx = ResourceContext {
            ice_servers: self.ice_servers.clone(),
            ice_gathering_timeout: self.webrtc.ice_gathering_timeout(),
            broadcaster: self.broadcaster.clone(),
            terminated: Some(self.terminated.clone()),
        };
        let resource = match Resource::new(resource_type, params, offer, peer.clone(), ctx) {
            Ok(resource) => resource,
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    debug!("Failed to close rejected peer: {}", close_err);
                }
                return Err(e);
            }
        };

        let answer = match resource.negotiate().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Resource {} negotiation failed: {}", resource.id(), e);
                if let Err(close_err) = resource.destroy().await {
                    debug!("Failed to close resource {}: {}", resource.id(), close_err);
                }
                return Err(e);
            }
        };

        self.resources
            .write()
            .insert(resource.id().to_string(), resource.clone());
        info!("Registered {} resource {}", resource_type, resource.id());

        self.events.publish(SystemEvent::ResourceCreated {
            resource_id: resource.id().to_string(),
            resource_type: resource_type.to_string(),
            channel_id: match resource_type {
                ResourceType::Broadcaster => Some(resource.channel_id().to_string()),
                ResourceType::Dummy => None,
            },
        });

        Ok((resource, answer))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Resource>> {
        self.resources.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    /// Locator paths of all resources, sorted
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .resources
            .read()
            .values()
            .map(|r| r.locator(prefix))
            .collect();
        paths.sort();
        paths
    }

    /// Apply a trickle-ICE fragment; returns the new ETag
    pub async fn patch(&self, id: &str, fragment: &str, etag: Option<&str>) -> Result<String> {
        let resource = self
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("resource {}", id)))?;
        resource.patch(fragment, etag).await
    }

    /// Unregister and destroy a resource
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.resources.write().remove(id);
        let resource = removed.ok_or_else(|| AppError::NotFound(format!("resource {}", id)))?;

        if let Err(e) = resource.destroy().await {
            warn!("Resource {} teardown failed: {}", id, e);
        }
        self.events.publish(SystemEvent::ResourceDeleted {
            resource_id: id.to_string(),
        });
        Ok(())
    }

    /// Destroy every resource
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.resources.read().keys().cloned().collect();
        for id in ids {
            // A concurrent DELETE may have won the race
            let _ = self.delete(&id).await;
        }
    }
}

/// Delete resources reported as failed until the registry is dropped
async fn reap_terminated(registry: Weak<ResourceRegistry>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = rx.recv().await {
        let Some(registry) = registry.upgrade() else { break };
        match registry.delete(&id).await {
            Ok(()) => info!("Removed resource {} after publisher failure", id),
            Err(e) => debug!("Resource {} already gone: {}", id, e),
        }
    }
}
