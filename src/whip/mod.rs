//! WHIP (WebRTC-HTTP ingestion) resources

pub mod links;
pub mod registry;
pub mod resource;

pub use registry::ResourceRegistry;
pub use resource::{Resource, ResourceOptions, ResourceParams, ResourceState, ResourceType};
