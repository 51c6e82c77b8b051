//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the saga logic and external systems.
//! Adapters implement these traits to provide concrete functionality.

use super::resources::{CreateOutcome, DeleteOutcome, IscsiGlobalConfig, Resource, ResourceId, ResourceKey};
use crate::config::{ProvisioningConfig, ServerConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Remote Resource Client Port
// =============================================================================

/// Uniform Get/Create/Delete over every appliance resource kind.
///
/// Implementations classify transport and status details into the outcome
/// enums; callers never see raw status codes. Failures that are neither a
/// conflict nor a not-found come back as `Err`.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Read the appliance's global iSCSI settings
    async fn global_config(&self) -> Result<IscsiGlobalConfig>;

    /// Look a resource up by identity or natural key
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>>;

    /// Create a resource
    async fn create(&self, resource: &Resource) -> Result<CreateOutcome>;

    /// Delete a resource by identity
    async fn delete(&self, id: &ResourceId) -> Result<DeleteOutcome>;
}

// =============================================================================
// Client Factory Port
// =============================================================================

/// Builds a resource client for the server a storage class points at
pub trait ClientFactory: Send + Sync {
    fn connect(&self, server: &ServerConfig) -> Result<ResourceClientRef>;
}

// =============================================================================
// Config Resolver Port
// =============================================================================

/// Resolves a storage class into an immutable provisioning configuration
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, storage_class: &str) -> Result<ProvisioningConfig>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceClientRef = Arc<dyn ResourceClient>;
pub type ClientFactoryRef = Arc<dyn ClientFactory>;
pub type ConfigResolverRef = Arc<dyn ConfigResolver>;
