//! FreeNAS iSCSI Provisioner
//!
//! Provisions block volumes on a FreeNAS appliance and exposes them over
//! iSCSI. Each volume is a chain of dependent appliance objects created by a
//! saga that rolls back whatever it created when a step fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Invoking surface (REST API / binary)                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                              Provisioner                                  │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────────┐  │
//! │  │  Config Resolver │  │  Saga / Deprov.  │  │  Descriptor Builder   │  │
//! │  │  (kube / file)   │  │  Orchestrators   │  │                       │  │
//! │  └──────────────────┘  └────────┬─────────┘  └───────────────────────┘  │
//! │                                 │                                         │
//! │                    ┌────────────┴────────────┐                            │
//! │                    │  Remote Resource Client │                            │
//! │                    │  (HTTP / in-memory)     │                            │
//! │                    └─────────────────────────┘                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: naming, saga, deprovisioning, provisioner facade and API
//! - [`appliance`]: resource clients for the appliance
//! - [`config`]: storage-class configuration and its resolvers
//! - [`domain`]: core domain types and traits
//! - [`error`]: error types and handling

pub mod appliance;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, DeprovisionOrchestrator, DeprovisionPolicy, Provisioner,
    ProvisionerConfig, ProvisionerMetrics, RetryPolicy, SagaOrchestrator, VolumeNames,
};

pub use appliance::{FreenasClient, HttpClientFactory, InMemoryAppliance, InMemoryClientFactory};

pub use config::{ConfigFile, FileConfigResolver, KubeConfigResolver, ProvisioningConfig};

pub use domain::ports::{ClientFactory, ConfigResolver, ResourceClient};
pub use domain::resources::{CreateOutcome, DeleteOutcome, Resource, ResourceId, ResourceKind};
pub use domain::volume::{AccessMode, IdentityMap, ProvisioningRequest, VolumeDescriptor};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
