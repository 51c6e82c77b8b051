//! Remote Resource Clients
//!
//! Adapters implementing [`crate::domain::ports::ResourceClient`]:
//! - FreeNAS: the appliance's v1.0 REST API over HTTP
//! - In-memory: a simulated appliance for tests and standalone runs

pub mod http;
pub mod memory;

pub use http::*;
pub use memory::*;

use crate::config::ServerConfig;
use crate::domain::ports::{ClientFactory, ResourceClientRef};
use crate::error::Result;
use std::sync::Arc;

/// Hands out one shared in-memory appliance regardless of server
pub struct InMemoryClientFactory {
    appliance: Arc<InMemoryAppliance>,
}

impl InMemoryClientFactory {
    pub fn new(appliance: Arc<InMemoryAppliance>) -> Self {
        Self { appliance }
    }
}

impl ClientFactory for InMemoryClientFactory {
    fn connect(&self, _server: &ServerConfig) -> Result<ResourceClientRef> {
        Ok(self.appliance.clone())
    }
}
