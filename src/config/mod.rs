//! Configuration resolution
//!
//! Turns storage-class parameters and the appliance credential into an
//! immutable per-call [`ProvisioningConfig`].

pub mod provisioning;
pub mod resolver;

pub use provisioning::*;
pub use resolver::*;
