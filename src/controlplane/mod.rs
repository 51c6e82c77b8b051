//! Control Plane Module
//!
//! Provisioning logic on top of the appliance client: name derivation, the
//! provisioning saga and its rollback, deprovisioning, descriptor building,
//! and the provisioner facade with its REST API.

pub mod api;
pub mod deprovision;
pub mod descriptor;
pub mod metrics;
pub mod naming;
pub mod provisioner;
pub mod retry;
pub mod saga;

pub use api::*;
pub use deprovision::*;
pub use descriptor::*;
pub use metrics::*;
pub use naming::*;
pub use provisioner::*;
pub use retry::*;
pub use saga::*;
