//! API Module
//!
//! REST API for provisioning and deprovisioning volumes.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
