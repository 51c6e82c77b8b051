//! Domain layer - Core types and port definitions
//!
//! This module defines the appliance resource model, the volume-level request
//! and descriptor types, and the traits (ports) that adapters implement.

pub mod ports;
pub mod resources;
pub mod volume;

pub use ports::*;
pub use resources::*;
pub use volume::*;
