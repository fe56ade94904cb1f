//! Conduit operator library
//!
//! Startup plumbing for the `conduit-operator` binary: configuration, CRD
//! installation and controller wiring.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod crds;
pub mod shutdown;

pub use config::Cli;
pub use controller_runner::{build_controllers, ControllerSettings, Controllers};
