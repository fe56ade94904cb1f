//! Config renderer for conduit
//!
//! Turns the set of pipeline fragments attached to one workload into a single
//! Vector JSON configuration plus a content hash. Rendering is pure: the same
//! base and fragments always produce the same bytes and the same hash.

#![deny(missing_docs)]

mod error;
mod fragment;
mod ports;
mod render;

pub use error::MergeError;
pub use fragment::Fragment;
pub use ports::{listening_ports, ListeningPort};
pub use render::{check_fragment, render, BaseConfig, RenderedConfig};
