//! Event coalescing and dependency fan-out for conduit
//!
//! A pipeline change is routed to the workloads that consume it, one event
//! per workload is pushed into the debouncer of that workload's class, and
//! each debouncer hands the workload controller at most one trigger per key
//! per quiet window.

#![deny(missing_docs)]

mod debouncer;
mod inventory;
mod router;

pub use debouncer::{DebounceKey, Debouncer, DEFAULT_WINDOW};
pub use inventory::{KubeWorkloadInventory, WorkloadInventory};
pub use router::{
    class_channels, resolve, target_matches, ClassReceivers, FanoutRouter, RouteOutcome,
    EVENT_CHANNEL_CAPACITY,
};
