//! Pipes, relay routes and loop suppression for the telehash mesh.

pub mod dedup;
pub mod error;
pub mod keepalive;
pub mod pipe;
pub mod relay;
pub mod route;
pub mod testing;

pub use dedup::{DEDUP_WINDOW, DedupCache};
pub use error::TransportError;
pub use keepalive::spawn_keepalive;
pub use pipe::{LivenessObserver, Pipe, PipeEvent, PipeEvents, PipeId, SubscriptionId, same_path};
pub use relay::{Relay, RelayDecision};
pub use route::RouteTable;
