//! Links, channels and inbound dispatch for the telehash mesh.
//!
//! A [`Mesh`] is the local node: it owns one [`Link`] per remote hashname,
//! the token index used to route inbound channel packets, and the relay
//! table. Cryptography is supplied through [`LocalIdentity`] and
//! [`Exchange`]; transports through [`Pipe`](telehash_transport::Pipe) and
//! [`PathResolver`].

pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod extension;
pub mod link;
pub mod logging;
pub mod mesh;
pub mod ranking;
pub mod receive;
pub mod testing;

pub use channel::{Channel, ChannelState};
pub use config::{LinkEntry, LoggingSection, MeshConfig, MeshSection};
pub use error::{ExchangeError, MeshError};
pub use exchange::{Exchange, HandshakeOptions, LocalIdentity};
pub use extension::{Bouncer, Extensions, LinkHook, OpenHandler, OpenRequest, PathResolver};
pub use link::{Link, LinkEvent, LinkStatus, StatusObserver};
pub use mesh::{LinkArgs, Mesh, MeshBuilder, MeshEvent};
pub use receive::{DropReason, HandshakeOutcome, ReceiveOutcome};
