//! Core types and wire formats for the telehash mesh.
//!
//! This crate defines hashnames and key sets, link and route tokens, path
//! descriptors, the LOB packet codec with its head-shape classification, and
//! packet cloaking. It performs no I/O.

pub mod cloak;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod hashname;
pub mod packet;
pub mod path;
pub mod types;

pub use error::{HashnameError, PacketError};
pub use hashname::{Hashname, Intermediate, Keys};
pub use packet::{Head, Packet, PacketKind};
pub use path::Path;
pub use types::{Csid, Fingerprint, InvalidLength, Token};
