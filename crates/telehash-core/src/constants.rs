//! Protocol constants.

/// Length of link and route tokens in bytes.
pub const TOKEN_LENGTH: usize = 16;

/// Length of a hashname digest in bytes.
pub const HASHNAME_LENGTH: usize = 32;

/// Length of a hashname in its base32 text form.
pub const HASHNAME_TEXT_LENGTH: usize = 52;

/// Size of the big-endian head-length prefix of a LOB packet.
pub const LOB_LENGTH_PREFIX: usize = 2;

/// Heads shorter than this are binary; at or above it they are JSON.
pub const LOB_JSON_MIN_HEAD: usize = 7;

/// Nonce length of one cloaking round.
pub const CLOAK_NONCE_LENGTH: usize = 8;

/// JSON `type` value of a link handshake.
pub const HANDSHAKE_TYPE_LINK: &str = "link";

/// Path type used for routing through another hashname.
pub const PATH_TYPE_PEER: &str = "peer";
