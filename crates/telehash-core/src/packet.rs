//! Length-object-binary (LOB) packet encoding.
//!
//! ```text
//! +--------+--------+----------------+------------------+
//! | head length (BE)|   head bytes   |    body bytes    |
//! +--------+--------+----------------+------------------+
//! ```
//!
//! A zero-length head marks channel traffic, a one-byte head is the csid of
//! a handshake, heads of seven bytes or more are JSON objects.

use serde_json::{Map, Value};

use crate::constants::{LOB_JSON_MIN_HEAD, LOB_LENGTH_PREFIX};
use crate::error::PacketError;
use crate::types::{Csid, Fingerprint};

/// Decoded packet head.
#[derive(Debug, Clone, PartialEq)]
pub enum Head {
    Empty,
    Binary(Vec<u8>),
    Json(Map<String, Value>),
}

/// A decoded LOB packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub head: Head,
    pub body: Vec<u8>,
}

/// Coarse classification of an inbound packet by head shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// Encrypted channel traffic (empty head).
    Channel,
    /// Handshake for the given cipher suite (one-byte head).
    Handshake(Csid),
    /// Plain JSON packet carrying a `type`.
    Typed(String),
    /// Anything else.
    Unknown,
}

impl PacketKind {
    pub fn of(packet: &Packet) -> Self {
        match &packet.head {
            Head::Empty => Self::Channel,
            Head::Binary(bytes) if bytes.len() == 1 => Self::Handshake(Csid(bytes[0])),
            Head::Binary(_) => Self::Unknown,
            Head::Json(json) => match json.get("type").and_then(Value::as_str) {
                Some(kind) => Self::Typed(kind.to_string()),
                None => Self::Unknown,
            },
        }
    }
}

impl Packet {
    /// The `00 00` packet: empty head and body.
    pub fn empty() -> Self {
        Self {
            head: Head::Empty,
            body: Vec::new(),
        }
    }

    /// Channel packet with an empty head.
    pub fn channel(body: Vec<u8>) -> Self {
        Self {
            head: Head::Empty,
            body,
        }
    }

    /// Handshake packet whose head is the csid byte.
    pub fn handshake(csid: Csid, body: Vec<u8>) -> Self {
        Self {
            head: Head::Binary(vec![csid.0]),
            body,
        }
    }

    /// JSON-headed packet.
    pub fn with_json(json: Map<String, Value>, body: Vec<u8>) -> Self {
        Self {
            head: Head::Json(json),
            body,
        }
    }

    /// JSON-headed packet with no body.
    pub fn json_only(json: Map<String, Value>) -> Self {
        Self::with_json(json, Vec::new())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < LOB_LENGTH_PREFIX {
            return Err(PacketError::TooShort {
                min: LOB_LENGTH_PREFIX,
                actual: bytes.len(),
            });
        }
        let head_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[LOB_LENGTH_PREFIX..];
        if head_len > rest.len() {
            return Err(PacketError::HeadOverflow {
                declared: head_len,
                available: rest.len(),
            });
        }
        let (head_bytes, body) = rest.split_at(head_len);

        let head = if head_len == 0 {
            Head::Empty
        } else if head_len < LOB_JSON_MIN_HEAD {
            Head::Binary(head_bytes.to_vec())
        } else {
            match serde_json::from_slice::<Value>(head_bytes) {
                Ok(Value::Object(map)) => Head::Json(map),
                Ok(_) => return Err(PacketError::InvalidJson("head is not an object".into())),
                Err(e) => return Err(PacketError::InvalidJson(e.to_string())),
            }
        };

        Ok(Self {
            head,
            body: body.to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let head: Vec<u8> = match &self.head {
            Head::Empty => Vec::new(),
            Head::Binary(bytes) => bytes.clone(),
            Head::Json(map) => serde_json::to_vec(map)
                .map_err(|e| PacketError::InvalidJson(e.to_string()))?,
        };
        let head_len = u16::try_from(head.len()).map_err(|_| PacketError::HeadTooLong(head.len()))?;

        let mut out = Vec::with_capacity(LOB_LENGTH_PREFIX + head.len() + self.body.len());
        out.extend_from_slice(&head_len.to_be_bytes());
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Fingerprint of the encoded form, used for relay dedup.
    pub fn fingerprint(&self) -> Result<Fingerprint, PacketError> {
        Ok(Fingerprint::of(&self.encode()?))
    }

    #[must_use]
    pub fn kind(&self) -> PacketKind {
        PacketKind::of(self)
    }

    #[must_use]
    pub fn json(&self) -> Option<&Map<String, Value>> {
        match &self.head {
            Head::Json(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn json_str(&self, key: &str) -> Option<&str> {
        self.json()?.get(key)?.as_str()
    }

    #[must_use]
    pub fn json_u32(&self, key: &str) -> Option<u32> {
        self.json()?
            .get(key)?
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
    }

    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.json().is_some_and(|json| json.contains_key(key))
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Packet::decode(&bytes);
        }

        #[test]
        fn non_json_heads_reencode_verbatim(
            head in proptest::collection::vec(any::<u8>(), 0..7),
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut wire = (head.len() as u16).to_be_bytes().to_vec();
            wire.extend_from_slice(&head);
            wire.extend_from_slice(&body);
            let packet = Packet::decode(&wire).unwrap();
            prop_assert_eq!(packet.encode().unwrap(), wire);
        }
    }
}
