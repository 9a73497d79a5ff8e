//! Path descriptors: opaque reachability hints.
//!
//! The core never interprets a path beyond its `type` and, for `peer`
//! paths, the router hashname. Equality is structural, independent of
//! field order.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::PATH_TYPE_PEER;
use crate::hashname::Hashname;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Path {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// A path that reaches a hashname through the router `via`.
    pub fn peer(via: &Hashname) -> Self {
        Self::new(PATH_TYPE_PEER).with("hn", via.to_string())
    }

    /// Router hashname of a `peer` path.
    #[must_use]
    pub fn peer_hashname(&self) -> Option<Hashname> {
        if self.kind != PATH_TYPE_PEER {
            return None;
        }
        self.params.get("hn")?.as_str()?.parse().ok()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (key, value) in &self.params {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}
