//! Hashnames: fixed identities derived from a participant's public keys.
//!
//! A hashname is a SHA-256 rollup over every cipher suite the participant
//! supports, ordered by csid. Peers that only reveal the key for the suite
//! in use send the 32-byte intermediates of the others, so the hashname can
//! be recomputed from a single handshake.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::constants::{HASHNAME_LENGTH, HASHNAME_TEXT_LENGTH};
use crate::encoding::{base32_decode, base32_encode};
use crate::error::HashnameError;
use crate::types::Csid;

/// 32-byte intermediate digest of one public key.
pub type Intermediate = [u8; 32];

/// Public keys of one participant, keyed by cipher suite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keys(BTreeMap<Csid, Vec<u8>>);

impl Keys {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, csid: Csid, key: Vec<u8>) {
        self.0.insert(csid, key);
    }

    #[must_use]
    pub fn get(&self, csid: Csid) -> Option<&[u8]> {
        self.0.get(&csid).map(Vec::as_slice)
    }

    pub fn csids(&self) -> impl Iterator<Item = Csid> + '_ {
        self.0.keys().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge another key set in, replacing keys for csids present in both.
    pub fn merge(&mut self, other: &Keys) {
        for (csid, key) in &other.0 {
            self.0.insert(*csid, key.clone());
        }
    }

    /// `csid → sha256(key)` for every key.
    #[must_use]
    pub fn intermediates(&self) -> BTreeMap<Csid, Intermediate> {
        self.0
            .iter()
            .map(|(csid, key)| (*csid, Sha256::digest(key).into()))
            .collect()
    }

    /// Parse a `{"1a": "<base32 key>", …}` object. Non-csid entries are ignored.
    pub fn from_json(json: &Map<String, Value>) -> Result<Self, HashnameError> {
        let mut keys = Keys::new();
        for (name, value) in json {
            let Some(csid) = Csid::from_hex(name) else {
                continue;
            };
            let text = value.as_str().ok_or(HashnameError::InvalidKey(csid))?;
            keys.insert(csid, base32_decode(text)?);
        }
        Ok(keys)
    }

    /// Render as a `{"1a": "<base32 key>", …}` object.
    #[must_use]
    pub fn to_json(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(csid, key)| (csid.to_hex(), Value::String(base32_encode(key))))
            .collect()
    }
}

impl FromIterator<(Csid, Vec<u8>)> for Keys {
    fn from_iter<T: IntoIterator<Item = (Csid, Vec<u8>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse `{"1a": "<base32 intermediate>", …}`. Non-csid entries such as `type` are ignored.
pub fn parse_intermediates(
    json: &Map<String, Value>,
) -> Result<BTreeMap<Csid, Intermediate>, HashnameError> {
    let mut out = BTreeMap::new();
    for (name, value) in json {
        let Some(csid) = Csid::from_hex(name) else {
            continue;
        };
        let Some(text) = value.as_str() else {
            continue;
        };
        let bytes = base32_decode(text)?;
        let digest: Intermediate = bytes
            .try_into()
            .map_err(|_| HashnameError::InvalidIntermediate(csid))?;
        out.insert(csid, digest);
    }
    Ok(out)
}

/// Render intermediates as a JSON object, leaving out `skip` (the csid whose key is sent in full).
#[must_use]
pub fn intermediates_json(
    intermediates: &BTreeMap<Csid, Intermediate>,
    skip: Option<Csid>,
) -> Map<String, Value> {
    intermediates
        .iter()
        .filter(|(csid, _)| Some(**csid) != skip)
        .map(|(csid, digest)| (csid.to_hex(), Value::String(base32_encode(digest))))
        .collect()
}

/// A participant's fixed identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct Hashname([u8; HASHNAME_LENGTH]);

impl Hashname {
    pub const fn new(bytes: [u8; HASHNAME_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASHNAME_LENGTH] {
        &self.0
    }

    /// Derive the hashname of a full key set.
    pub fn from_keys(keys: &Keys) -> Result<Self, HashnameError> {
        Self::rollup(&keys.intermediates())
    }

    /// Derive a hashname from one full key plus the intermediates of the other suites.
    pub fn from_intermediates(
        csid: Csid,
        key: &[u8],
        others: &BTreeMap<Csid, Intermediate>,
    ) -> Result<Self, HashnameError> {
        if key.is_empty() {
            return Err(HashnameError::MissingKey(csid));
        }
        let mut all = others.clone();
        all.insert(csid, Sha256::digest(key).into());
        Self::rollup(&all)
    }

    fn rollup(intermediates: &BTreeMap<Csid, Intermediate>) -> Result<Self, HashnameError> {
        if intermediates.is_empty() {
            return Err(HashnameError::Empty);
        }
        let mut rollup: Vec<u8> = Vec::new();
        for (csid, digest) in intermediates {
            let mut hasher = Sha256::new();
            hasher.update(&rollup);
            hasher.update([csid.0]);
            rollup = hasher.finalize().to_vec();

            let mut hasher = Sha256::new();
            hasher.update(&rollup);
            hasher.update(digest);
            rollup = hasher.finalize().to_vec();
        }
        let bytes: [u8; HASHNAME_LENGTH] =
            rollup
                .as_slice()
                .try_into()
                .map_err(|_| HashnameError::InvalidLength {
                    expected: HASHNAME_LENGTH,
                    actual: rollup.len(),
                })?;
        Ok(Self(bytes))
    }

    /// First eight characters of the text form, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut text = self.to_string();
        text.truncate(8);
        text
    }
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32_encode(&self.0))
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashname({}..)", self.short())
    }
}

impl FromStr for Hashname {
    type Err = HashnameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASHNAME_TEXT_LENGTH {
            return Err(HashnameError::InvalidLength {
                expected: HASHNAME_TEXT_LENGTH,
                actual: s.len(),
            });
        }
        let bytes = base32_decode(s)?;
        let actual = bytes.len();
        let arr: [u8; HASHNAME_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| HashnameError::InvalidLength {
                    expected: HASHNAME_LENGTH,
                    actual,
                })?;
        Ok(Self(arr))
    }
}

impl serde::Serialize for Hashname {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Hashname {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_suite_keys() -> Keys {
        [
            (Csid(0x1a), vec![0x11; 21]),
            (Csid(0x3a), vec![0x33; 32]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_from_keys_is_deterministic() {
        let a = Hashname::from_keys(&two_suite_keys()).unwrap();
        let b = Hashname::from_keys(&two_suite_keys()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 52);
    }

    #[test]
    fn test_partial_keys_with_intermediates_match_full_keys() {
        let keys = two_suite_keys();
        let full = Hashname::from_keys(&keys).unwrap();

        let mut others = keys.intermediates();
        others.remove(&Csid(0x3a));
        let partial =
            Hashname::from_intermediates(Csid(0x3a), keys.get(Csid(0x3a)).unwrap(), &others)
                .unwrap();
        assert_eq!(full, partial);
    }

    #[test]
    fn test_different_keys_different_hashnames() {
        let mut other = two_suite_keys();
        other.insert(Csid(0x1a), vec![0x12; 21]);
        assert_ne!(
            Hashname::from_keys(&two_suite_keys()).unwrap(),
            Hashname::from_keys(&other).unwrap()
        );
    }

    #[test]
    fn test_empty_keys_rejected() {
        assert_eq!(Hashname::from_keys(&Keys::new()), Err(HashnameError::Empty));
    }

    #[test]
    fn test_parse_display() {
        let hn = Hashname::from_keys(&two_suite_keys()).unwrap();
        let parsed: Hashname = hn.to_string().parse().unwrap();
        assert_eq!(parsed, hn);
        assert!("tooshort".parse::<Hashname>().is_err());
    }

    #[test]
    fn test_intermediates_json_skips_sent_key() {
        let keys = two_suite_keys();
        let json = intermediates_json(&keys.intermediates(), Some(Csid(0x1a)));
        assert!(json.contains_key("3a"));
        assert!(!json.contains_key("1a"));

        let parsed = parse_intermediates(&json).unwrap();
        assert_eq!(parsed.get(&Csid(0x3a)), keys.intermediates().get(&Csid(0x3a)));
    }

    #[test]
    fn test_keys_json_ignores_non_csid_entries() {
        let mut json = two_suite_keys().to_json();
        json.insert("type".into(), Value::String("link".into()));
        let keys = Keys::from_json(&json).unwrap();
        assert_eq!(keys, two_suite_keys());
    }
}
