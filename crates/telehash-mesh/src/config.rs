//! TOML-based configuration for a mesh.

use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::time::Duration;

use serde::Deserialize;

use telehash_core::encoding::base32_decode;
use telehash_core::{Csid, Hashname, Keys, Path};

use crate::error::MeshError;
use crate::mesh::LinkArgs;

/// Top-level mesh configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub mesh: MeshSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

impl MeshConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &FsPath) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, MeshError> {
        toml::from_str(s).map_err(|e| MeshError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[mesh]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshSection {
    /// Create links for handshakes from hashnames we have never heard of.
    #[serde(default = "default_accept_unknown")]
    pub accept_unknown: bool,
    /// Seconds between whole-cache resets of the relay dedup cache.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// A freshness-counter jump larger than this restarts the seen round.
    #[serde(default = "default_resync_jump_threshold")]
    pub resync_jump_threshold: u32,
    /// Capacity of the link and mesh event channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_accept_unknown() -> bool {
    true
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_resync_jump_threshold() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    256
}

impl MeshSection {
    #[must_use]
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            accept_unknown: default_accept_unknown(),
            dedup_window_secs: default_dedup_window_secs(),
            resync_jump_threshold: default_resync_jump_threshold(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A `[[links]]` entry for a peer to link on startup.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkEntry {
    pub hashname: Option<Hashname>,
    /// Cipher-suite id (`"1a"`) to base32 public key.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub paths: Vec<Path>,
    /// Use this peer as a default router.
    #[serde(default)]
    pub router: bool,
}

impl LinkEntry {
    pub fn parse_keys(&self) -> Result<Keys, MeshError> {
        let mut keys = Keys::new();
        for (name, text) in &self.keys {
            let csid = Csid::from_hex(name)
                .ok_or_else(|| MeshError::Config(format!("invalid cipher suite id: {name}")))?;
            let key = base32_decode(text)
                .map_err(|e| MeshError::Config(format!("invalid key for {name}: {e}")))?;
            keys.insert(csid, key);
        }
        Ok(keys)
    }

    pub fn to_args(&self) -> Result<LinkArgs, MeshError> {
        let keys = self.parse_keys()?;
        if self.hashname.is_none() && keys.is_empty() {
            return Err(MeshError::Config(
                "link entry needs a hashname or keys".into(),
            ));
        }
        Ok(LinkArgs {
            hashname: self.hashname,
            keys,
            paths: self.paths.clone(),
            pipe: None,
            router: self.router.then_some(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telehash_core::encoding::base32_encode;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MeshConfig::parse("").unwrap();
        assert!(config.mesh.accept_unknown);
        assert_eq!(config.mesh.dedup_window(), Duration::from_secs(60));
        assert_eq!(config.mesh.resync_jump_threshold, 10);
        assert_eq!(config.mesh.event_capacity, 256);
        assert_eq!(config.logging.level, "info");
        assert!(config.links.is_empty());
    }

    #[test]
    fn test_parse_mesh_section() {
        let toml = r#"
[mesh]
accept_unknown = false
dedup_window_secs = 30
resync_jump_threshold = 4

[logging]
level = "debug"
"#;
        let config = MeshConfig::parse(toml).unwrap();
        assert!(!config.mesh.accept_unknown);
        assert_eq!(config.mesh.dedup_window_secs, 30);
        assert_eq!(config.mesh.resync_jump_threshold, 4);
        assert_eq!(config.mesh.event_capacity, 256);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_parse_links_with_keys_and_paths() {
        let key = base32_encode(&[7u8; 32]);
        let toml = format!(
            r#"
[[links]]
router = true
keys = {{ "1a" = "{key}" }}

[[links.paths]]
type = "udp4"
ip = "10.0.0.1"
port = 42424
"#
        );
        let config = MeshConfig::parse(&toml).unwrap();
        assert_eq!(config.links.len(), 1);
        let entry = &config.links[0];
        assert!(entry.router);
        assert_eq!(entry.paths.len(), 1);
        assert_eq!(entry.paths[0].kind, "udp4");
        assert_eq!(entry.paths[0].params["port"], 42424);

        let args = entry.to_args().unwrap();
        assert_eq!(args.keys.get(Csid(0x1a)), Some(&[7u8; 32][..]));
        assert_eq!(args.router, Some(true));
    }

    #[test]
    fn test_link_entry_needs_identity() {
        let config = MeshConfig::parse("[[links]]\nrouter = false\n").unwrap();
        assert!(matches!(config.links[0].to_args(), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        let toml = r#"
[[links]]
keys = { "zz" = "aaaa" }
"#;
        let config = MeshConfig::parse(toml).unwrap();
        let err = config.links[0].to_args().unwrap_err();
        assert!(err.to_string().contains("invalid cipher suite id"));
    }

    #[test]
    fn test_parse_malformed_toml() {
        assert!(MeshConfig::parse("[mesh").is_err());
        assert!(MeshConfig::parse("[mesh]\naccept_unknown = \"yes\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = MeshConfig::load(FsPath::new("/nonexistent/telehash.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
