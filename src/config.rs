//! Destination configuration.
//!
//! Destinations are read-only input resolved at startup. The accepted
//! transfer-syntax cache is the one mutable part: it is shared between
//! jobs and updated only by the transcode fallback path after a
//! negotiation outcome is observed.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default calling AE title when the configuration does not name one.
pub const DEFAULT_CALLING_AE: &str = "DCMSCU";

/// One remote archive node.
#[derive(Debug, Clone)]
pub struct Destination {
    pub label: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    /// Transfer syntaxes known to be accepted by this destination,
    /// learned from prior negotiation outcomes. Clones share the cache.
    accepted_syntaxes: Arc<RwLock<BTreeSet<String>>>,
}

impl Destination {
    pub fn new(
        label: impl Into<String>,
        ae_title: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Destination {
            label: label.into(),
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            accepted_syntaxes: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Record a transfer syntax the destination accepted. Set union,
    /// last negotiated result wins.
    pub fn note_accepted_syntax(&self, ts_uid: &str) {
        let mut cache = self
            .accepted_syntaxes
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if cache.insert(ts_uid.to_string()) {
            log::info!(
                "destination {}: learned accepted transfer syntax {ts_uid}",
                self.label
            );
        }
    }

    pub fn accepted_syntaxes(&self) -> BTreeSet<String> {
        self.accepted_syntaxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Deserialize)]
struct DestinationEntry {
    label: String,
    ae_title: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    calling_ae_title: Option<String>,
    #[serde(default)]
    destinations: Vec<DestinationEntry>,
}

/// Parsed destination configuration.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub calling_ae_title: String,
    pub destinations: Vec<Destination>,
}

impl DestinationConfig {
    pub fn find(&self, label: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.label == label)
    }
}

/// Load a TOML destination list.
///
/// Expected shape:
///
/// ```toml
/// calling_ae_title = "DCMSCU"
///
/// [[destinations]]
/// label = "main-pacs"
/// ae_title = "ARCHIVE"
/// host = "10.0.0.5"
/// port = 104
/// ```
pub fn load_destinations(path: &Path) -> Result<DestinationConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_destinations(&content)
}

pub fn parse_destinations(content: &str) -> Result<DestinationConfig> {
    let file: ConfigFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid destinations: {e}")))?;

    let destinations = file
        .destinations
        .into_iter()
        .map(|d| Destination::new(d.label, d.ae_title, d.host, d.port))
        .collect();

    Ok(DestinationConfig {
        calling_ae_title: file
            .calling_ae_title
            .unwrap_or_else(|| DEFAULT_CALLING_AE.to_string()),
        destinations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destination_list() {
        let config = parse_destinations(
            r#"
            calling_ae_title = "WORKSTATION"

            [[destinations]]
            label = "main-pacs"
            ae_title = "ARCHIVE"
            host = "10.0.0.5"
            port = 104

            [[destinations]]
            label = "research"
            ae_title = "RESEARCH"
            host = "research.example.org"
            port = 11112
            "#,
        )
        .unwrap();

        assert_eq!(config.calling_ae_title, "WORKSTATION");
        assert_eq!(config.destinations.len(), 2);
        let main = config.find("main-pacs").unwrap();
        assert_eq!(main.ae_title, "ARCHIVE");
        assert_eq!(main.addr(), "10.0.0.5:104");
    }

    #[test]
    fn empty_config_uses_default_calling_ae() {
        let config = parse_destinations("").unwrap();
        assert_eq!(config.calling_ae_title, DEFAULT_CALLING_AE);
        assert!(config.destinations.is_empty());
    }

    #[test]
    fn syntax_cache_is_shared_between_clones() {
        let dest = Destination::new("a", "A", "localhost", 104);
        let clone = dest.clone();
        dest.note_accepted_syntax("1.2.840.10008.1.2.1");
        assert!(clone
            .accepted_syntaxes()
            .contains("1.2.840.10008.1.2.1"));
    }
}
