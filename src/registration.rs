// Appservice Registration
// The registration record a homeserver and appservice share:
// tokens, bot localpart, namespaces, and optional protocol list

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single namespace claim: a regex over user-IDs, room-IDs or aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceEntry {
    pub exclusive: bool,
    pub regex: String,
}

/// The three namespace families an appservice may claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespaces {
    #[serde(default)]
    pub users: Vec<NamespaceEntry>,
    #[serde(default)]
    pub rooms: Vec<NamespaceEntry>,
    #[serde(default)]
    pub aliases: Vec<NamespaceEntry>,
}

/// Appservice registration, as exchanged with the homeserver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    pub namespaces: Namespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited: Option<bool>,
    #[serde(
        rename = "de.sorunome.msc2409.push_ephemeral",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub push_ephemeral: Option<bool>,
}

#[derive(Error, Debug)]
pub enum RegistrationFileError {
    #[error("Failed to read registration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl Registration {
    /// Load a registration from a YAML or JSON file. YAML is a superset of
    /// JSON here, so one parser covers both formats.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistrationFileError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Serialize the registration to YAML for handing to the homeserver.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Whether the given protocol id is declared in this registration.
    pub fn handles_protocol(&self, protocol: &str) -> bool {
        self.protocols
            .as_ref()
            .map(|p| p.iter().any(|candidate| candidate == protocol))
            .unwrap_or(false)
    }

    /// The bot's full user-ID on the given server.
    pub fn bot_user_id(&self, server_name: &str) -> String {
        format!("@{}:{}", self.sender_localpart, server_name)
    }
}
