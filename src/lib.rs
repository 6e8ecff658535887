//! INDI Protocol Client
//!
//! Asynchronous client for the INDI device-control protocol: connects to an
//! INDI server over TCP, translates the streaming XML into a device/property
//! registry, and exposes a thread-safe observation surface that downstream
//! consumers (a GUI, a scripting engine) poll for changes.
//!
//! ## Features
//!
//! - Incremental XML decoder that tolerates arbitrary chunk boundaries
//! - Device/property registry with create/update/delete semantics
//! - Optimistic local updates (Busy until the server's set echo reconciles)
//! - Change accumulation buffers drained atomically by any thread
//! - BLOB reception with base64 decoding and file download
//! - Cooperative disconnect: the listener task is signalled and joined,
//!   never killed

mod client;
mod dispatch;
mod error;
mod numfmt;
pub mod protocol;
mod registry;
pub mod settings;
mod state;
mod wire;
mod xml;

pub use client::{ClientEvent, IndiClient};
pub use error::{DispatchError, IndiError, IndiResult};
pub use registry::{Device, Element, ElementValue, Property, Registry};
pub use state::{BlobArtifact, ChangeSet, PropertyChange, ServerMessage};
pub use xml::{ElementReader, XmlElement};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// INDI property vector types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::Text => "Text",
            PropertyKind::Number => "Number",
            PropertyKind::Switch => "Switch",
            PropertyKind::Light => "Light",
            PropertyKind::Blob => "BLOB",
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(PropertyState::Idle),
            "Ok" => Some(PropertyState::Ok),
            "Busy" => Some(PropertyState::Busy),
            "Alert" => Some(PropertyState::Alert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl Permission {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ro" => Some(Permission::ReadOnly),
            "wo" => Some(Permission::WriteOnly),
            "rw" => Some(Permission::ReadWrite),
            _ => None,
        }
    }
}

/// Switch vector selection rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchRule {
    /// Exactly one element on (radio-button semantics)
    #[default]
    OneOfMany,
    /// Zero or one element on
    AtMostOne,
    /// Any combination of elements on
    AnyOfMany,
}

impl SwitchRule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OneOfMany" => Some(SwitchRule::OneOfMany),
            "AtMostOne" => Some(SwitchRule::AtMostOne),
            "AnyOfMany" => Some(SwitchRule::AnyOfMany),
            _ => None,
        }
    }

    /// Whether turning one element on must reset its siblings
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, SwitchRule::AnyOfMany)
    }
}

/// BLOB delivery policy sent with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlobPolicy {
    #[default]
    Never,
    Also,
    Only,
}

impl BlobPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobPolicy::Never => "Never",
            BlobPolicy::Also => "Also",
            BlobPolicy::Only => "Only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Never" => Some(BlobPolicy::Never),
            "Also" => Some(BlobPolicy::Also),
            "Only" => Some(BlobPolicy::Only),
            _ => None,
        }
    }
}

/// Why the listener loop exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit `disconnect_server` call
    Clean,
    /// Unexpected closure, read error, or malformed markup
    Error(String),
}

/// Client configuration. Persistable through a [`settings::SettingsStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// TCP connect timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Log volume, 0-2: 0 silences per-message logs, 1 keeps warnings,
    /// 2 adds wire traces. No protocol behavior changes.
    pub verbosity: u8,
    /// Default BLOB delivery policy
    pub blob_policy: BlobPolicy,
    /// Directory for downloaded BLOB payloads (system temp when unset)
    pub download_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: INDI_DEFAULT_PORT,
            connect_timeout_secs: 30,
            verbosity: 1,
            blob_policy: BlobPolicy::Never,
            download_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }
}
