//! Shared connection state
//!
//! One [`Shared`] instance sits behind an `Arc<tokio::sync::Mutex<..>>`,
//! owned jointly by the listener task and the client facade. It holds the
//! registry, the change accumulation buffers, the last broadcast server
//! message, and BLOB artifacts awaiting download. Keeping the registry and
//! the buffers under the same lock means every registry mutation and its
//! change record appear atomically to observers.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::registry::{ElementValue, Property, Registry};
use crate::{wire, DisconnectReason, PropertyKind, PropertyState};

/// One observed element-level change, in display form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub device: String,
    pub property: String,
    pub element: String,
    /// Formatted value at the time of the change
    pub value: String,
    pub state: PropertyState,
}

/// The three buffers drained together by [`Shared::drain_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: Vec<PropertyChange>,
    pub removed: Vec<PropertyChange>,
    pub updated: Vec<PropertyChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Which buffer a change record lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Remove,
    Update,
}

/// A broadcast `message` element from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub device: String,
    pub timestamp: Option<String>,
    pub text: String,
    /// Monotonic sequence number, distinguishes repeated identical texts
    pub seq: u64,
}

/// A received BLOB payload, decoded and queued for download to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobArtifact {
    pub device: String,
    pub property: String,
    pub element: String,
    /// Format hint, conventionally a file extension such as `.fits`
    pub format: String,
    pub data: Vec<u8>,
}

impl BlobArtifact {
    /// File name the artifact is saved under.
    pub fn file_name(&self) -> String {
        format!("{}_{}_{}{}", self.device, self.property, self.element, self.format)
            .replace(['/', '\\', ' '], "_")
    }
}

/// Everything the listener and the facade share.
#[derive(Debug, Default)]
pub struct Shared {
    pub registry: Registry,
    /// Outbound command queue. The only long-lived sender: clearing it on
    /// disconnect lets the writer task exit and drop the write half.
    pub cmd_tx: Option<mpsc::Sender<String>>,
    created: Vec<PropertyChange>,
    removed: Vec<PropertyChange>,
    updated: Vec<PropertyChange>,
    pub last_message: Option<ServerMessage>,
    message_seq: u64,
    pub image_downloaded: bool,
    pub last_download_path: Option<PathBuf>,
    pending_blobs: Vec<BlobArtifact>,
    pub disconnect_reason: Option<DisconnectReason>,
}

impl Shared {
    /// Push one change record per element of the property into the buffer
    /// selected by `kind`.
    pub fn record(&mut self, kind: ChangeKind, property: &Property) {
        let buffer = match kind {
            ChangeKind::Create => &mut self.created,
            ChangeKind::Remove => &mut self.removed,
            ChangeKind::Update => &mut self.updated,
        };
        for element in &property.elements {
            buffer.push(PropertyChange {
                device: property.device.clone(),
                property: property.name.clone(),
                element: element.name.clone(),
                value: element.value.display(),
                state: property.state,
            });
        }
    }

    /// Atomically take all accumulated changes, leaving the buffers empty.
    pub fn drain_changes(&mut self) -> ChangeSet {
        ChangeSet {
            created: std::mem::take(&mut self.created),
            removed: std::mem::take(&mut self.removed),
            updated: std::mem::take(&mut self.updated),
        }
    }

    pub fn note_message(&mut self, device: &str, timestamp: Option<&str>, text: &str) {
        self.message_seq += 1;
        self.last_message = Some(ServerMessage {
            device: device.to_string(),
            timestamp: timestamp.map(str::to_string),
            text: text.to_string(),
            seq: self.message_seq,
        });
    }

    pub fn queue_blob(&mut self, artifact: BlobArtifact) {
        self.pending_blobs.push(artifact);
        self.image_downloaded = true;
    }

    pub fn take_pending_blobs(&mut self) -> Vec<BlobArtifact> {
        std::mem::take(&mut self.pending_blobs)
    }

    /// Optimistically apply a text update and encode the outbound command.
    /// Returns `None` when the target property does not exist or is not a
    /// text vector; the caller treats that as a no-op.
    pub fn apply_new_text(
        &mut self,
        device: &str,
        property: &str,
        elements: &[(&str, &str)],
    ) -> Option<String> {
        let prop = self.registry.property_mut(device, property)?;
        if prop.kind != PropertyKind::Text {
            return None;
        }
        for (name, text) in elements {
            if let Some(element) = prop.element_mut(name) {
                element.value = ElementValue::Text(text.to_string());
            }
        }
        prop.state = PropertyState::Busy;
        let all: Vec<(String, String)> = prop
            .elements
            .iter()
            .filter_map(|e| match &e.value {
                ElementValue::Text(text) => Some((e.name.clone(), text.clone())),
                _ => None,
            })
            .collect();
        let pairs: Vec<(&str, &str)> =
            all.iter().map(|(n, t)| (n.as_str(), t.as_str())).collect();
        let command = wire::new_text_vector(device, property, &pairs);
        let snapshot = prop.clone();
        self.record(ChangeKind::Update, &snapshot);
        Some(command)
    }

    /// Optimistic number update, same contract as [`Self::apply_new_text`].
    pub fn apply_new_number(
        &mut self,
        device: &str,
        property: &str,
        elements: &[(&str, f64)],
    ) -> Option<String> {
        let prop = self.registry.property_mut(device, property)?;
        if prop.kind != PropertyKind::Number {
            return None;
        }
        for (name, new_value) in elements {
            if let Some(element) = prop.element_mut(name) {
                if let ElementValue::Number { value, .. } = &mut element.value {
                    *value = *new_value;
                }
            }
        }
        prop.state = PropertyState::Busy;
        let all: Vec<(String, f64)> = prop
            .elements
            .iter()
            .filter_map(|e| match &e.value {
                ElementValue::Number { value, .. } => Some((e.name.clone(), *value)),
                _ => None,
            })
            .collect();
        let pairs: Vec<(&str, f64)> = all.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        let command = wire::new_number_vector(device, property, &pairs);
        let snapshot = prop.clone();
        self.record(ChangeKind::Update, &snapshot);
        Some(command)
    }

    /// Optimistically select one switch element (resetting siblings under an
    /// exclusive rule) and encode the full vector. `None` when the property
    /// or element is unknown.
    pub fn apply_new_switch(
        &mut self,
        device: &str,
        property: &str,
        element: &str,
        on: bool,
    ) -> Option<String> {
        let prop = self.registry.property_mut(device, property)?;
        if prop.kind != PropertyKind::Switch {
            return None;
        }
        if !prop.select_switch(element, on) {
            return None;
        }
        prop.state = PropertyState::Busy;
        let all: Vec<(String, bool)> = prop
            .elements
            .iter()
            .filter_map(|e| match e.value {
                ElementValue::Switch(state) => Some((e.name.clone(), state)),
                _ => None,
            })
            .collect();
        let pairs: Vec<(&str, bool)> = all.iter().map(|(n, s)| (n.as_str(), *s)).collect();
        let command = wire::new_switch_vector(device, property, &pairs);
        let snapshot = prop.clone();
        self.record(ChangeKind::Update, &snapshot);
        Some(command)
    }

    /// Listener exit path: drop all connection-scoped state and remember
    /// why. Dropping `cmd_tx` stops the writer task, which closes the write
    /// half of the socket.
    pub fn reset_on_disconnect(&mut self, reason: DisconnectReason) {
        self.registry.clear();
        self.cmd_tx = None;
        self.created.clear();
        self.removed.clear();
        self.updated.clear();
        self.pending_blobs.clear();
        self.disconnect_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Element;
    use crate::{Permission, SwitchRule};

    fn seed_connection(shared: &mut Shared) {
        let device = shared.registry.add_device("Camera");
        device
            .define_property(Property {
                device: "Camera".to_string(),
                name: "CONNECTION".to_string(),
                label: "Connection".to_string(),
                group: "Main Control".to_string(),
                kind: PropertyKind::Switch,
                state: PropertyState::Idle,
                perm: Permission::ReadWrite,
                rule: Some(SwitchRule::OneOfMany),
                timestamp: None,
                elements: vec![
                    Element {
                        name: "CONNECT".to_string(),
                        label: "Connect".to_string(),
                        value: ElementValue::Switch(false),
                    },
                    Element {
                        name: "DISCONNECT".to_string(),
                        label: "Disconnect".to_string(),
                        value: ElementValue::Switch(true),
                    },
                ],
            })
            .unwrap();
    }

    #[test]
    fn apply_new_switch_goes_busy_and_encodes_all_elements() {
        let mut shared = Shared::default();
        seed_connection(&mut shared);
        let command = shared
            .apply_new_switch("Camera", "CONNECTION", "CONNECT", true)
            .unwrap();
        assert!(command.contains("<oneSwitch name='CONNECT'>On</oneSwitch>"));
        assert!(command.contains("<oneSwitch name='DISCONNECT'>Off</oneSwitch>"));
        let prop = shared.registry.property("Camera", "CONNECTION").unwrap();
        assert_eq!(prop.state, PropertyState::Busy);
        assert_eq!(prop.on_switch().unwrap().name, "CONNECT");
    }

    #[test]
    fn apply_new_on_unknown_property_is_a_no_op() {
        let mut shared = Shared::default();
        seed_connection(&mut shared);
        assert!(shared
            .apply_new_switch("Camera", "NO_SUCH", "CONNECT", true)
            .is_none());
        assert!(shared
            .apply_new_text("Camera", "CONNECTION", &[("CONNECT", "x")])
            .is_none());
        assert!(shared.drain_changes().is_empty());
    }

    #[test]
    fn drain_changes_empties_buffers() {
        let mut shared = Shared::default();
        seed_connection(&mut shared);
        shared
            .apply_new_switch("Camera", "CONNECTION", "CONNECT", true)
            .unwrap();
        let changes = shared.drain_changes();
        assert_eq!(changes.updated.len(), 2);
        assert!(changes.updated.iter().all(|c| c.state == PropertyState::Busy));
        assert!(shared.drain_changes().is_empty());
    }

    #[test]
    fn message_sequence_distinguishes_repeats() {
        let mut shared = Shared::default();
        shared.note_message("Camera", None, "exposure done");
        let first = shared.last_message.clone().unwrap();
        shared.note_message("Camera", None, "exposure done");
        let second = shared.last_message.clone().unwrap();
        assert_eq!(first.text, second.text);
        assert_ne!(first.seq, second.seq);
    }

    #[test]
    fn reset_clears_everything() {
        let mut shared = Shared::default();
        seed_connection(&mut shared);
        let (tx, _rx) = mpsc::channel(1);
        shared.cmd_tx = Some(tx);
        shared.queue_blob(BlobArtifact {
            device: "Camera".to_string(),
            property: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: vec![1, 2, 3],
        });
        shared.reset_on_disconnect(DisconnectReason::Clean);
        assert!(shared.registry.devices().is_empty());
        assert!(shared.take_pending_blobs().is_empty());
        assert!(shared.cmd_tx.is_none());
        assert_eq!(shared.disconnect_reason, Some(DisconnectReason::Clean));
    }

    #[test]
    fn blob_artifact_file_name_is_sanitized() {
        let artifact = BlobArtifact {
            device: "CCD Simulator".to_string(),
            property: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: Vec::new(),
        };
        assert_eq!(artifact.file_name(), "CCD_Simulator_CCD1_CCD1.fits");
    }
}
