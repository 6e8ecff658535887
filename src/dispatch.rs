//! Inbound message dispatch
//!
//! Routes one complete top-level XML element from the server into the
//! shared state: `message`, `delProperty`, the `def*Vector` definitions and
//! the `set*Vector` updates. Runs under the shared lock so a mutation and
//! its change records land atomically.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::broadcast;
use tracing::warn;

use crate::client::ClientEvent;
use crate::error::DispatchError;
use crate::numfmt;
use crate::registry::{Element, ElementValue, Property};
use crate::state::{BlobArtifact, ChangeKind, Shared};
use crate::xml::XmlElement;
use crate::{Permission, PropertyKind, PropertyState, SwitchRule};

/// Apply one server element to the shared state, emitting events for any
/// subscribers. Errors are per-message: the caller decides which are fatal.
/// `verbosity` gates the per-message log volume (0 silences it).
pub fn dispatch(
    shared: &mut Shared,
    root: &XmlElement,
    events: &broadcast::Sender<ClientEvent>,
    verbosity: u8,
) -> Result<(), DispatchError> {
    match root.tag.as_str() {
        "message" => message_cmd(shared, root, events),
        "delProperty" => del_property_cmd(shared, root, events),
        "defTextVector" => def_cmd(shared, root, events, PropertyKind::Text, verbosity),
        "defNumberVector" => def_cmd(shared, root, events, PropertyKind::Number, verbosity),
        "defSwitchVector" => def_cmd(shared, root, events, PropertyKind::Switch, verbosity),
        "defLightVector" => def_cmd(shared, root, events, PropertyKind::Light, verbosity),
        "defBLOBVector" => def_cmd(shared, root, events, PropertyKind::Blob, verbosity),
        "setTextVector" => set_cmd(shared, root, events, PropertyKind::Text, verbosity),
        "setNumberVector" => set_cmd(shared, root, events, PropertyKind::Number, verbosity),
        "setSwitchVector" => set_cmd(shared, root, events, PropertyKind::Switch, verbosity),
        "setLightVector" => set_cmd(shared, root, events, PropertyKind::Light, verbosity),
        "setBLOBVector" => set_cmd(shared, root, events, PropertyKind::Blob, verbosity),
        // Echoes of our own commands; no correlation tracking, drop them.
        tag if tag.starts_with("new") => Ok(()),
        _ => Err(DispatchError::UnknownTag(root.tag.clone())),
    }
}

fn required_attr<'a>(
    root: &'a XmlElement,
    name: &'static str,
) -> Result<&'a str, DispatchError> {
    root.attr(name).ok_or(DispatchError::MissingAttribute {
        tag: root.tag.clone(),
        attr: name,
    })
}

fn message_cmd(
    shared: &mut Shared,
    root: &XmlElement,
    events: &broadcast::Sender<ClientEvent>,
) -> Result<(), DispatchError> {
    // Messages without a device, or for devices we have never seen, are
    // dropped.
    let Some(device) = root.attr("device") else {
        return Ok(());
    };
    if shared.registry.device(device).is_none() {
        return Ok(());
    }
    let text = root.attr("message").unwrap_or_default();
    shared.note_message(device, root.attr("timestamp"), text);
    if let Some(message) = shared.last_message.clone() {
        let _ = events.send(ClientEvent::Message(message));
    }
    Ok(())
}

/// `delProperty` and `set*Vector` may carry a piggybacked `message`
/// attribute; record it like a standalone `message` element.
fn note_attached_message(
    shared: &mut Shared,
    root: &XmlElement,
    device: &str,
    events: &broadcast::Sender<ClientEvent>,
) {
    if let Some(text) = root.attr("message") {
        if shared.registry.device(device).is_some() {
            shared.note_message(device, root.attr("timestamp"), text);
            if let Some(message) = shared.last_message.clone() {
                let _ = events.send(ClientEvent::Message(message));
            }
        }
    }
}

fn del_property_cmd(
    shared: &mut Shared,
    root: &XmlElement,
    events: &broadcast::Sender<ClientEvent>,
) -> Result<(), DispatchError> {
    let device = required_attr(root, "device")?;
    note_attached_message(shared, root, device, events);
    match root.attr("name") {
        Some(name) => {
            let removed = shared
                .registry
                .device_mut(device)
                .ok_or_else(|| DispatchError::DeviceNotFound(device.to_string()))?
                .remove_property(name)?;
            shared.record(ChangeKind::Remove, &removed);
            let _ = events.send(ClientEvent::PropertyDeleted {
                device: device.to_string(),
                property: name.to_string(),
            });
        }
        None => {
            let removed = shared.registry.remove_device(device)?;
            for property in &removed.properties {
                shared.record(ChangeKind::Remove, property);
            }
            let _ = events.send(ClientEvent::DeviceDeleted(device.to_string()));
        }
    }
    Ok(())
}

fn def_cmd(
    shared: &mut Shared,
    root: &XmlElement,
    events: &broadcast::Sender<ClientEvent>,
    kind: PropertyKind,
    verbosity: u8,
) -> Result<(), DispatchError> {
    let device = required_attr(root, "device")?;
    let name = required_attr(root, "name")?;

    let mut property = Property {
        device: device.to_string(),
        name: name.to_string(),
        label: root.attr("label").unwrap_or(name).to_string(),
        group: root.attr("group").unwrap_or_default().to_string(),
        kind,
        state: root
            .attr("state")
            .and_then(PropertyState::parse)
            .unwrap_or_default(),
        perm: root
            .attr("perm")
            .and_then(Permission::parse)
            .unwrap_or_default(),
        rule: match kind {
            PropertyKind::Switch => Some(
                root.attr("rule")
                    .and_then(SwitchRule::parse)
                    .unwrap_or_default(),
            ),
            _ => None,
        },
        timestamp: root.attr("timestamp").map(str::to_string),
        elements: Vec::new(),
    };

    for child in &root.children {
        let Some(element_name) = child.attr("name") else {
            return Err(DispatchError::MissingAttribute {
                tag: child.tag.clone(),
                attr: "name",
            });
        };
        let value = match (kind, child.tag.as_str()) {
            (PropertyKind::Text, "defText") => ElementValue::Text(child.text.clone()),
            (PropertyKind::Number, "defNumber") => ElementValue::Number {
                value: numfmt::parse_number(&child.text).unwrap_or(0.0),
                format: child.attr("format").map(str::to_string),
                min: child.attr("min").and_then(|s| numfmt::parse_number(s)),
                max: child.attr("max").and_then(|s| numfmt::parse_number(s)),
                step: child.attr("step").and_then(|s| numfmt::parse_number(s)),
            },
            (PropertyKind::Switch, "defSwitch") => {
                ElementValue::Switch(child.text.trim() == "On")
            }
            (PropertyKind::Light, "defLight") => ElementValue::Light(
                PropertyState::parse(child.text.trim()).unwrap_or_default(),
            ),
            (PropertyKind::Blob, "defBLOB") => ElementValue::Blob {
                format: child.attr("format").unwrap_or_default().to_string(),
                size: 0,
                data: Vec::new(),
            },
            _ => {
                if verbosity >= 1 {
                    warn!(tag = %child.tag, vector = %root.tag, "unexpected child element");
                }
                continue;
            }
        };
        property.elements.push(Element {
            name: element_name.to_string(),
            label: child.attr("label").unwrap_or(element_name).to_string(),
            value,
        });
    }

    let known = shared.registry.device(device).is_some();
    shared.registry.add_device(device);
    if !known {
        let _ = events.send(ClientEvent::DeviceDefined(device.to_string()));
    }

    let snapshot = property.clone();
    shared
        .registry
        .device_mut(device)
        .ok_or_else(|| DispatchError::DeviceNotFound(device.to_string()))?
        .define_property(property)?;
    shared.record(ChangeKind::Create, &snapshot);
    let _ = events.send(ClientEvent::PropertyDefined {
        device: device.to_string(),
        property: name.to_string(),
    });
    Ok(())
}

fn set_cmd(
    shared: &mut Shared,
    root: &XmlElement,
    events: &broadcast::Sender<ClientEvent>,
    kind: PropertyKind,
    verbosity: u8,
) -> Result<(), DispatchError> {
    let device = required_attr(root, "device")?;
    let name = required_attr(root, "name")?;

    if shared.registry.device(device).is_none() {
        return Err(DispatchError::DeviceNotFound(device.to_string()));
    }
    note_attached_message(shared, root, device, events);

    let mut blobs: Vec<BlobArtifact> = Vec::new();
    {
        let prop = shared.registry.property_mut(device, name).ok_or_else(|| {
            DispatchError::PropertyNotFound {
                device: device.to_string(),
                property: name.to_string(),
            }
        })?;
        if prop.kind != kind {
            return Err(DispatchError::TypeMismatch {
                device: device.to_string(),
                property: name.to_string(),
                tag: root.tag.clone(),
            });
        }

        if let Some(state) = root.attr("state").and_then(PropertyState::parse) {
            prop.state = state;
        }
        if let Some(timestamp) = root.attr("timestamp") {
            prop.timestamp = Some(timestamp.to_string());
        }

        for child in &root.children {
            let Some(element_name) = child.attr("name") else {
                if verbosity >= 1 {
                    warn!(tag = %child.tag, "set element without a name, skipped");
                }
                continue;
            };
            let Some(element) = prop.element_mut(element_name) else {
                if verbosity >= 1 {
                    warn!(
                        device,
                        property = name,
                        element = element_name,
                        "update for undefined element, skipped"
                    );
                }
                continue;
            };
            match (&mut element.value, child.tag.as_str()) {
                (ElementValue::Text(text), "oneText") => {
                    *text = child.text.clone();
                }
                (ElementValue::Number { value, .. }, "oneNumber") => {
                    if let Some(v) = numfmt::parse_number(&child.text) {
                        *value = v;
                    } else if verbosity >= 1 {
                        warn!(
                            device,
                            property = name,
                            element = element_name,
                            body = %child.text,
                            "unparseable number body, skipped"
                        );
                    }
                }
                (ElementValue::Switch(on), "oneSwitch") => {
                    *on = child.text.trim() == "On";
                }
                (ElementValue::Light(state), "oneLight") => {
                    if let Some(s) = PropertyState::parse(child.text.trim()) {
                        *state = s;
                    }
                }
                (ElementValue::Blob { format, size, data }, "oneBLOB") => {
                    if let Some(f) = child.attr("format") {
                        *format = f.to_string();
                    }
                    let compact: String = child
                        .text
                        .chars()
                        .filter(|c| !c.is_whitespace())
                        .collect();
                    match BASE64.decode(compact.as_bytes()) {
                        Ok(decoded) => {
                            *size = decoded.len();
                            *data = decoded.clone();
                            blobs.push(BlobArtifact {
                                device: device.to_string(),
                                property: name.to_string(),
                                element: element_name.to_string(),
                                format: format.clone(),
                                data: decoded,
                            });
                        }
                        Err(err) => {
                            if verbosity >= 1 {
                                warn!(
                                    device,
                                    property = name,
                                    element = element_name,
                                    %err,
                                    "undecodable BLOB body, skipped"
                                );
                            }
                        }
                    }
                }
                _ => {
                    if verbosity >= 1 {
                        warn!(
                            device,
                            property = name,
                            element = element_name,
                            tag = %child.tag,
                            "element update of the wrong type, skipped"
                        );
                    }
                }
            }
        }

        let snapshot = prop.clone();
        shared.record(ChangeKind::Update, &snapshot);
    }

    for artifact in blobs {
        shared.queue_blob(artifact);
    }
    let _ = events.send(ClientEvent::PropertyUpdated {
        device: device.to_string(),
        property: name.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::ElementReader;

    fn feed(shared: &mut Shared, xml: &str) -> Vec<Result<(), DispatchError>> {
        feed_at(shared, xml, 1)
    }

    fn feed_at(
        shared: &mut Shared,
        xml: &str,
        verbosity: u8,
    ) -> Vec<Result<(), DispatchError>> {
        let (tx, _rx) = broadcast::channel(16);
        let elements = ElementReader::new().feed_slice(xml.as_bytes()).unwrap();
        elements
            .iter()
            .map(|root| dispatch(shared, root, &tx, verbosity))
            .collect()
    }

    const DEF_CONNECTION: &str = "\
<defSwitchVector device='Camera' name='CONNECTION' label='Connection' \
group='Main Control' state='Idle' perm='rw' rule='OneOfMany'>\
<defSwitch name='CONNECT' label='Connect'>Off</defSwitch>\
<defSwitch name='DISCONNECT' label='Disconnect'>On</defSwitch>\
</defSwitchVector>";

    #[test]
    fn definition_creates_device_and_property() {
        let mut shared = Shared::default();
        assert!(feed(&mut shared, DEF_CONNECTION).iter().all(|r| r.is_ok()));
        let prop = shared.registry.property("Camera", "CONNECTION").unwrap();
        assert_eq!(prop.kind, PropertyKind::Switch);
        assert_eq!(prop.rule, Some(SwitchRule::OneOfMany));
        assert_eq!(prop.on_switch().unwrap().name, "DISCONNECT");
        let changes = shared.drain_changes();
        assert_eq!(changes.created.len(), 2);
    }

    #[test]
    fn duplicate_definition_is_reported_but_keeps_first() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        let results = feed(&mut shared, DEF_CONNECTION);
        assert!(matches!(
            results[0],
            Err(DispatchError::PropertyDuplicated { .. })
        ));
        let device = shared.registry.device("Camera").unwrap();
        assert_eq!(device.properties.len(), 1);
    }

    #[test]
    fn set_updates_value_and_state() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        shared.drain_changes();
        let results = feed(
            &mut shared,
            "<setSwitchVector device='Camera' name='CONNECTION' state='Ok'>\
             <oneSwitch name='CONNECT'>On</oneSwitch>\
             <oneSwitch name='DISCONNECT'>Off</oneSwitch>\
             </setSwitchVector>",
        );
        assert!(results.iter().all(|r| r.is_ok()));
        let prop = shared.registry.property("Camera", "CONNECTION").unwrap();
        assert_eq!(prop.state, PropertyState::Ok);
        assert_eq!(prop.on_switch().unwrap().name, "CONNECT");
        let changes = shared.drain_changes();
        assert_eq!(changes.updated.len(), 2);
    }

    #[test]
    fn set_echo_reconciles_optimistic_busy() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        let command = shared
            .apply_new_switch("Camera", "CONNECTION", "CONNECT", true)
            .unwrap();
        assert!(command.contains("On"));
        assert_eq!(
            shared.registry.property("Camera", "CONNECTION").unwrap().state,
            PropertyState::Busy
        );
        feed(
            &mut shared,
            "<setSwitchVector device='Camera' name='CONNECTION' state='Ok'>\
             <oneSwitch name='CONNECT'>On</oneSwitch>\
             </setSwitchVector>",
        );
        assert_eq!(
            shared.registry.property("Camera", "CONNECTION").unwrap().state,
            PropertyState::Ok
        );
    }

    #[test]
    fn set_for_unknown_targets_errors() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        let results = feed(
            &mut shared,
            "<setSwitchVector device='Ghost' name='CONNECTION'/>",
        );
        assert!(matches!(results[0], Err(DispatchError::DeviceNotFound(_))));
        let results = feed(
            &mut shared,
            "<setSwitchVector device='Camera' name='NO_SUCH'/>",
        );
        assert!(matches!(
            results[0],
            Err(DispatchError::PropertyNotFound { .. })
        ));
    }

    #[test]
    fn set_with_wrong_kind_is_a_type_mismatch() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        let results = feed(
            &mut shared,
            "<setTextVector device='Camera' name='CONNECTION'>\
             <oneText name='CONNECT'>On</oneText>\
             </setTextVector>",
        );
        assert!(matches!(
            results[0],
            Err(DispatchError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn del_property_removes_one_property() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        shared.drain_changes();
        feed(
            &mut shared,
            "<delProperty device='Camera' name='CONNECTION'/>",
        );
        assert!(shared.registry.property("Camera", "CONNECTION").is_none());
        assert!(shared.registry.device("Camera").is_some());
        assert_eq!(shared.drain_changes().removed.len(), 2);
    }

    #[test]
    fn del_property_without_name_removes_device() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        feed(&mut shared, "<delProperty device='Camera'/>");
        assert!(shared.registry.device("Camera").is_none());
    }

    #[test]
    fn number_definition_parses_metadata_and_sexagesimal_updates() {
        let mut shared = Shared::default();
        feed(
            &mut shared,
            "<defNumberVector device='Mount' name='EQUATORIAL_EOD_COORD' state='Idle' perm='rw'>\
             <defNumber name='RA' label='RA' format='%10.6m' min='0' max='24' step='0'>0</defNumber>\
             <defNumber name='DEC' label='DEC' format='%10.6m' min='-90' max='90' step='0'>0</defNumber>\
             </defNumberVector>",
        );
        feed(
            &mut shared,
            "<setNumberVector device='Mount' name='EQUATORIAL_EOD_COORD' state='Ok'>\
             <oneNumber name='RA'>12:30:00</oneNumber>\
             </setNumberVector>",
        );
        let prop = shared
            .registry
            .property("Mount", "EQUATORIAL_EOD_COORD")
            .unwrap();
        match &prop.element("RA").unwrap().value {
            ElementValue::Number { value, max, .. } => {
                assert!((value - 12.5).abs() < 1e-9);
                assert_eq!(*max, Some(24.0));
            }
            other => panic!("wrong value: {:?}", other),
        }
    }

    #[test]
    fn blob_body_is_base64_decoded_across_line_breaks() {
        let mut shared = Shared::default();
        feed(
            &mut shared,
            "<defBLOBVector device='Camera' name='CCD1' state='Idle' perm='ro'>\
             <defBLOB name='CCD1' label='Image'/>\
             </defBLOBVector>",
        );
        // "ABCDEFG" split across lines the way servers stream it
        feed(
            &mut shared,
            "<setBLOBVector device='Camera' name='CCD1' state='Ok'>\
             <oneBLOB name='CCD1' size='7' format='.fits'>QUJD\nREVG\nRw==\n</oneBLOB>\
             </setBLOBVector>",
        );
        let artifacts = shared.take_pending_blobs();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].data, b"ABCDEFG");
        assert_eq!(artifacts[0].format, ".fits");
        assert!(shared.image_downloaded);
    }

    #[test]
    fn message_for_known_device_is_noted() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        feed(
            &mut shared,
            "<message device='Camera' timestamp='2026-08-23T01:02:03' message='ready'/>",
        );
        let message = shared.last_message.clone().unwrap();
        assert_eq!(message.text, "ready");
        // unknown device: dropped, last message unchanged
        feed(&mut shared, "<message device='Ghost' message='boo'/>");
        assert_eq!(shared.last_message.unwrap().text, "ready");
    }

    #[test]
    fn set_with_message_attribute_records_the_message() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        feed(
            &mut shared,
            "<setSwitchVector device='Camera' name='CONNECTION' state='Ok' \
             message='Camera is now connected'>\
             <oneSwitch name='CONNECT'>On</oneSwitch>\
             </setSwitchVector>",
        );
        let message = shared.last_message.clone().unwrap();
        assert_eq!(message.text, "Camera is now connected");
        assert_eq!(message.device, "Camera");
    }

    #[test]
    fn message_without_device_is_ignored() {
        let mut shared = Shared::default();
        feed(&mut shared, DEF_CONNECTION);
        let results = feed(&mut shared, "<message message='orphan'/>");
        assert!(results[0].is_ok());
        assert!(shared.last_message.is_none());
    }

    #[test]
    fn verbosity_zero_silences_per_message_logs() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counter(Arc<AtomicUsize>);
        impl tracing::Subscriber for Counter {
            fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
                true
            }
            fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
                tracing::span::Id::from_u64(1)
            }
            fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}
            fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}
            fn event(&self, _: &tracing::Event<'_>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn enter(&self, _: &tracing::span::Id) {}
            fn exit(&self, _: &tracing::span::Id) {}
        }

        // an update naming an undefined element is the logged condition
        let noisy = "<setSwitchVector device='Camera' name='CONNECTION' state='Ok'>\
                     <oneSwitch name='NO_SUCH'>On</oneSwitch>\
                     </setSwitchVector>";

        let silent = Arc::new(AtomicUsize::new(0));
        tracing::subscriber::with_default(Counter(Arc::clone(&silent)), || {
            let mut shared = Shared::default();
            feed_at(&mut shared, DEF_CONNECTION, 0);
            feed_at(&mut shared, noisy, 0);
        });
        assert_eq!(silent.load(Ordering::SeqCst), 0);

        let loud = Arc::new(AtomicUsize::new(0));
        tracing::subscriber::with_default(Counter(Arc::clone(&loud)), || {
            let mut shared = Shared::default();
            feed_at(&mut shared, DEF_CONNECTION, 1);
            feed_at(&mut shared, noisy, 1);
        });
        assert!(loud.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn new_echoes_and_unknown_tags() {
        let mut shared = Shared::default();
        let results = feed(
            &mut shared,
            "<newSwitchVector device='Camera' name='CONNECTION'/>",
        );
        assert!(results[0].is_ok());
        let results = feed(&mut shared, "<bogusTag device='Camera'/>");
        assert!(matches!(results[0], Err(DispatchError::UnknownTag(_))));
    }
}
