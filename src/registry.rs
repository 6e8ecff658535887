//! Device/property registry
//!
//! The authoritative in-memory model of the connected server: devices in
//! definition order, each owning its property vectors, each vector owning
//! its elements. All mutation happens through the dispatcher (inbound) or
//! the optimistic apply-new helpers (outbound); both run under the shared
//! state lock.

use crate::error::DispatchError;
use crate::numfmt;
use crate::{Permission, PropertyKind, PropertyState, SwitchRule};

/// A single typed value within a property vector.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    Text(String),
    Number {
        value: f64,
        format: Option<String>,
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
    },
    Switch(bool),
    Light(PropertyState),
    Blob {
        format: String,
        size: usize,
        data: Vec<u8>,
    },
}

impl ElementValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            ElementValue::Text(_) => PropertyKind::Text,
            ElementValue::Number { .. } => PropertyKind::Number,
            ElementValue::Switch(_) => PropertyKind::Switch,
            ElementValue::Light(_) => PropertyKind::Light,
            ElementValue::Blob { .. } => PropertyKind::Blob,
        }
    }

    /// Display form used for change records and property listings. Numbers
    /// honor their INDI format string.
    pub fn display(&self) -> String {
        match self {
            ElementValue::Text(text) => text.clone(),
            ElementValue::Number { value, format, .. } => {
                numfmt::format_number(*value, format.as_deref())
            }
            ElementValue::Switch(on) => if *on { "On" } else { "Off" }.to_string(),
            ElementValue::Light(state) => state.as_str().to_string(),
            ElementValue::Blob { format, size, .. } => {
                format!("{} byte BLOB ({})", size, format)
            }
        }
    }
}

/// A named value within a property vector. Names are unique per vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub label: String,
    pub value: ElementValue,
}

/// A property vector: a named, typed group of elements on a device.
/// The kind never changes after definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub kind: PropertyKind,
    pub state: PropertyState,
    pub perm: Permission,
    /// Selection rule, switch vectors only
    pub rule: Option<SwitchRule>,
    pub timestamp: Option<String>,
    pub elements: Vec<Element>,
}

impl Property {
    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    /// The element currently on, for switch vectors.
    pub fn on_switch(&self) -> Option<&Element> {
        self.elements
            .iter()
            .find(|e| matches!(e.value, ElementValue::Switch(true)))
    }

    /// Turn one switch element on or off locally. Under an exclusive rule
    /// (one-of-many, at-most-one) turning an element on resets every
    /// sibling off first. Returns false when the element does not exist.
    pub fn select_switch(&mut self, element: &str, on: bool) -> bool {
        if self.element(element).is_none() {
            return false;
        }
        let exclusive = self.rule.unwrap_or_default().is_exclusive();
        if on && exclusive {
            for e in &mut self.elements {
                if let ElementValue::Switch(state) = &mut e.value {
                    *state = false;
                }
            }
        }
        if let Some(e) = self.element_mut(element) {
            e.value = ElementValue::Switch(on);
        }
        true
    }
}

/// A named remote peripheral and its property vectors, in definition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub name: String,
    pub properties: Vec<Property>,
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// Add a newly defined property. Redefining an existing key is the
    /// non-fatal duplication condition; the registry is left unchanged.
    pub fn define_property(&mut self, property: Property) -> Result<(), DispatchError> {
        if self.property(&property.name).is_some() {
            return Err(DispatchError::PropertyDuplicated {
                device: self.name.clone(),
                property: property.name,
            });
        }
        self.properties.push(property);
        Ok(())
    }

    pub fn remove_property(&mut self, name: &str) -> Result<Property, DispatchError> {
        match self.properties.iter().position(|p| p.name == name) {
            Some(index) => Ok(self.properties.remove(index)),
            None => Err(DispatchError::PropertyNotFound {
                device: self.name.clone(),
                property: name.to_string(),
            }),
        }
    }
}

/// All devices known to the connection, in order of first reference.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    /// Find or create a device. Exactly one instance exists per name.
    pub fn add_device(&mut self, name: &str) -> &mut Device {
        let index = match self.devices.iter().position(|d| d.name == name) {
            Some(index) => index,
            None => {
                self.devices.push(Device::new(name));
                self.devices.len() - 1
            }
        };
        &mut self.devices[index]
    }

    pub fn remove_device(&mut self, name: &str) -> Result<Device, DispatchError> {
        match self.devices.iter().position(|d| d.name == name) {
            Some(index) => Ok(self.devices.remove(index)),
            None => Err(DispatchError::DeviceNotFound(name.to_string())),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn property(&self, device: &str, name: &str) -> Option<&Property> {
        self.device(device).and_then(|d| d.property(name))
    }

    pub fn property_mut(&mut self, device: &str, name: &str) -> Option<&mut Property> {
        self.device_mut(device).and_then(|d| d.property_mut(name))
    }

    /// Tear down all state (connection shutdown).
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
