//! Change notification
//!
//! A device reports to at most one [`DeviceObserver`]. The observer is held
//! by a [`Mediator`], which is either detached or attached; there is no
//! nullable pointer to check at each call site.

use crate::property::Property;
use crate::value::BlobWidget;
use std::sync::Arc;

/// Receives property lifecycle and message events from a device
///
/// Every callback runs after the mutation it reports is complete, while the
/// property is held under a read lock. Callbacks must not try to write the
/// property they are given. All methods default to doing nothing.
pub trait DeviceObserver: Send + Sync {
    fn on_property_defined(&self, _property: &Property) {}

    fn on_property_deleted(&self, _device: &str, _name: &str) {}

    fn on_number(&self, _property: &Property) {}

    fn on_switch(&self, _property: &Property) {}

    fn on_text(&self, _property: &Property) {}

    fn on_light(&self, _property: &Property) {}

    /// One call per `oneBLOB`, including zero-size ones
    fn on_blob(&self, _property: &Property, _blob: &BlobWidget) {}

    /// `index` addresses the device's message log
    fn on_message(&self, _device: &str, _index: usize) {}
}

/// Observer slot of a device
#[derive(Clone, Default)]
pub enum Mediator {
    #[default]
    Detached,
    Attached(Arc<dyn DeviceObserver>),
}

impl Mediator {
    pub fn is_attached(&self) -> bool {
        matches!(self, Mediator::Attached(_))
    }

    /// Run `f` against the observer, if there is one
    pub fn notify(&self, f: impl FnOnce(&dyn DeviceObserver)) {
        if let Mediator::Attached(observer) = self {
            f(observer.as_ref());
        }
    }

    /// Per-kind update callback for a property
    pub fn notify_update(&self, property: &Property) {
        use crate::value::PropertyKind;

        self.notify(|o| match property.kind() {
            PropertyKind::Number => o.on_number(property),
            PropertyKind::Switch => o.on_switch(property),
            PropertyKind::Text => o.on_text(property),
            PropertyKind::Light => o.on_light(property),
            // BLOBs are reported per widget by the device
            PropertyKind::Blob => {}
        });
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mediator::Detached => f.write_str("Detached"),
            Mediator::Attached(_) => f.write_str("Attached"),
        }
    }
}
