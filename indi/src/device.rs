//! Device registry
//!
//! A [`Device`] owns the ordered property list of one INDI device, its
//! message log and its watch subscriptions, and reports changes to an
//! optional observer.
//!
//! Locking: the property list, the message log, the watch map and the
//! mediator each have their own lock, and none of them is held while an
//! observer or watch callback runs. A property's own lock is never taken
//! while the list lock is held. Updates take the property's write lock,
//! then downgrade it to a read lock for dispatch, so observers always see
//! the complete result of one element.

use crate::blob::{decode_payload, AttachmentStore, BlobContext};
use crate::codec::{self, MessageClass, Tag};
use crate::error::{IndiError, IndiResult};
use crate::observer::{DeviceObserver, Mediator};
use crate::property::{Property, PropertyHandle};
use crate::protocol::{standard_properties as sp, DriverInterface};
use crate::value::{Permission, PropertyKind, PropertyState, SwitchState};
use crate::xml::{parse_elements, XmlElement};
use crate::DeviceConfig;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One-shot callback run when a watched property is first added
pub type WatchCallback = Box<dyn FnOnce(&PropertyHandle) + Send>;

/// Timestamp format used on the wire and in the message log
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Property registry for a single INDI device
pub struct Device {
    config: DeviceConfig,
    name: RwLock<Option<String>>,
    properties: Mutex<Vec<PropertyHandle>>,
    messages: Mutex<VecDeque<String>>,
    watches: Mutex<HashMap<String, WatchCallback>>,
    mediator: RwLock<Mediator>,
    attachments: Arc<AttachmentStore>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_attachments(config, Arc::new(AttachmentStore::new()))
    }

    /// Create a device that takes shared-buffer BLOBs from `attachments`
    pub fn with_attachments(config: DeviceConfig, attachments: Arc<AttachmentStore>) -> Self {
        Self {
            name: RwLock::new(config.device_name.clone()),
            properties: Mutex::new(Vec::new()),
            messages: Mutex::new(VecDeque::new()),
            watches: Mutex::new(HashMap::new()),
            mediator: RwLock::new(Mediator::Detached),
            attachments,
            config,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    // ========================================================================
    // Name binding
    // ========================================================================

    /// Bound device name, if any element or caller has set one
    pub fn device_name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// Bind the device name
    ///
    /// Succeeds if the device is unbound or already bound to `name`.
    pub fn set_device_name(&self, name: &str) -> IndiResult<()> {
        let mut bound = self.name.write();
        match bound.as_deref() {
            None => {
                *bound = Some(name.to_string());
                Ok(())
            }
            Some(current) if current == name => Ok(()),
            Some(current) => Err(IndiError::DeviceMismatch {
                expected: current.to_string(),
                found: name.to_string(),
            }),
        }
    }

    pub fn is_device_name_match(&self, name: &str) -> bool {
        self.name.read().as_deref() == Some(name)
    }

    fn display_name(&self) -> String {
        self.device_name().unwrap_or_default()
    }

    // ========================================================================
    // Observer
    // ========================================================================

    pub fn set_observer(&self, observer: Arc<dyn DeviceObserver>) {
        *self.mediator.write() = Mediator::Attached(observer);
    }

    pub fn detach_observer(&self) {
        *self.mediator.write() = Mediator::Detached;
    }

    pub fn has_observer(&self) -> bool {
        self.mediator.read().is_attached()
    }

    fn mediator(&self) -> Mediator {
        self.mediator.read().clone()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Add a property; fails with [`IndiError::Duplicate`] if the name is taken
    ///
    /// Ghosts (`registered == false`) are stored silently. Anything else
    /// fires the matching watch, then the observer's definition callback.
    pub fn add_property(&self, mut property: Property) -> IndiResult<PropertyHandle> {
        self.adopt(&mut property)?;
        let handle = {
            let mut list = self.properties.lock();
            if list.iter().any(|h| h.name() == property.name) {
                return Err(self.duplicate(&property.name));
            }
            let handle = PropertyHandle::new(property);
            list.push(handle.clone());
            handle
        };
        self.announce(&handle);
        Ok(handle)
    }

    /// Idempotent add: promotes an existing entry of the same name and kind,
    /// or adds the property as a registered one
    ///
    /// Lookup and insert share one hold of the list lock, so concurrent
    /// callers registering the same name all get the same handle.
    pub fn register_property(&self, mut property: Property) -> IndiResult<PropertyHandle> {
        self.adopt(&mut property)?;
        let (handle, inserted) = {
            let mut list = self.properties.lock();
            let existing = list.iter().find(|h| h.name() == property.name).cloned();
            match existing {
                Some(handle) if handle.kind() == property.kind() => (handle, false),
                Some(_) => return Err(self.duplicate(&property.name)),
                None => {
                    property.set_registered(true);
                    let handle = PropertyHandle::new(property);
                    list.push(handle.clone());
                    (handle, true)
                }
            }
        };

        if inserted || handle.promote(None) {
            self.announce(&handle);
        }
        Ok(handle)
    }

    /// First registered property named `name`, optionally of one kind
    pub fn get_property(&self, name: &str, kind: Option<PropertyKind>) -> Option<PropertyHandle> {
        self.properties
            .lock()
            .iter()
            .find(|h| h.is_registered() && h.name() == name && kind.map_or(true, |k| h.kind() == k))
            .cloned()
    }

    pub fn get_number(&self, name: &str) -> Option<PropertyHandle> {
        self.get_property(name, Some(PropertyKind::Number))
    }

    pub fn get_switch(&self, name: &str) -> Option<PropertyHandle> {
        self.get_property(name, Some(PropertyKind::Switch))
    }

    pub fn get_text(&self, name: &str) -> Option<PropertyHandle> {
        self.get_property(name, Some(PropertyKind::Text))
    }

    pub fn get_light(&self, name: &str) -> Option<PropertyHandle> {
        self.get_property(name, Some(PropertyKind::Light))
    }

    pub fn get_blob(&self, name: &str) -> Option<PropertyHandle> {
        self.get_property(name, Some(PropertyKind::Blob))
    }

    /// Remove the first property named `name`
    ///
    /// The returned handle stays usable; the property is only freed once
    /// every holder has dropped its handle.
    pub fn remove_property(&self, name: &str) -> IndiResult<PropertyHandle> {
        let removed = {
            let mut list = self.properties.lock();
            list.iter()
                .position(|h| h.name() == name)
                .map(|index| list.remove(index))
        };

        let handle = removed.ok_or_else(|| IndiError::NotFound {
            device: self.display_name(),
            property: name.to_string(),
        })?;

        let device = self.display_name();
        self.mediator().notify(|o| o.on_property_deleted(&device, name));
        Ok(handle)
    }

    /// Snapshot of every entry in definition order, ghosts included
    pub fn properties(&self) -> Vec<PropertyHandle> {
        self.properties.lock().clone()
    }

    pub fn property_count(&self) -> usize {
        self.properties.lock().len()
    }

    /// Drop every property, as on disconnect
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.properties.lock());
        tracing::debug!("Cleared {} properties from '{}'", removed.len(), self.display_name());
    }

    /// Run `callback` the first time a property named `name` is added
    ///
    /// One-shot: the subscription is consumed when it fires. Registering
    /// again for the same name replaces a pending callback.
    pub fn watch_property<F>(&self, name: &str, callback: F)
    where
        F: FnOnce(&PropertyHandle) + Send + 'static,
    {
        self.watches.lock().insert(name.to_string(), Box::new(callback));
    }

    pub fn property_state(&self, name: &str) -> PropertyState {
        self.get_property(name, None)
            .map(|h| h.read().state)
            .unwrap_or_default()
    }

    pub fn property_permission(&self, name: &str) -> Permission {
        self.get_property(name, None)
            .map(|h| h.read().permission)
            .unwrap_or_default()
    }

    /// `CONNECTION` has `CONNECT` on and the vector is `Ok`
    pub fn is_connected(&self) -> bool {
        self.get_switch(sp::CONNECTION).map_or(false, |h| {
            let prop = h.read();
            prop.switch_state(sp::CONNECT) == Some(SwitchState::On) && prop.state == PropertyState::Ok
        })
    }

    pub fn driver_name(&self) -> Option<String> {
        self.driver_info(sp::DRIVER_NAME)
    }

    pub fn driver_exec(&self) -> Option<String> {
        self.driver_info(sp::DRIVER_EXEC)
    }

    pub fn driver_version(&self) -> Option<String> {
        self.driver_info(sp::DRIVER_VERSION)
    }

    /// Interface bit mask advertised by the driver
    pub fn driver_interface(&self) -> Option<DriverInterface> {
        self.driver_info(sp::DRIVER_INTERFACE)
            .and_then(|s| s.trim().parse().ok())
            .map(DriverInterface)
    }

    fn driver_info(&self, widget: &str) -> Option<String> {
        let handle = self.get_text(sp::DRIVER_INFO)?;
        let prop = handle.read();
        prop.text_value(widget).map(str::to_string)
    }

    // Binds the device name and fills in the property's device if blank
    fn adopt(&self, property: &mut Property) -> IndiResult<()> {
        if property.device.is_empty() {
            if let Some(name) = self.device_name() {
                property.device = name;
            }
            return Ok(());
        }
        self.set_device_name(&property.device)
    }

    // Refuses an element for another device without binding an unbound registry
    fn check_device(&self, device: &str) -> IndiResult<()> {
        match self.name.read().as_deref() {
            Some(current) if current != device => Err(IndiError::DeviceMismatch {
                expected: current.to_string(),
                found: device.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn duplicate(&self, name: &str) -> IndiError {
        IndiError::Duplicate {
            device: self.display_name(),
            property: name.to_string(),
        }
    }

    // Watch first, then the generic definition callback
    fn announce(&self, handle: &PropertyHandle) {
        if !handle.is_registered() {
            return;
        }
        let watch = self.watches.lock().remove(handle.name());
        if let Some(callback) = watch {
            callback(handle);
        }
        let mediator = self.mediator();
        if mediator.is_attached() {
            let prop = handle.read();
            mediator.notify(|o| o.on_property_defined(&prop));
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Append to the message log, evicting the oldest entry when full
    ///
    /// Returns the index of the new entry.
    pub fn add_message(&self, message: impl Into<String>) -> usize {
        let index = {
            let mut log = self.messages.lock();
            let capacity = self.config.message_log_capacity.max(1);
            while log.len() >= capacity {
                log.pop_front();
            }
            log.push_back(message.into());
            log.len() - 1
        };
        let device = self.display_name();
        self.mediator().notify(|o| o.on_message(&device, index));
        index
    }

    pub fn message(&self, index: usize) -> Option<String> {
        self.messages.lock().get(index).cloned()
    }

    pub fn last_message(&self) -> Option<String> {
        self.messages.lock().back().cloned()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().cloned().collect()
    }

    /// Log the element's `message` attribute, if present
    ///
    /// Entries read `"<timestamp>: <text>"`; the element's own timestamp is
    /// used when it has one.
    pub fn check_message(&self, element: &XmlElement) -> Option<usize> {
        let message = codec::extract_message(element)?;
        let timestamp = message
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string());
        Some(self.add_message(format!("{}: {}", timestamp, message.text)))
    }

    // ========================================================================
    // Wire elements
    // ========================================================================

    /// Route one element addressed to this device
    pub fn process(&self, element: &XmlElement) -> IndiResult<()> {
        let result = match Tag::parse(&element.tag) {
            Ok(Tag::Vector(MessageClass::Definition, _)) => self.build_property(element).map(|_| ()),
            Ok(Tag::Vector(_, _)) => self.set_value(element),
            Ok(Tag::DelProperty) => self.delete_property(element),
            Ok(Tag::Message) => {
                self.check_message(element);
                Ok(())
            }
            Ok(other) => Err(IndiError::UnknownTag(other.name())),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let name = element.attribute("name").unwrap_or("");
            match e {
                IndiError::Duplicate { .. } => {
                    tracing::debug!("Dropped <{}> {}.{}: {}", element.tag, self.display_name(), name, e)
                }
                // already reported by the BLOB path
                IndiError::Compression { .. } | IndiError::BlobAllocation { .. } => {}
                _ => tracing::warn!("Dropped <{}> {}.{}: {}", element.tag, self.display_name(), name, e),
            }
        }
        result
    }

    /// Handle a `defXxxVector`
    ///
    /// A definition for a name that is held by a ghost of the same kind fills
    /// the ghost in place. Any other existing name is a duplicate.
    pub fn build_property(&self, element: &XmlElement) -> IndiResult<PropertyHandle> {
        self.build_property_with(element, false)
    }

    fn build_property_with(&self, element: &XmlElement, dynamic: bool) -> IndiResult<PropertyHandle> {
        let device = element.required("device")?;
        let name = element.required("name")?;
        self.check_device(device)?;

        // definitions are not upserts; check before doing any parsing work
        if self.get_property(name, None).is_some() {
            return Err(self.duplicate(name));
        }

        let mut property = codec::parse_definition(element)?;
        property.dynamic = dynamic;
        self.set_device_name(device)?;
        self.check_message(element);

        let existing = {
            let mut list = self.properties.lock();
            let existing = list.iter().find(|h| h.name() == property.name).cloned();
            if existing.is_none() {
                let handle = PropertyHandle::new(property);
                list.push(handle.clone());
                drop(list);
                self.announce(&handle);
                return Ok(handle);
            }
            existing
        };

        match existing {
            Some(ghost) if ghost.kind() == property.kind() && ghost.promote(Some(property)) => {
                self.announce(&ghost);
                Ok(ghost)
            }
            _ => Err(self.duplicate(name)),
        }
    }

    /// Handle a `setXxxVector` (or a `newXxxVector` on the driver side)
    pub fn set_value(&self, element: &XmlElement) -> IndiResult<()> {
        let parsed = codec::parse_update(element)?;
        self.check_device(&parsed.device)?;

        let handle = self
            .get_property(&parsed.name, Some(parsed.kind))
            .ok_or_else(|| IndiError::NotFound {
                device: parsed.device.clone(),
                property: parsed.name.clone(),
            })?;
        self.set_device_name(&parsed.device)?;
        self.check_message(element);

        if parsed.kind == PropertyKind::Blob {
            return self.set_blob(&handle, &parsed.update, element);
        }

        let mediator = self.mediator();
        let mut prop = handle.write();
        prop.apply_update(&parsed.update)?;
        prop.emit_update();
        let prop = RwLockWriteGuard::downgrade(prop);
        mediator.notify_update(&prop);
        Ok(())
    }

    // Each oneBLOB is decoded on its own; the first failure is returned after
    // the rest have been processed and the property is left in Alert.
    fn set_blob(
        &self,
        handle: &PropertyHandle,
        update: &crate::property::VectorUpdate,
        element: &XmlElement,
    ) -> IndiResult<()> {
        let payloads = codec::parse_blob_payloads(element);
        let mediator = self.mediator();
        let mut prop = handle.write();
        prop.apply_update(update)?;

        let device = prop.device.clone();
        let property = prop.name.clone();
        let mut first_error: Option<IndiError> = None;
        let mut delivered = Vec::new();

        for payload in payloads {
            let payload = match payload {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("{}.{}: skipping oneBLOB: {}", device, property, e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            if prop.blob_mut(&payload.name).is_none() {
                tracing::warn!("{}.{}: no BLOB member named {}", device, property, payload.name);
                continue;
            }

            if payload.size == 0 {
                delivered.push(payload.name);
                continue;
            }

            let ctx = BlobContext {
                device: &device,
                property: &property,
            };
            match decode_payload(&payload, &self.attachments, ctx) {
                Ok(decoded) => {
                    if let Some(widget) = prop.blob_mut(&payload.name) {
                        widget.size = decoded.size;
                        widget.format = decoded.format;
                        widget.set_buffer(decoded.buffer);
                    }
                    delivered.push(payload.name);
                }
                Err(e) => {
                    tracing::error!("{}.{}.{}: {}", device, property, payload.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if first_error.is_some() {
            prop.state = PropertyState::Alert;
        }
        prop.emit_update();

        let prop = RwLockWriteGuard::downgrade(prop);
        mediator.notify(|o| {
            for name in &delivered {
                if let Some(widget) = prop.blobs().iter().find(|w| &w.name == name) {
                    o.on_blob(&prop, widget);
                }
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle a `delProperty`; without a name every property is dropped
    pub fn delete_property(&self, element: &XmlElement) -> IndiResult<()> {
        let device = element.required("device")?;
        if !self.is_device_name_match(device) {
            return Err(IndiError::DeviceMismatch {
                expected: self.display_name(),
                found: device.to_string(),
            });
        }
        self.check_message(element);

        match element.attribute("name") {
            Some(name) => self.remove_property(name).map(|_| ()),
            None => {
                self.clear();
                Ok(())
            }
        }
    }

    /// Load properties from a skeleton document
    ///
    /// Accepts either bare definition elements or a root element wrapping
    /// them. Properties are marked dynamic. Bad elements are logged and
    /// skipped; returns how many properties were added.
    pub fn build_skeleton(&self, xml: &str) -> IndiResult<usize> {
        let elements = parse_elements(xml)?;
        let mut added = 0;

        let definitions = elements.iter().flat_map(|el| {
            if matches!(Tag::parse(&el.tag), Ok(Tag::Vector(MessageClass::Definition, _))) {
                std::slice::from_ref(el).iter()
            } else {
                el.children.iter()
            }
        });

        for element in definitions {
            match self.build_property_with(element, true) {
                Ok(_) => added += 1,
                Err(e) => tracing::warn!(
                    "Skeleton element <{}> {} skipped: {}",
                    element.tag,
                    element.attribute("name").unwrap_or(""),
                    e
                ),
            }
        }
        Ok(added)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.device_name())
            .field("properties", &self.property_count())
            .field("messages", &self.message_count())
            .field("mediator", &*self.mediator.read())
            .finish()
    }
}
