//! INDI client router
//!
//! This module provides the controller-side entry point:
//! - One [`Device`] registry per device name, created on first definition
//! - Element routing for def/set/del/message traffic
//! - Broadcast of [`IndiEvent`]s to any number of subscribers
//! - A read loop over any `AsyncRead` that survives per-element errors
//!
//! Socket setup and reconnection belong to the caller; `run` only needs
//! the read half of a connection.

use crate::blob::AttachmentStore;
use crate::codec::{self, BlobMode, MessageClass, Tag};
use crate::device::Device;
use crate::error::{IndiError, IndiResult};
use crate::observer::DeviceObserver;
use crate::property::Property;
use crate::protocol::INDI_PROTOCOL_VERSIONS;
use crate::reader::ElementReader;
use crate::value::{BlobWidget, PropertyKind, PropertyState};
use crate::xml::XmlElement;
use crate::{ClientConfig, DeviceConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;

/// INDI client event
#[derive(Debug, Clone, PartialEq)]
pub enum IndiEvent {
    /// First definition seen for a device
    DeviceDefined(String),
    /// Device removed by a nameless `delProperty`
    DeviceDeleted(String),
    /// Property defined
    PropertyDefined {
        device: String,
        name: String,
        kind: PropertyKind,
    },
    /// Property values changed
    PropertyUpdated {
        device: String,
        name: String,
        kind: PropertyKind,
        state: PropertyState,
    },
    /// Property deleted
    PropertyDeleted { device: String, name: String },
    /// BLOB member received; the bytes stay in the property
    BlobReceived {
        device: String,
        property: String,
        element: String,
        format: String,
        size: usize,
    },
    /// Message logged; `device` is None for server-wide messages
    Message { device: Option<String>, text: String },
}

/// Observer installed on every device the client creates
struct EventForwarder {
    device: Weak<Device>,
    event_tx: broadcast::Sender<IndiEvent>,
}

impl EventForwarder {
    fn updated(&self, property: &Property) {
        let _ = self.event_tx.send(IndiEvent::PropertyUpdated {
            device: property.device.clone(),
            name: property.name.clone(),
            kind: property.kind(),
            state: property.state,
        });
    }
}

impl DeviceObserver for EventForwarder {
    fn on_property_defined(&self, property: &Property) {
        let _ = self.event_tx.send(IndiEvent::PropertyDefined {
            device: property.device.clone(),
            name: property.name.clone(),
            kind: property.kind(),
        });
    }

    fn on_property_deleted(&self, device: &str, name: &str) {
        let _ = self.event_tx.send(IndiEvent::PropertyDeleted {
            device: device.to_string(),
            name: name.to_string(),
        });
    }

    fn on_number(&self, property: &Property) {
        self.updated(property);
    }

    fn on_switch(&self, property: &Property) {
        self.updated(property);
    }

    fn on_text(&self, property: &Property) {
        self.updated(property);
    }

    fn on_light(&self, property: &Property) {
        self.updated(property);
    }

    fn on_blob(&self, property: &Property, blob: &BlobWidget) {
        let _ = self.event_tx.send(IndiEvent::BlobReceived {
            device: property.device.clone(),
            property: property.name.clone(),
            element: blob.name.clone(),
            format: blob.format.clone(),
            size: blob.size,
        });
    }

    fn on_message(&self, device: &str, index: usize) {
        let Some(dev) = self.device.upgrade() else {
            return;
        };
        if let Some(text) = dev.message(index) {
            let _ = self.event_tx.send(IndiEvent::Message {
                device: Some(device.to_string()),
                text,
            });
        }
    }
}

/// INDI client state: every known device plus the server-wide message log
pub struct IndiClient {
    config: ClientConfig,
    devices: RwLock<Vec<Arc<Device>>>,
    messages: Mutex<VecDeque<String>>,
    attachments: Arc<AttachmentStore>,
    event_tx: broadcast::Sender<IndiEvent>,
}

impl IndiClient {
    pub fn new(config: ClientConfig) -> Self {
        if !INDI_PROTOCOL_VERSIONS.contains(&config.protocol_version.as_str()) {
            tracing::warn!(
                "Unsupported INDI protocol version '{}', servers may reject it",
                config.protocol_version
            );
        }
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            devices: RwLock::new(Vec::new()),
            messages: Mutex::new(VecDeque::new()),
            attachments: Arc::new(AttachmentStore::new()),
            event_tx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to INDI events
    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.event_tx.subscribe()
    }

    /// Store the transport deposits shared-buffer BLOBs into
    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    /// Known devices in definition order
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.is_device_name_match(name))
            .cloned()
    }

    /// True if definitions for `name` are accepted
    pub fn is_watched(&self, name: &str) -> bool {
        self.config.watched_devices.is_empty() || self.config.watched_devices.iter().any(|d| d == name)
    }

    /// Drop every device, as on disconnect
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.devices.write());
        for device in removed {
            device.clear();
            if let Some(name) = device.device_name() {
                let _ = self.event_tx.send(IndiEvent::DeviceDeleted(name));
            }
        }
    }

    // ========================================================================
    // Outbound commands
    // ========================================================================

    /// Initial handshake: one `getProperties` per watched device, or a single
    /// unrestricted one
    pub fn get_properties_command(&self) -> String {
        let version = self.config.protocol_version.as_str();
        if self.config.watched_devices.is_empty() {
            return codec::get_properties_xml(version, None, None);
        }
        self.config
            .watched_devices
            .iter()
            .map(|d| codec::get_properties_xml(version, Some(d), None))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn enable_blob_command(&self, mode: BlobMode, device: &str, property: Option<&str>) -> String {
        codec::enable_blob_xml(mode, device, property)
    }

    /// `newXxxVector` asking the driver to adopt `property`'s current values
    pub fn new_vector_command(&self, property: &Property) -> IndiResult<String> {
        codec::command_xml(property)
    }

    // ========================================================================
    // Inbound routing
    // ========================================================================

    /// Route one top-level element
    ///
    /// Failures inside a device are logged by that device; routing failures
    /// are logged here. Either way the error is returned.
    pub fn dispatch(&self, element: &XmlElement) -> IndiResult<()> {
        let result = self.route(element);
        if let Err(e) = &result {
            match e {
                // already reported by the device
                IndiError::Duplicate { .. }
                | IndiError::State { .. }
                | IndiError::Shape { .. }
                | IndiError::Compression { .. }
                | IndiError::BlobAllocation { .. }
                | IndiError::Parse { .. } => {}
                _ => tracing::warn!("Unable to route <{}>: {}", element.tag, e),
            }
        }
        result
    }

    fn route(&self, element: &XmlElement) -> IndiResult<()> {
        match Tag::parse(&element.tag)? {
            Tag::Vector(MessageClass::Definition, _) => {
                let name = element.required("device")?;
                if !self.is_watched(name) {
                    tracing::debug!("Ignoring definition for unwatched device '{}'", name);
                    return Ok(());
                }
                self.find_or_create(name).process(element)
            }
            Tag::Vector(_, _) => {
                let device = self.known_device(element)?;
                device.process(element)
            }
            Tag::DelProperty => {
                let device = self.known_device(element)?;
                if element.attribute("name").is_some() {
                    return device.process(element);
                }
                device.check_message(element);
                self.remove_device(&device);
                Ok(())
            }
            Tag::Message => {
                match element.attribute("device").and_then(|d| self.device(d)) {
                    Some(device) => {
                        device.check_message(element);
                    }
                    None => self.universal_message(element),
                }
                Ok(())
            }
            Tag::GetProperties | Tag::EnableBlob => Err(IndiError::UnknownTag(element.tag.clone())),
        }
    }

    fn known_device(&self, element: &XmlElement) -> IndiResult<Arc<Device>> {
        let name = element.required("device")?;
        self.device(name).ok_or_else(|| IndiError::NotFound {
            device: name.to_string(),
            property: element.attribute("name").unwrap_or("").to_string(),
        })
    }

    fn find_or_create(&self, name: &str) -> Arc<Device> {
        if let Some(device) = self.device(name) {
            return device;
        }

        let mut devices = self.devices.write();
        if let Some(device) = devices.iter().find(|d| d.is_device_name_match(name)) {
            return device.clone();
        }

        let config = DeviceConfig {
            device_name: Some(name.to_string()),
            ..self.config.device.clone()
        };
        let device = Arc::new(Device::with_attachments(config, self.attachments.clone()));
        device.set_observer(Arc::new(EventForwarder {
            device: Arc::downgrade(&device),
            event_tx: self.event_tx.clone(),
        }));
        devices.push(device.clone());
        drop(devices);

        tracing::info!("INDI device defined: {}", name);
        let _ = self.event_tx.send(IndiEvent::DeviceDefined(name.to_string()));
        device
    }

    fn remove_device(&self, device: &Arc<Device>) {
        self.devices.write().retain(|d| !Arc::ptr_eq(d, device));
        device.clear();
        if let Some(name) = device.device_name() {
            tracing::info!("INDI device deleted: {}", name);
            let _ = self.event_tx.send(IndiEvent::DeviceDeleted(name));
        }
    }

    fn universal_message(&self, element: &XmlElement) {
        let Some(message) = codec::extract_message(element) else {
            return;
        };
        let timestamp = message
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        let text = format!("{}: {}", timestamp, message.text);
        {
            let mut log = self.messages.lock();
            let capacity = self.config.device.message_log_capacity.max(1);
            while log.len() >= capacity {
                log.pop_front();
            }
            log.push_back(text.clone());
        }
        let _ = self.event_tx.send(IndiEvent::Message {
            device: message.device,
            text,
        });
    }

    /// Server-wide messages, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn last_message(&self) -> Option<String> {
        self.messages.lock().back().cloned()
    }

    /// Read elements from `reader` and dispatch them until end of stream
    ///
    /// Per-element errors are logged and skipped; only I/O errors end the
    /// loop early.
    pub async fn run<R: AsyncRead + Unpin>(&self, reader: R) -> IndiResult<()> {
        let mut elements = ElementReader::from_read(reader);
        loop {
            match elements.next_element().await {
                Ok(Some(element)) => {
                    let _ = self.dispatch(&element);
                }
                Ok(None) => {
                    tracing::info!("INDI connection closed (EOF)");
                    return Ok(());
                }
                Err(IndiError::Io(e)) => {
                    tracing::error!("INDI read error: {}", e);
                    return Err(IndiError::Io(e));
                }
                Err(e) => {
                    tracing::warn!("INDI XML parse error at byte {}: {}", elements.position(), e);
                }
            }
        }
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::encode_base64;
    use crate::xml::parse_element;
    use tokio::sync::broadcast::error::TryRecvError;

    const CONNECTION_DEF: &str = r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" state="Idle" perm="rw" rule="OneOfMany">
        <defSwitch name="CONNECT">Off</defSwitch>
        <defSwitch name="DISCONNECT">On</defSwitch>
    </defSwitchVector>"#;

    fn drain(rx: &mut broadcast::Receiver<IndiEvent>) -> Vec<IndiEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        out
    }

    #[test]
    fn test_definition_creates_device() {
        let client = IndiClient::default();
        let mut rx = client.subscribe();
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();

        assert_eq!(client.devices().len(), 1);
        assert!(client.device("Telescope Simulator").is_some());
        assert_eq!(
            drain(&mut rx),
            vec![
                IndiEvent::DeviceDefined("Telescope Simulator".to_string()),
                IndiEvent::PropertyDefined {
                    device: "Telescope Simulator".to_string(),
                    name: "CONNECTION".to_string(),
                    kind: PropertyKind::Switch,
                },
            ]
        );

        // a replayed definition is a duplicate, not a second device
        let err = client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(client.devices().len(), 1);
    }

    #[test]
    fn test_update_routing() {
        let client = IndiClient::default();
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();
        let mut rx = client.subscribe();

        let set = parse_element(
            r#"<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Ok">
                <oneSwitch name="CONNECT">On</oneSwitch>
                <oneSwitch name="DISCONNECT">Off</oneSwitch>
            </setSwitchVector>"#,
        )
        .unwrap();
        client.dispatch(&set).unwrap();
        assert!(client.device("Telescope Simulator").unwrap().is_connected());
        assert_eq!(
            drain(&mut rx),
            vec![IndiEvent::PropertyUpdated {
                device: "Telescope Simulator".to_string(),
                name: "CONNECTION".to_string(),
                kind: PropertyKind::Switch,
                state: PropertyState::Ok,
            }]
        );

        let unknown = parse_element(
            r#"<setSwitchVector device="Dome Simulator" name="CONNECTION"><oneSwitch name="CONNECT">On</oneSwitch></setSwitchVector>"#,
        )
        .unwrap();
        assert!(client.dispatch(&unknown).unwrap_err().is_not_found());
    }

    #[test]
    fn test_del_property_routing() {
        let client = IndiClient::default();
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();
        client
            .dispatch(
                &parse_element(
                    r#"<defTextVector device="Telescope Simulator" name="DEVICE_PORT" perm="rw"><defText name="PORT">/dev/ttyUSB0</defText></defTextVector>"#,
                )
                .unwrap(),
            )
            .unwrap();
        let mut rx = client.subscribe();

        client
            .dispatch(&parse_element(r#"<delProperty device="Telescope Simulator" name="DEVICE_PORT"/>"#).unwrap())
            .unwrap();
        let device = client.device("Telescope Simulator").unwrap();
        assert_eq!(device.property_count(), 1);

        client
            .dispatch(&parse_element(r#"<delProperty device="Telescope Simulator"/>"#).unwrap())
            .unwrap();
        assert!(client.device("Telescope Simulator").is_none());
        assert_eq!(device.property_count(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                IndiEvent::PropertyDeleted {
                    device: "Telescope Simulator".to_string(),
                    name: "DEVICE_PORT".to_string(),
                },
                IndiEvent::DeviceDeleted("Telescope Simulator".to_string()),
            ]
        );
    }

    #[test]
    fn test_watched_devices_filter() {
        let client = IndiClient::new(ClientConfig {
            watched_devices: vec!["CCD Simulator".to_string()],
            ..Default::default()
        });
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();
        assert!(client.devices().is_empty());
        assert!(client.is_watched("CCD Simulator"));
        assert_eq!(
            client.get_properties_command(),
            r#"<getProperties version="1.7" device="CCD Simulator"/>"#
        );
        assert_eq!(
            IndiClient::default().get_properties_command(),
            r#"<getProperties version="1.7"/>"#
        );
    }

    #[test]
    fn test_messages() {
        let client = IndiClient::default();
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();
        let mut rx = client.subscribe();

        client
            .dispatch(
                &parse_element(r#"<message timestamp="2024-03-01T21:00:00" message="Server restarting"/>"#).unwrap(),
            )
            .unwrap();
        client
            .dispatch(
                &parse_element(
                    r#"<message device="Telescope Simulator" timestamp="2024-03-01T21:00:05" message="Parked"/>"#,
                )
                .unwrap(),
            )
            .unwrap();

        assert_eq!(client.last_message().unwrap(), "2024-03-01T21:00:00: Server restarting");
        let device = client.device("Telescope Simulator").unwrap();
        assert_eq!(device.last_message().unwrap(), "2024-03-01T21:00:05: Parked");
        assert_eq!(
            drain(&mut rx),
            vec![
                IndiEvent::Message {
                    device: None,
                    text: "2024-03-01T21:00:00: Server restarting".to_string(),
                },
                IndiEvent::Message {
                    device: Some("Telescope Simulator".to_string()),
                    text: "2024-03-01T21:00:05: Parked".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_driver_bound_tags_are_rejected() {
        let client = IndiClient::default();
        let err = client
            .dispatch(&parse_element(r#"<getProperties version="1.7"/>"#).unwrap())
            .unwrap_err();
        assert!(matches!(err, IndiError::UnknownTag(_)));
    }

    #[tokio::test]
    async fn test_run_over_stream() {
        let client = IndiClient::default();
        let mut rx = client.subscribe();
        let image = b"SIMPLE  = T".to_vec();
        let stream = format!(
            r#"{def}
<defBLOBVector device="CCD Simulator" name="CCD1" perm="ro" state="Idle"><defBLOB name="CCD1" label="Image"/></defBLOBVector>
<setNumberVector device="Nobody" name="X"><oneNumber name="Y">1</oneNumber></setNumberVector>
<setBLOBVector device="CCD Simulator" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="{size}" format=".fits">{data}</oneBLOB></setBLOBVector>
<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Ok"><oneSwitch name="CONNECT">On</oneSwitch></setSwitchVector>
"#,
            def = CONNECTION_DEF,
            size = image.len(),
            data = encode_base64(&image)
        );

        client.run(stream.as_bytes()).await.unwrap();

        assert_eq!(client.devices().len(), 2);
        assert!(client.device("Telescope Simulator").unwrap().is_connected());
        let ccd = client.device("CCD Simulator").unwrap();
        let blob = ccd.get_blob("CCD1").unwrap();
        assert_eq!(blob.read().blobs()[0].data(), image.as_slice());

        let events = drain(&mut rx);
        assert!(events.contains(&IndiEvent::BlobReceived {
            device: "CCD Simulator".to_string(),
            property: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            size: image.len(),
        }));
    }

    #[test]
    fn test_commands() {
        let client = IndiClient::default();
        client.dispatch(&parse_element(CONNECTION_DEF).unwrap()).unwrap();
        let handle = client
            .device("Telescope Simulator")
            .unwrap()
            .get_switch("CONNECTION")
            .unwrap();
        handle.write().set_switch("CONNECT", crate::value::SwitchState::On);
        let command = client.new_vector_command(&handle.read()).unwrap();
        assert_eq!(
            command,
            r#"<newSwitchVector device="Telescope Simulator" name="CONNECTION"><oneSwitch name="CONNECT">On</oneSwitch><oneSwitch name="DISCONNECT">Off</oneSwitch></newSwitchVector>"#
        );
        assert_eq!(
            client.enable_blob_command(BlobMode::Also, "CCD Simulator", Some("CCD1")),
            r#"<enableBLOB device="CCD Simulator" name="CCD1">Also</enableBLOB>"#
        );
    }
}
