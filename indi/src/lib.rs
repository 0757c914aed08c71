//! INDI property engine
//!
//! Protocol core shared by INDI clients and drivers: the typed property
//! model, the XML wire codec, BLOB transfer and the per-device registry
//! that dispatches change notifications.
//!
//! ## Features
//!
//! - Number, Switch, Text, Light and BLOB vectors with INDI number formats
//!   (printf subset plus sexagesimal `%m`)
//! - def/set/new vector parsing and serialization
//! - Inline base64, zlib-compressed (`.z`) and shared-buffer BLOBs
//! - Ghost properties, skeleton loading and one-shot property watches
//! - Thread-safe registry: concurrent readers, serialized writers
//! - Async element framing over any `AsyncRead`
//! - Client router broadcasting [`IndiEvent`]s
//!
//! Transport (sockets, reconnection) is left to the caller.

mod blob;
mod client;
mod codec;
mod device;
mod error;
mod number;
mod observer;
mod property;
mod protocol;
mod reader;
mod value;
mod xml;

pub use blob::{
    decode_base64, decode_payload, detect_blob_format, encode_base64, AttachmentStore, BlobBuffer,
    BlobContext, BlobPayload, BlobSource, DecodedBlob, SharedBlob, COMPRESSED_SUFFIX,
};
pub use client::{IndiClient, IndiEvent};
pub use codec::{
    command_element, command_xml, definition_element, definition_xml, del_property_xml,
    enable_blob_xml, extract_message, get_properties_xml, member_tag, parse_blob_payloads,
    parse_definition, parse_update, update_element, update_xml, BlobMode, MessageClass, Tag,
    UpdateElement, WireMessage, DEFAULT_NUMBER_FORMAT,
};
pub use device::{Device, WatchCallback};
pub use error::{IndiError, IndiResult, ParseErrorKind};
pub use number::{format_number, format_sexagesimal, format_wire, parse_number};
pub use observer::{DeviceObserver, Mediator};
pub use property::{
    Property, PropertyHandle, UpdateHook, VectorUpdate, WidgetRef, WidgetUpdate, Widgets,
};
pub use protocol::{
    standard_properties, DriverInterface, INDI_DEFAULT_PORT, INDI_PROTOCOL_VERSION,
    INDI_PROTOCOL_VERSIONS,
};
pub use reader::ElementReader;
pub use value::{
    BlobWidget, LightWidget, NumberWidget, Permission, PropertyKind, PropertyState, SwitchRule,
    SwitchState, SwitchWidget, TextWidget,
};
pub use xml::{parse_element, parse_elements, XmlElement};

use serde::{Deserialize, Serialize};

/// Default number of entries kept in a device's message log
pub const DEFAULT_MESSAGE_LOG_CAPACITY: usize = 1024;

/// Per-device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name to bind up front; unbound devices take the name of the
    /// first element they accept
    pub device_name: Option<String>,
    /// Message log entries kept before the oldest is evicted (default: 1024)
    pub message_log_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            message_log_capacity: DEFAULT_MESSAGE_LOG_CAPACITY,
        }
    }
}

/// Client router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Version sent in `getProperties` (default: "1.7")
    pub protocol_version: String,
    /// Broadcast channel capacity; slow subscribers lag past this (default: 100)
    pub event_capacity: usize,
    /// Devices to accept definitions for; empty accepts all
    pub watched_devices: Vec<String>,
    /// Template for every device the client creates
    pub device: DeviceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: INDI_PROTOCOL_VERSION.to_string(),
            event_capacity: 100,
            watched_devices: Vec::new(),
            device: DeviceConfig::default(),
        }
    }
}
