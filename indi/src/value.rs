//! Value model: the typed scalars carried inside a property
//!
//! Every text-to-value conversion here is total: malformed input is an
//! [`IndiError::Parse`], never a panic and never a silent default.

use crate::blob::BlobBuffer;
use crate::error::{IndiError, IndiResult, ParseErrorKind};
use crate::number;
use serde::{Deserialize, Serialize};

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Number,
    Switch,
    Text,
    Light,
    Blob,
}

impl PropertyKind {
    pub const ALL: [PropertyKind; 5] = [
        PropertyKind::Number,
        PropertyKind::Switch,
        PropertyKind::Text,
        PropertyKind::Light,
        PropertyKind::Blob,
    ];

    /// Tag fragment used on the wire (`defNumberVector`, `oneBLOB`, ...)
    pub fn wire_name(self) -> &'static str {
        match self {
            PropertyKind::Number => "Number",
            PropertyKind::Switch => "Switch",
            PropertyKind::Text => "Text",
            PropertyKind::Light => "Light",
            PropertyKind::Blob => "BLOB",
        }
    }
}

/// INDI property state, also used as the value of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s.trim() {
            "Idle" => Ok(PropertyState::Idle),
            "Ok" => Ok(PropertyState::Ok),
            "Busy" => Ok(PropertyState::Busy),
            "Alert" => Ok(PropertyState::Alert),
            other => Err(IndiError::parse(ParseErrorKind::InvalidState, other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Permission {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permission {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s.trim() {
            "ro" => Ok(Permission::ReadOnly),
            "wo" => Ok(Permission::WriteOnly),
            "rw" => Ok(Permission::ReadWrite),
            other => Err(IndiError::parse(ParseErrorKind::InvalidPermission, other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ReadOnly => "ro",
            Permission::WriteOnly => "wo",
            Permission::ReadWrite => "rw",
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, Permission::ReadOnly)
    }
}

/// State of a single switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchState {
    #[default]
    Off,
    On,
}

impl SwitchState {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s.trim() {
            "On" => Ok(SwitchState::On),
            "Off" => Ok(SwitchState::Off),
            other => Err(IndiError::parse(ParseErrorKind::InvalidState, other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwitchState::On => "On",
            SwitchState::Off => "Off",
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

/// How many switches of a vector may be on at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    #[default]
    AnyOfMany,
}

impl SwitchRule {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s.trim() {
            "OneOfMany" => Ok(SwitchRule::OneOfMany),
            "AtMostOne" => Ok(SwitchRule::AtMostOne),
            "AnyOfMany" => Ok(SwitchRule::AnyOfMany),
            other => Err(IndiError::parse(ParseErrorKind::InvalidState, other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwitchRule::OneOfMany => "OneOfMany",
            SwitchRule::AtMostOne => "AtMostOne",
            SwitchRule::AnyOfMany => "AnyOfMany",
        }
    }
}

/// Number widget
#[derive(Debug, Clone, PartialEq)]
pub struct NumberWidget {
    pub name: String,
    pub label: String,
    /// printf-style display format, `%m` for sexagesimal
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

impl NumberWidget {
    pub fn new(name: &str, label: &str, format: &str, min: f64, max: f64, step: f64, value: f64) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            format: format.to_string(),
            min,
            max,
            step,
            value,
        }
    }

    /// Parse wire text into the value; on failure the value is left as is
    pub fn set_value_text(&mut self, text: &str) -> IndiResult<()> {
        self.value = number::parse_number(text)?;
        Ok(())
    }

    /// Value rendered with the widget's display format
    pub fn formatted(&self) -> String {
        number::format_number(self.value, &self.format)
    }
}

/// Switch widget
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchWidget {
    pub name: String,
    pub label: String,
    pub state: SwitchState,
}

impl SwitchWidget {
    pub fn new(name: &str, label: &str, state: SwitchState) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            state,
        }
    }

    pub fn is_on(&self) -> bool {
        self.state == SwitchState::On
    }
}

/// Text widget
#[derive(Debug, Clone, PartialEq)]
pub struct TextWidget {
    pub name: String,
    pub label: String,
    pub text: String,
}

impl TextWidget {
    pub fn new(name: &str, label: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            text: text.to_string(),
        }
    }
}

/// Light widget (read-only status indicator)
#[derive(Debug, Clone, PartialEq)]
pub struct LightWidget {
    pub name: String,
    pub label: String,
    pub state: PropertyState,
}

impl LightWidget {
    pub fn new(name: &str, label: &str, state: PropertyState) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            state,
        }
    }
}

/// BLOB widget
///
/// `size` is the uncompressed size announced by the sender; `data` is the
/// single buffer the widget owns. Not `Clone`: buffers only move.
#[derive(Debug, PartialEq)]
pub struct BlobWidget {
    pub name: String,
    pub label: String,
    pub format: String,
    pub size: usize,
    data: BlobBuffer,
}

impl BlobWidget {
    pub fn new(name: &str, label: &str, format: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            format: format.to_string(),
            size: 0,
            data: BlobBuffer::empty(),
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn buffer(&self) -> &BlobBuffer {
        &self.data
    }

    /// Install a new buffer; the previous one is dropped before this returns
    pub fn set_buffer(&mut self, buffer: BlobBuffer) {
        self.data = buffer;
    }

    /// Move the buffer out, leaving the widget empty
    pub fn take_buffer(&mut self) -> BlobBuffer {
        std::mem::replace(&mut self.data, BlobBuffer::empty())
    }
}
