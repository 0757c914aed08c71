//! INDI error types
//!
//! Provides structured error types for the property engine. Every failure in
//! the codec, registry and BLOB pipeline is reported through [`IndiError`];
//! per-element failures are local and never poison the device.

use crate::value::PropertyKind;
use thiserror::Error;

/// Which value conversion failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidNumber,
    InvalidState,
    InvalidPermission,
    InvalidPayload,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseErrorKind::InvalidNumber => "invalid number",
            ParseErrorKind::InvalidState => "invalid state",
            ParseErrorKind::InvalidPermission => "invalid permission",
            ParseErrorKind::InvalidPayload => "invalid payload",
        };
        f.write_str(s)
    }
}

/// INDI engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndiError {
    /// Malformed attribute or element content
    #[error("Parse error ({kind}): {value:?}")]
    Parse { kind: ParseErrorKind, value: String },

    /// A definition arrived for a property that already exists
    #[error("Property already defined: {device}.{property}")]
    Duplicate { device: String, property: String },

    /// Operation on an unknown device or property
    #[error("Property not found: {device}.{property}")]
    NotFound { device: String, property: String },

    /// Invalid state, permission or timeout token in a vector element
    #[error("Bogus state for {device}.{property}: {reason}")]
    State {
        device: String,
        property: String,
        reason: String,
    },

    /// Inflating a `.z` BLOB failed
    #[error("{device}.{property}.{element} compression error: {reason}")]
    Compression {
        device: String,
        property: String,
        element: String,
        reason: String,
    },

    /// A definition produced zero valid widgets
    #[error("{device}.{property}: {tag} with no valid members")]
    Shape {
        device: String,
        property: String,
        tag: String,
    },

    /// Widgets of a different kind offered to an existing property
    #[error("{device}.{property}: expected {expected:?} widgets, found {found:?}")]
    KindMismatch {
        device: String,
        property: String,
        expected: PropertyKind,
        found: PropertyKind,
    },

    /// Element addressed to a device other than the one this registry is bound to
    #[error("Device mismatch: registry bound to '{expected}', element for '{found}'")]
    DeviceMismatch { expected: String, found: String },

    /// Required attribute absent from an element
    #[error("<{tag}> missing required attribute '{attribute}'")]
    MissingAttribute { tag: String, attribute: String },

    /// Element tag the codec does not handle
    #[error("Unable to process tag <{0}>")]
    UnknownTag(String),

    /// Malformed XML
    #[error("XML parse error: {0}")]
    Xml(String),

    /// Shared-buffer attachment id with no deposited buffer
    #[error("No attached data with id '{0}'")]
    AttachmentNotFound(String),

    /// Could not allocate a decode buffer for a BLOB
    #[error("Unable to allocate {size} bytes for BLOB {element}")]
    BlobAllocation { element: String, size: usize },

    /// I/O failure in the element reader
    #[error("I/O error: {0}")]
    Io(String),
}

impl IndiError {
    pub(crate) fn parse(kind: ParseErrorKind, value: &str) -> Self {
        IndiError::Parse {
            kind,
            value: value.to_string(),
        }
    }

    pub(crate) fn missing(tag: &str, attribute: &str) -> Self {
        IndiError::MissingAttribute {
            tag: tag.to_string(),
            attribute: attribute.to_string(),
        }
    }

    /// Duplicate definitions are routine when a server replays its properties
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IndiError::Duplicate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndiError::NotFound { .. })
    }
}

impl From<quick_xml::Error> for IndiError {
    fn from(err: quick_xml::Error) -> Self {
        match err {
            quick_xml::Error::Io(e) => IndiError::Io(e.to_string()),
            other => IndiError::Xml(other.to_string()),
        }
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
