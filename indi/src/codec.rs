//! Wire codec
//!
//! Maps INDI elements to and from [`Property`] values. Tag dispatch is a
//! closed enum over message class and property kind; parsing never touches
//! a registry, so the same functions serve client and driver sides.

use crate::blob::{encode_base64, BlobPayload, BlobSource};
use crate::error::{IndiError, IndiResult, ParseErrorKind};
use crate::number::{format_wire, parse_number};
use crate::property::{Property, VectorUpdate, WidgetUpdate, Widgets};
use crate::value::{
    BlobWidget, LightWidget, NumberWidget, Permission, PropertyKind, PropertyState, SwitchRule,
    SwitchState, SwitchWidget, TextWidget,
};
use crate::xml::XmlElement;

/// Default display format for numbers defined without one
pub const DEFAULT_NUMBER_FORMAT: &str = "%g";

/// Direction and purpose of a vector element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// `defXxxVector`, driver to client
    Definition,
    /// `setXxxVector`, driver to client
    Update,
    /// `newXxxVector`, client to driver
    Command,
}

impl MessageClass {
    fn prefix(self) -> &'static str {
        match self {
            MessageClass::Definition => "def",
            MessageClass::Update => "set",
            MessageClass::Command => "new",
        }
    }
}

/// Every top-level element the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Vector(MessageClass, PropertyKind),
    DelProperty,
    Message,
    GetProperties,
    EnableBlob,
}

impl Tag {
    pub fn parse(tag: &str) -> IndiResult<Tag> {
        match tag {
            "delProperty" => return Ok(Tag::DelProperty),
            "message" => return Ok(Tag::Message),
            "getProperties" => return Ok(Tag::GetProperties),
            "enableBLOB" => return Ok(Tag::EnableBlob),
            _ => {}
        }

        let unknown = || IndiError::UnknownTag(tag.to_string());
        let body = tag.strip_suffix("Vector").ok_or_else(unknown)?;
        let (class, kind_name) = if let Some(rest) = body.strip_prefix("def") {
            (MessageClass::Definition, rest)
        } else if let Some(rest) = body.strip_prefix("set") {
            (MessageClass::Update, rest)
        } else if let Some(rest) = body.strip_prefix("new") {
            (MessageClass::Command, rest)
        } else {
            return Err(unknown());
        };

        let kind = PropertyKind::ALL
            .into_iter()
            .find(|k| k.wire_name() == kind_name)
            .ok_or_else(unknown)?;

        // Lights are read-only; there is no newLightVector
        if class == MessageClass::Command && kind == PropertyKind::Light {
            return Err(unknown());
        }
        Ok(Tag::Vector(class, kind))
    }

    pub fn name(&self) -> String {
        match self {
            Tag::Vector(class, kind) => format!("{}{}Vector", class.prefix(), kind.wire_name()),
            Tag::DelProperty => "delProperty".to_string(),
            Tag::Message => "message".to_string(),
            Tag::GetProperties => "getProperties".to_string(),
            Tag::EnableBlob => "enableBLOB".to_string(),
        }
    }
}

/// Tag of the per-widget children of a vector element
pub fn member_tag(class: MessageClass, kind: PropertyKind) -> String {
    match class {
        MessageClass::Definition => format!("def{}", kind.wire_name()),
        MessageClass::Update | MessageClass::Command => format!("one{}", kind.wire_name()),
    }
}

/// BLOB delivery policy requested with `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobMode {
    #[default]
    Never,
    Also,
    Only,
}

impl BlobMode {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s.trim() {
            "Never" => Ok(BlobMode::Never),
            "Also" => Ok(BlobMode::Also),
            "Only" => Ok(BlobMode::Only),
            other => Err(IndiError::parse(ParseErrorKind::InvalidState, other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }
}

/// Free-text message carried by any element
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub device: Option<String>,
    pub timestamp: Option<String>,
    pub text: String,
}

/// Pull the `message` attribute out of an element, if it has one
pub fn extract_message(element: &XmlElement) -> Option<WireMessage> {
    let text = element.attribute("message")?;
    Some(WireMessage {
        device: element.attribute("device").map(str::to_string),
        timestamp: element.attribute("timestamp").map(str::to_string),
        text: text.to_string(),
    })
}

/// A parsed `setXxxVector` or `newXxxVector`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateElement {
    pub class: MessageClass,
    pub kind: PropertyKind,
    pub device: String,
    pub name: String,
    pub update: VectorUpdate,
}

fn vector_tag(element: &XmlElement) -> IndiResult<(MessageClass, PropertyKind)> {
    match Tag::parse(&element.tag)? {
        Tag::Vector(class, kind) => Ok((class, kind)),
        _ => Err(IndiError::UnknownTag(element.tag.clone())),
    }
}

/// Build a property from a `defXxxVector` element
///
/// Members with an empty name are dropped; a vector left with no members is
/// a [`IndiError::Shape`]. Duplicate detection is the registry's job.
pub fn parse_definition(element: &XmlElement) -> IndiResult<Property> {
    let (class, kind) = vector_tag(element)?;
    if class != MessageClass::Definition {
        return Err(IndiError::UnknownTag(element.tag.clone()));
    }

    let device = element.required("device")?;
    let name = element.required("name")?;
    let member = member_tag(class, kind);
    let members = element.children_named(&member).filter(|c| {
        let named = c.attribute("name").map_or(false, |n| !n.is_empty());
        if !named {
            tracing::warn!("Dropping unnamed <{}> in {}.{}", member, device, name);
        }
        named
    });

    let widgets = match kind {
        PropertyKind::Number => {
            Widgets::Number(members.map(|c| number_member(c, device, name)).collect())
        }
        PropertyKind::Switch => Widgets::Switch(
            members
                .map(|c| {
                    let state = SwitchState::parse(&c.text).unwrap_or_else(|e| {
                        tracing::warn!("{}.{}: {}, defaulting to Off", device, name, e);
                        SwitchState::Off
                    });
                    SwitchWidget::new(member_name(c), member_label(c), state)
                })
                .collect(),
        ),
        PropertyKind::Text => Widgets::Text(
            members
                .map(|c| TextWidget::new(member_name(c), member_label(c), &c.text))
                .collect(),
        ),
        PropertyKind::Light => Widgets::Light(
            members
                .map(|c| {
                    let state = PropertyState::parse(&c.text).unwrap_or_else(|e| {
                        tracing::warn!("{}.{}: {}, defaulting to Idle", device, name, e);
                        PropertyState::Idle
                    });
                    LightWidget::new(member_name(c), member_label(c), state)
                })
                .collect(),
        ),
        PropertyKind::Blob => Widgets::Blob(
            members
                .map(|c| {
                    BlobWidget::new(member_name(c), member_label(c), c.attribute("format").unwrap_or(""))
                })
                .collect(),
        ),
    };

    if widgets.is_empty() {
        return Err(IndiError::Shape {
            device: device.to_string(),
            property: name.to_string(),
            tag: element.tag.clone(),
        });
    }

    let state_error = |reason: String| IndiError::State {
        device: device.to_string(),
        property: name.to_string(),
        reason,
    };

    let mut property = Property::new(device, name, kind);
    property.set_widgets(widgets)?;
    property.label = element.attribute("label").unwrap_or(name).to_string();
    property.group = element.attribute("group").unwrap_or("").to_string();
    if let Some(state) = element.attribute("state") {
        property.state = PropertyState::parse(state)
            .map_err(|_| state_error(format!("bogus state {:?}", state)))?;
    }
    if let Some(timeout) = element.attribute("timeout") {
        property.timeout =
            parse_number(timeout).map_err(|_| state_error(format!("bogus timeout {:?}", timeout)))?;
    }
    if kind != PropertyKind::Light {
        if let Some(perm) = element.attribute("perm") {
            property.permission = Permission::parse(perm)?;
        }
    }
    if kind == PropertyKind::Switch {
        if let Some(rule) = element.attribute("rule") {
            property.rule = SwitchRule::parse(rule).unwrap_or_else(|e| {
                tracing::warn!("{}.{}: {}, using AnyOfMany", device, name, e);
                SwitchRule::default()
            });
        }
    }

    Ok(property)
}

fn member_name(c: &XmlElement) -> &str {
    c.attribute("name").unwrap_or("")
}

// Labels default to the member name
fn member_label(c: &XmlElement) -> &str {
    c.attribute("label").unwrap_or_else(|| member_name(c))
}

fn number_member(c: &XmlElement, device: &str, property: &str) -> NumberWidget {
    let number = |attr: &str, text: Option<&str>| -> f64 {
        match text {
            Some(t) => parse_number(t).unwrap_or_else(|e| {
                tracing::warn!("{}.{}.{} {}: {}, using 0", device, property, member_name(c), attr, e);
                0.0
            }),
            None => 0.0,
        }
    };

    NumberWidget::new(
        member_name(c),
        member_label(c),
        c.attribute("format").unwrap_or(DEFAULT_NUMBER_FORMAT),
        number("min", c.attribute("min")),
        number("max", c.attribute("max")),
        number("step", c.attribute("step")),
        number("value", Some(c.text.as_str())),
    )
}

/// Parse a `setXxxVector` or `newXxxVector` into raw widget updates
///
/// Values stay textual; [`Property::apply_update`] validates them against
/// the target property. BLOB members are read with [`parse_blob_payloads`].
pub fn parse_update(element: &XmlElement) -> IndiResult<UpdateElement> {
    let (class, kind) = vector_tag(element)?;
    if class == MessageClass::Definition {
        return Err(IndiError::UnknownTag(element.tag.clone()));
    }

    let device = element.required("device")?.to_string();
    let name = element.required("name")?.to_string();
    let member = member_tag(class, kind);
    let widgets = if kind == PropertyKind::Blob {
        Vec::new()
    } else {
        element
            .children_named(&member)
            .filter_map(|c| {
                let widget = c.attribute("name")?;
                Some(WidgetUpdate {
                    name: widget.to_string(),
                    value: c.text.clone(),
                    min: c.attribute("min").map(str::to_string),
                    max: c.attribute("max").map(str::to_string),
                })
            })
            .collect()
    };

    Ok(UpdateElement {
        class,
        kind,
        device,
        name,
        update: VectorUpdate {
            state: element.attribute("state").map(str::to_string),
            timeout: element.attribute("timeout").map(str::to_string),
            widgets,
        },
    })
}

/// Parse every `oneBLOB` child; each member succeeds or fails on its own
pub fn parse_blob_payloads(element: &XmlElement) -> Vec<IndiResult<BlobPayload>> {
    element
        .children_named("oneBLOB")
        .map(parse_blob_payload)
        .collect()
}

fn parse_blob_payload(c: &XmlElement) -> IndiResult<BlobPayload> {
    let name = c.required("name")?;
    let format = c.required("format")?;
    let size_text = c.required("size")?;
    let size = size_text
        .trim()
        .parse::<usize>()
        .map_err(|_| IndiError::parse(ParseErrorKind::InvalidNumber, size_text))?;

    let source = match c.attribute("attached-data-id") {
        Some(id) => BlobSource::Attached {
            id: id.to_string(),
            direct: c.attribute("attachment-direct").is_some(),
        },
        None => BlobSource::Inline(c.text.clone()),
    };

    Ok(BlobPayload {
        name: name.to_string(),
        format: format.to_string(),
        size,
        source,
    })
}

fn vector_element(class: MessageClass, property: &Property) -> XmlElement {
    XmlElement::new(&Tag::Vector(class, property.kind()).name())
        .attr("device", property.device.as_str())
        .attr("name", property.name.as_str())
}

/// `defXxxVector` describing the whole property
pub fn definition_element(property: &Property) -> XmlElement {
    let kind = property.kind();
    let mut el = vector_element(MessageClass::Definition, property)
        .attr("label", property.label.as_str())
        .attr("group", property.group.as_str())
        .attr("state", property.state.as_str());
    if kind != PropertyKind::Light {
        el.set_attribute("perm", property.permission.as_str());
    }
    if kind == PropertyKind::Switch {
        el.set_attribute("rule", property.rule.as_str());
    }
    el.set_attribute("timeout", format_wire(property.timeout));

    let member = member_tag(MessageClass::Definition, kind);
    let member_el = |name: &str, label: &str| XmlElement::new(&member).attr("name", name).attr("label", label);
    el.children = match property.widgets() {
        Widgets::Number(w) => w
            .iter()
            .map(|n| {
                member_el(&n.name, &n.label)
                    .attr("format", n.format.as_str())
                    .attr("min", format_wire(n.min))
                    .attr("max", format_wire(n.max))
                    .attr("step", format_wire(n.step))
                    .with_text(format_wire(n.value))
            })
            .collect(),
        Widgets::Switch(w) => w
            .iter()
            .map(|s| member_el(&s.name, &s.label).with_text(s.state.as_str()))
            .collect(),
        Widgets::Text(w) => w
            .iter()
            .map(|t| member_el(&t.name, &t.label).with_text(t.text.as_str()))
            .collect(),
        Widgets::Light(w) => w
            .iter()
            .map(|l| member_el(&l.name, &l.label).with_text(l.state.as_str()))
            .collect(),
        Widgets::Blob(w) => w
            .iter()
            .map(|b| member_el(&b.name, &b.label).attr("format", b.format.as_str()))
            .collect(),
    };
    el
}

// Members of set/new vectors carry name and current value only
fn value_members(class: MessageClass, property: &Property) -> Vec<XmlElement> {
    let member = member_tag(class, property.kind());
    let one = |name: &str| XmlElement::new(&member).attr("name", name);
    match property.widgets() {
        Widgets::Number(w) => w
            .iter()
            .map(|n| one(&n.name).with_text(format_wire(n.value)))
            .collect(),
        Widgets::Switch(w) => w
            .iter()
            .map(|s| one(&s.name).with_text(s.state.as_str()))
            .collect(),
        Widgets::Text(w) => w
            .iter()
            .map(|t| one(&t.name).with_text(t.text.as_str()))
            .collect(),
        Widgets::Light(w) => w
            .iter()
            .map(|l| one(&l.name).with_text(l.state.as_str()))
            .collect(),
        Widgets::Blob(w) => w
            .iter()
            .map(|b| {
                one(&b.name)
                    .attr("size", b.data().len().to_string())
                    .attr("format", b.format.as_str())
                    .with_text(encode_base64(b.data()))
            })
            .collect(),
    }
}

/// `setXxxVector` carrying the current state and values
pub fn update_element(property: &Property) -> XmlElement {
    let mut el = vector_element(MessageClass::Update, property)
        .attr("state", property.state.as_str())
        .attr("timeout", format_wire(property.timeout));
    el.children = value_members(MessageClass::Update, property);
    el
}

/// `newXxxVector` asking the driver to adopt the property's values
pub fn command_element(property: &Property) -> IndiResult<XmlElement> {
    if property.kind() == PropertyKind::Light {
        return Err(IndiError::UnknownTag("newLightVector".to_string()));
    }
    let mut el = vector_element(MessageClass::Command, property);
    el.children = value_members(MessageClass::Command, property);
    Ok(el)
}

pub fn definition_xml(property: &Property) -> String {
    definition_element(property).to_xml()
}

pub fn update_xml(property: &Property) -> String {
    update_element(property).to_xml()
}

pub fn command_xml(property: &Property) -> IndiResult<String> {
    command_element(property).map(|el| el.to_xml())
}

/// `getProperties` handshake, optionally narrowed to a device or property
pub fn get_properties_xml(version: &str, device: Option<&str>, name: Option<&str>) -> String {
    let mut el = XmlElement::new("getProperties").attr("version", version);
    if let Some(device) = device {
        el.set_attribute("device", device);
        if let Some(name) = name {
            el.set_attribute("name", name);
        }
    }
    el.to_xml()
}

pub fn enable_blob_xml(mode: BlobMode, device: &str, name: Option<&str>) -> String {
    let mut el = XmlElement::new("enableBLOB").attr("device", device);
    if let Some(name) = name {
        el.set_attribute("name", name);
    }
    el.with_text(mode.as_str()).to_xml()
}

/// `delProperty` for one property, or the whole device when `name` is None
pub fn del_property_xml(device: &str, name: Option<&str>, message: Option<&str>) -> String {
    let mut el = XmlElement::new("delProperty").attr("device", device);
    if let Some(name) = name {
        el.set_attribute("name", name);
    }
    if let Some(message) = message {
        el.set_attribute("message", message);
    }
    el.to_xml()
}
