//! Owned XML element tree
//!
//! The codec works on complete elements. [`TreeBuilder`] turns quick-xml
//! events into [`XmlElement`]s; it is shared by [`parse_element`] (one
//! element from a string) and the async stream reader.

use crate::error::{IndiError, IndiResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::escape;
use std::fmt::Write as _;

/// One XML element with ordered attributes, children and text
///
/// Text that spans lines is trimmed, the way servers pretty-print values.
/// Single-line text is kept verbatim so padded text values survive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter
    pub fn attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Builder-style child
    pub fn child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Builder-style text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute that must be present
    pub fn required(&self, name: &str) -> IndiResult<&str> {
        self.attribute(name)
            .ok_or_else(|| IndiError::missing(&self.tag, name))
    }

    /// Children with the given tag, in document order
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Serialize as a single line of XML
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, 0, false);
        out
    }

    /// Serialize with one child element per line, the way INDI servers do
    pub fn to_xml_pretty(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, 0, true);
        out
    }

    fn write_into(&self, out: &mut String, depth: usize, pretty: bool) {
        let indent = if pretty { "  ".repeat(depth) } else { String::new() };
        let _ = write!(out, "{}<{}", indent, self.tag);
        for (name, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", name, escape(value.as_str()));
        }

        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            if pretty {
                out.push('\n');
            }
            return;
        }

        out.push('>');
        if !self.text.is_empty() {
            out.push_str(&escape(self.text.as_str()));
        }
        if !self.children.is_empty() {
            if pretty {
                out.push('\n');
            }
            for child in &self.children {
                child.write_into(out, depth + 1, pretty);
            }
            out.push_str(&indent);
        }
        let _ = write!(out, "</{}>", self.tag);
        if pretty {
            out.push('\n');
        }
    }
}

/// Assembles elements from a stream of quick-xml events
///
/// Depth-first: a top-level element is returned once its end tag (or the
/// empty-element form) is seen.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    stack: Vec<XmlElement>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns a completed top-level element if any
    pub fn push(&mut self, event: Event<'_>) -> IndiResult<Option<XmlElement>> {
        match event {
            Event::Start(start) => {
                self.stack.push(element_from_start(&start)?);
                Ok(None)
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                Ok(self.close(element))
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                match self.stack.pop() {
                    Some(element) if element.tag == name => Ok(self.close(element)),
                    Some(element) => Err(IndiError::Xml(format!(
                        "expected </{}>, found </{}>",
                        element.tag, name
                    ))),
                    None => Err(IndiError::Xml(format!("unexpected </{}>", name))),
                }
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| IndiError::Xml(e.to_string()))?;
                self.append_text(&text);
                Ok(None)
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                self.append_text(&String::from_utf8_lossy(&bytes));
                Ok(None)
            }
            // declarations, comments, processing instructions
            _ => Ok(None),
        }
    }

    /// True while a top-level element is open
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Drop any partially built element
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    fn append_text(&mut self, text: &str) {
        let text = if text.contains('\n') { text.trim() } else { text };
        if text.is_empty() {
            return;
        }
        if let Some(current) = self.stack.last_mut() {
            if !current.text.is_empty() {
                current.text.push('\n');
            }
            current.text.push_str(text);
        }
    }

    fn close(&mut self, element: XmlElement) -> Option<XmlElement> {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.children.push(element);
                None
            }
            None => Some(element),
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> IndiResult<XmlElement> {
    let mut element = XmlElement::new(&String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| IndiError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| IndiError::Xml(e.to_string()))?
            .to_string();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Parse exactly one element from a string
pub fn parse_element(xml: &str) -> IndiResult<XmlElement> {
    let mut elements = parse_elements(xml)?;
    match elements.len() {
        1 => Ok(elements.remove(0)),
        0 => Err(IndiError::Xml("no element found".to_string())),
        n => Err(IndiError::Xml(format!("expected one element, found {}", n))),
    }
}

/// Parse a sequence of top-level elements from a string
pub fn parse_elements(xml: &str) -> IndiResult<Vec<XmlElement>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut builder = TreeBuilder::new();
    let mut elements = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            event => {
                if let Some(element) = builder.push(event)? {
                    elements.push(element);
                }
            }
        }
    }

    if builder.in_progress() {
        return Err(IndiError::Xml("unterminated element".to_string()));
    }
    Ok(elements)
}
