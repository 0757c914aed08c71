//! Async element framing
//!
//! An INDI stream is a sequence of top-level XML elements with no enclosing
//! document. [`ElementReader`] pulls quick-xml events from an
//! `AsyncBufRead` and yields one [`XmlElement`] per complete top-level
//! element, however the bytes were chunked on the way in.

use crate::error::{IndiError, IndiResult};
use crate::xml::{TreeBuilder, XmlElement};
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader};

/// Frames a byte stream into top-level elements
pub struct ElementReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    builder: TreeBuilder,
}

impl<R: AsyncRead + Unpin> ElementReader<BufReader<R>> {
    /// Wrap an unbuffered reader, such as a TCP read half
    pub fn from_read(inner: R) -> Self {
        Self::new(BufReader::new(inner))
    }
}

impl<R: AsyncBufRead + Unpin> ElementReader<R> {
    pub fn new(inner: R) -> Self {
        let reader = Reader::from_reader(inner);
        Self {
            reader,
            buf: Vec::new(),
            builder: TreeBuilder::new(),
        }
    }

    /// Next complete top-level element, or `None` at end of stream
    ///
    /// A syntax error discards the partially built element and is returned
    /// as [`IndiError::Xml`]; the caller may keep reading.
    pub async fn next_element(&mut self) -> IndiResult<Option<XmlElement>> {
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into_async(&mut self.buf).await {
                Ok(event) => event,
                Err(e) => {
                    self.builder.reset();
                    return Err(e.into());
                }
            };

            match event {
                Event::Eof => {
                    if self.builder.in_progress() {
                        self.builder.reset();
                        return Err(IndiError::Xml("stream ended inside an element".to_string()));
                    }
                    return Ok(None);
                }
                event => match self.builder.push(event) {
                    Ok(Some(element)) => return Ok(Some(element)),
                    Ok(None) => {}
                    Err(e) => {
                        self.builder.reset();
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.reader.buffer_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const STREAM: &str = r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" label="Connection" group="Main Control" state="Idle" perm="rw" rule="OneOfMany" timeout="60" timestamp="2024-03-01T21:00:00">
    <defSwitch name="CONNECT" label="Connect">
Off
    </defSwitch>
    <defSwitch name="DISCONNECT" label="Disconnect">
On
    </defSwitch>
</defSwitchVector>
<message device="Telescope Simulator" timestamp="2024-03-01T21:00:01" message="[INFO] Ready"/>
<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Ok">
    <oneSwitch name="CONNECT">On</oneSwitch>
    <oneSwitch name="DISCONNECT">Off</oneSwitch>
</setSwitchVector>
"#;

    async fn collect<R: AsyncBufRead + Unpin>(mut reader: ElementReader<R>) -> Vec<XmlElement> {
        let mut out = Vec::new();
        while let Some(element) = reader.next_element().await.unwrap() {
            out.push(element);
        }
        out
    }

    #[tokio::test]
    async fn test_frames_top_level_elements() {
        let elements = collect(ElementReader::from_read(STREAM.as_bytes())).await;
        let tags: Vec<&str> = elements.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["defSwitchVector", "message", "setSwitchVector"]);
        assert_eq!(elements[0].children.len(), 2);
        assert_eq!(elements[0].children[0].text, "Off");
        assert_eq!(elements[1].attribute("message"), Some("[INFO] Ready"));
    }

    #[tokio::test]
    async fn test_tiny_buffer_gives_same_elements() {
        let whole = collect(ElementReader::from_read(STREAM.as_bytes())).await;
        let chunked = collect(ElementReader::new(BufReader::with_capacity(7, STREAM.as_bytes()))).await;
        assert_eq!(whole, chunked);
    }

    #[tokio::test]
    async fn test_elements_split_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            for chunk in STREAM.as_bytes().chunks(11) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let elements = collect(ElementReader::from_read(rx)).await;
        writer.await.unwrap();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[2].children[0].text, "On");
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let partial = r#"<defTextVector device="A" name="B"><defText name="C">x</defText>"#;
        let mut reader = ElementReader::from_read(partial.as_bytes());
        assert!(matches!(reader.next_element().await, Err(IndiError::Xml(_))));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut reader = ElementReader::from_read(&b""[..]);
        assert!(reader.next_element().await.unwrap().is_none());
        assert_eq!(reader.position(), 0);
    }
}
