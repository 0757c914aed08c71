//! BLOB pipeline
//!
//! Decodes the payload of a `oneBLOB` element into the single buffer a BLOB
//! widget owns. Three encodings are handled:
//! - inline base64 text
//! - `.z` compressed payloads (zlib), from either of the other two sources
//! - shared-buffer attachments deposited by the transport in an
//!   [`AttachmentStore`], either moved into the widget ("direct") or copied
//!
//! Buffers are move-only. Installing a new buffer into a widget drops the
//! previous one, and a shared attachment is released exactly once when the
//! [`SharedBlob`] holding it is dropped.

use crate::error::{IndiError, IndiResult, ParseErrorKind};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::{Decompress, FlushDecompress, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Suffix marking a zlib-compressed payload
pub const COMPRESSED_SUFFIX: &str = ".z";

/// A side-channel buffer handed over by the transport
///
/// Dropping it releases the attachment and decrements the owning store's
/// live count.
pub struct SharedBlob {
    id: String,
    bytes: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl SharedBlob {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SharedBlob {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for SharedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBlob")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Registry of shared-buffer attachments, keyed by the transport's opaque id
#[derive(Debug, Default)]
pub struct AttachmentStore {
    pending: Mutex<HashMap<String, SharedBlob>>,
    live: Arc<AtomicUsize>,
}

impl AttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit attachment bytes under `id`; a previous buffer with the same id is released
    pub fn deposit(&self, id: &str, bytes: Vec<u8>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let blob = SharedBlob {
            id: id.to_string(),
            bytes,
            live: self.live.clone(),
        };
        let replaced = self.pending.lock().insert(id.to_string(), blob);
        if replaced.is_some() {
            tracing::warn!("Attachment '{}' replaced before it was consumed", id);
        }
    }

    /// Take ownership of the attachment registered under `id`
    pub fn take(&self, id: &str) -> Option<SharedBlob> {
        self.pending.lock().remove(id)
    }

    /// Number of deposited attachments not yet consumed
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of attachment buffers still alive, pending or installed in a widget
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

enum BlobData {
    Empty,
    Owned(Vec<u8>),
    Shared(SharedBlob),
}

/// The one buffer owned by a BLOB widget
pub struct BlobBuffer {
    data: BlobData,
}

impl BlobBuffer {
    pub fn empty() -> Self {
        Self {
            data: BlobData::Empty,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            data: BlobData::Owned(bytes),
        }
    }

    pub fn from_shared(blob: SharedBlob) -> Self {
        Self {
            data: BlobData::Shared(blob),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            BlobData::Empty => &[],
            BlobData::Owned(bytes) => bytes,
            BlobData::Shared(blob) => blob.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the bytes still live in a transport attachment
    pub fn is_shared(&self) -> bool {
        matches!(self.data, BlobData::Shared(_))
    }
}

impl Default for BlobBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for BlobBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for BlobBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobBuffer")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Where the bytes of a `oneBLOB` come from
#[derive(Debug, Clone, PartialEq)]
pub enum BlobSource {
    Inline(String),
    Attached { id: String, direct: bool },
}

/// One parsed `oneBLOB` element
#[derive(Debug, Clone, PartialEq)]
pub struct BlobPayload {
    pub name: String,
    pub format: String,
    pub size: usize,
    pub source: BlobSource,
}

/// A decoded payload ready to be installed in a widget
#[derive(Debug)]
pub struct DecodedBlob {
    pub buffer: BlobBuffer,
    pub format: String,
    pub size: usize,
}

/// Identifies the BLOB being decoded, for error messages
#[derive(Debug, Clone, Copy)]
pub struct BlobContext<'a> {
    pub device: &'a str,
    pub property: &'a str,
}

/// Decode one payload into an owned buffer
pub fn decode_payload(
    payload: &BlobPayload,
    attachments: &AttachmentStore,
    ctx: BlobContext<'_>,
) -> IndiResult<DecodedBlob> {
    let start = Instant::now();

    let raw = match &payload.source {
        BlobSource::Inline(text) => BlobBuffer::from_vec(decode_base64(text, &payload.name)?),
        BlobSource::Attached { id, direct } => {
            let blob = attachments
                .take(id)
                .ok_or_else(|| IndiError::AttachmentNotFound(id.clone()))?;
            if *direct {
                BlobBuffer::from_shared(blob)
            } else {
                let mut copy = alloc_buffer(blob.as_slice().len(), &payload.name)?;
                copy.extend_from_slice(blob.as_slice());
                BlobBuffer::from_vec(copy)
            }
        }
    };

    let decoded = match payload.format.strip_suffix(COMPRESSED_SUFFIX) {
        Some(stripped) => {
            let inflated = inflate(raw.as_slice(), payload.size, &payload.name, ctx)?;
            DecodedBlob {
                size: inflated.len(),
                buffer: BlobBuffer::from_vec(inflated),
                format: stripped.to_string(),
            }
        }
        None => DecodedBlob {
            size: payload.size,
            buffer: raw,
            format: payload.format.clone(),
        },
    };

    if let Some(detected) = detect_blob_format(decoded.buffer.as_slice()) {
        if detected.trim_start_matches('.') != decoded.format.trim_start_matches('.') {
            tracing::debug!(
                "BLOB format mismatch for {}.{}.{}: declared '{}', detected '{}'",
                ctx.device,
                ctx.property,
                payload.name,
                decoded.format,
                detected
            );
        }
    }

    tracing::debug!(
        "BLOB decoded for {}.{}.{}: {} bytes in {:?}",
        ctx.device,
        ctx.property,
        payload.name,
        decoded.buffer.len(),
        start.elapsed()
    );

    Ok(decoded)
}

fn alloc_buffer(capacity: usize, element: &str) -> IndiResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| IndiError::BlobAllocation {
            element: element.to_string(),
            size: capacity,
        })?;
    Ok(buf)
}

/// Decode standard base64, ignoring the line breaks servers insert
pub fn decode_base64(text: &str, element: &str) -> IndiResult<Vec<u8>> {
    let compact: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    let mut out = alloc_buffer(compact.len() / 4 * 3 + 3, element)?;
    BASE64
        .decode_vec(&compact, &mut out)
        .map_err(|e| IndiError::Parse {
            kind: ParseErrorKind::InvalidPayload,
            value: format!("base64 payload for {}: {}", element, e),
        })?;
    Ok(out)
}

/// Encode bytes for an inline `oneBLOB`
pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Inflate a zlib stream into a buffer of exactly `size` bytes capacity
fn inflate(data: &[u8], size: usize, element: &str, ctx: BlobContext<'_>) -> IndiResult<Vec<u8>> {
    let mut out = alloc_buffer(size, element)?;
    let mut z = Decompress::new(true);

    let compression_error = |reason: String| IndiError::Compression {
        device: ctx.device.to_string(),
        property: ctx.property.to_string(),
        element: element.to_string(),
        reason,
    };

    match z.decompress_vec(data, &mut out, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(out),
        Ok(status) => Err(compression_error(format!(
            "stream incomplete ({:?}) after {} of {} bytes",
            status,
            z.total_out(),
            size
        ))),
        Err(e) => Err(compression_error(e.to_string())),
    }
}

/// Detect the actual payload format from magic bytes
pub fn detect_blob_format(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"SIMPLE") {
        Some(".fits")
    } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(".png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(".jpeg")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some(".webp")
    } else if data.starts_with(&[0x1F, 0x8B]) {
        Some(".gz")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    const CTX: BlobContext<'static> = BlobContext {
        device: "CCD Simulator",
        property: "CCD1",
    };

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn inline(format: &str, size: usize, data: &[u8]) -> BlobPayload {
        BlobPayload {
            name: "CCD1".to_string(),
            format: format.to_string(),
            size,
            source: BlobSource::Inline(encode_base64(data)),
        }
    }

    #[test]
    fn test_inline_base64_with_line_breaks() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let encoded = encode_base64(&data);
        let wrapped: String = encoded
            .as_bytes()
            .chunks(72)
            .map(|c| format!("{}\n", std::str::from_utf8(c).unwrap()))
            .collect();

        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".raw".to_string(),
            size: data.len(),
            source: BlobSource::Inline(wrapped),
        };
        let store = AttachmentStore::new();
        let decoded = decode_payload(&payload, &store, CTX).unwrap();
        assert_eq!(decoded.buffer.as_slice(), &data[..]);
        assert_eq!(decoded.format, ".raw");
        assert_eq!(decoded.size, 1000);
    }

    #[test]
    fn test_invalid_base64_is_reported() {
        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".fits".to_string(),
            size: 3,
            source: BlobSource::Inline("@@@@".to_string()),
        };
        let store = AttachmentStore::new();
        assert!(decode_payload(&payload, &store, CTX).is_err());
    }

    #[test]
    fn test_compressed_payload_is_inflated_and_suffix_stripped() {
        let plain = b"SIMPLE  =                    T / file conforms to FITS".repeat(20);
        let payload = inline("fits.z", plain.len(), &zlib(&plain));

        let store = AttachmentStore::new();
        let decoded = decode_payload(&payload, &store, CTX).unwrap();
        assert_eq!(decoded.buffer.as_slice(), &plain[..]);
        assert_eq!(decoded.format, "fits");
        assert_eq!(decoded.size, plain.len());
    }

    #[test]
    fn test_compression_errors() {
        let store = AttachmentStore::new();

        let garbage = inline(".fits.z", 64, b"definitely not zlib");
        let err = decode_payload(&garbage, &store, CTX).unwrap_err();
        assert!(matches!(err, IndiError::Compression { .. }));

        // declared size smaller than the inflated payload
        let plain = vec![7u8; 4096];
        let short = inline(".fits.z", 100, &zlib(&plain));
        let err = decode_payload(&short, &store, CTX).unwrap_err();
        match err {
            IndiError::Compression { element, .. } => assert_eq!(element, "CCD1"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_direct_attachment_moves_buffer() {
        let store = AttachmentStore::new();
        store.deposit("blob-1", vec![1, 2, 3, 4]);
        assert_eq!(store.live_buffers(), 1);

        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".raw".to_string(),
            size: 4,
            source: BlobSource::Attached {
                id: "blob-1".to_string(),
                direct: true,
            },
        };
        let decoded = decode_payload(&payload, &store, CTX).unwrap();
        assert!(decoded.buffer.is_shared());
        assert_eq!(decoded.buffer.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(store.pending(), 0);
        assert_eq!(store.live_buffers(), 1);

        drop(decoded);
        assert_eq!(store.live_buffers(), 0);
    }

    #[test]
    fn test_copy_attachment_releases_shared_buffer() {
        let store = AttachmentStore::new();
        store.deposit("blob-2", vec![9; 16]);

        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".raw".to_string(),
            size: 16,
            source: BlobSource::Attached {
                id: "blob-2".to_string(),
                direct: false,
            },
        };
        let decoded = decode_payload(&payload, &store, CTX).unwrap();
        assert!(!decoded.buffer.is_shared());
        assert_eq!(decoded.buffer.len(), 16);
        assert_eq!(store.live_buffers(), 0);
    }

    #[test]
    fn test_compressed_direct_attachment() {
        let store = AttachmentStore::new();
        let plain = b"compressed attachment".to_vec();
        store.deposit("blob-3", zlib(&plain));

        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".bin.z".to_string(),
            size: plain.len(),
            source: BlobSource::Attached {
                id: "blob-3".to_string(),
                direct: true,
            },
        };
        let decoded = decode_payload(&payload, &store, CTX).unwrap();
        assert_eq!(decoded.buffer.as_slice(), &plain[..]);
        assert_eq!(decoded.format, ".bin");
        assert_eq!(store.live_buffers(), 0);
    }

    #[test]
    fn test_missing_attachment() {
        let store = AttachmentStore::new();
        let payload = BlobPayload {
            name: "CCD1".to_string(),
            format: ".raw".to_string(),
            size: 4,
            source: BlobSource::Attached {
                id: "nope".to_string(),
                direct: true,
            },
        };
        assert_eq!(
            decode_payload(&payload, &store, CTX).unwrap_err(),
            IndiError::AttachmentNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_blob_format_detection() {
        assert_eq!(detect_blob_format(b"SIMPLE  =                    T"), Some(".fits"));
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect_blob_format(&png), Some(".png"));
        assert_eq!(detect_blob_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(".jpeg"));
        assert_eq!(detect_blob_format(&[0x00, 0x01, 0x02]), None);
    }
}
