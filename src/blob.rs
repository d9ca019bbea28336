//! Store of materialized page payloads, addressed by `blob:` locators.
//!
//! A [`BlobUrl`] stays valid until it is revoked. Whoever created a handle
//! owns it and must revoke it before dropping or replacing it, otherwise the
//! bytes stay resident.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const FALLBACK_MIME: &str = "application/octet-stream";

/// Local locator of a materialized payload (`blob:pagecache/<epoch>/<id>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobUrl(String);

impl BlobUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A materialized payload.
#[derive(Clone, Debug)]
pub struct Blob {
    pub bytes: Arc<[u8]>,
    /// MIME type sniffed from the payload's magic bytes.
    pub mime: &'static str,
}

impl Blob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension matching the sniffed type.
    pub fn extension(&self) -> &'static str {
        match self.mime {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            "image/avif" => "avif",
            _ => "bin",
        }
    }
}

/// Thread-safe blob registry.
#[derive(Default)]
pub struct BlobStore {
    blobs: RwLock<HashMap<BlobUrl, Blob>>,
    next_id: AtomicU64,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize `bytes` and hand back a fresh locator for them.
    pub fn create(&self, epoch: u64, bytes: Vec<u8>) -> BlobUrl {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let url = BlobUrl(format!("blob:pagecache/{}/{}", epoch, id));
        let mime = sniff_mime(&bytes);
        self.blobs.write().insert(
            url.clone(),
            Blob {
                bytes: bytes.into(),
                mime,
            },
        );
        url
    }

    pub fn get(&self, url: &BlobUrl) -> Option<Blob> {
        self.blobs.read().get(url).cloned()
    }

    /// Release a handle. Returns false if it was not (or no longer) valid.
    pub fn revoke(&self, url: &BlobUrl) -> bool {
        self.blobs.write().remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Total payload bytes currently held.
    pub fn resident_bytes(&self) -> usize {
        self.blobs.read().values().map(Blob::len).sum()
    }

    pub fn clear(&self) {
        self.blobs.write().clear();
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or(FALLBACK_MIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_create_get_revoke() {
        let store = BlobStore::new();
        let url = store.create(1, b"payload".to_vec());

        assert!(url.as_str().starts_with("blob:pagecache/1/"));
        assert_eq!(&*store.get(&url).unwrap().bytes, b"payload");
        assert_eq!(store.resident_bytes(), 7);

        assert!(store.revoke(&url));
        assert!(!store.revoke(&url));
        assert!(store.get(&url).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_handles_are_unique() {
        let store = BlobStore::new();
        let a = store.create(1, b"same".to_vec());
        let b = store.create(1, b"same".to_vec());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_mime_sniffing() {
        let store = BlobStore::new();
        let png = store.create(1, PNG_MAGIC.to_vec());
        let junk = store.create(1, b"hello".to_vec());

        let png = store.get(&png).unwrap();
        assert_eq!(png.mime, "image/png");
        assert_eq!(png.extension(), "png");

        let junk = store.get(&junk).unwrap();
        assert_eq!(junk.mime, FALLBACK_MIME);
        assert_eq!(junk.extension(), "bin");
    }
}
