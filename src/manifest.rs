//! Thread manifest: the ordered list of pages a viewer can show.

use serde::{Deserialize, Serialize};

/// One entry of a thread manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageEntry {
    /// Locator of the page's source image.
    pub image_url: String,
    /// Any other per-page fields the server sends (titles, alt text, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PageEntry {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Ordered pages of an installment or strip. Page `n` is `pages[n - 1]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub pages: Vec<PageEntry>,
}

impl Manifest {
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pages: urls.into_iter().map(PageEntry::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_order_and_extra_fields() {
        let json = br#"{
            "title": "Installment 4",
            "pages": [
                {"image_url": "/a", "number": 1, "alt": "cover"},
                {"image_url": "/b"},
                {"image_url": "/c"}
            ]
        }"#;
        let manifest = Manifest::from_slice(json).unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.pages[0].image_url, "/a");
        assert_eq!(manifest.pages[2].image_url, "/c");
        assert_eq!(manifest.pages[0].extra.get("alt").unwrap(), "cover");
        assert!(manifest.pages[1].extra.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_pages() {
        assert!(Manifest::from_slice(br#"{"title": "nope"}"#).is_err());
        assert!(Manifest::from_slice(br#"{"pages": [{"number": 1}]}"#).is_err());
        assert!(Manifest::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = Manifest::from_slice(br#"{"pages": []}"#).unwrap();
        assert!(manifest.is_empty());
    }
}
