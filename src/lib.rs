//! Page cache and look-ahead prefetcher for a webcomic reader.
//!
//! A viewer points a [`PageCache`] at a thread manifest, asks it for pages
//! by number, and re-renders when a [`CacheEvent`] says a page arrived.
//!
//! ```no_run
//! use std::sync::Arc;
//! use comic_pagecache::{CacheConfig, HttpTransport, PageCache};
//!
//! # async fn run() -> Result<(), comic_pagecache::CacheError> {
//! let config = CacheConfig::default();
//! let transport = Arc::new(HttpTransport::new(&config));
//! let cache = PageCache::new(config, transport);
//!
//! let pages = cache.open_thread("https://comics.example/installment/4/pages.json").await?;
//! for num in 1..=pages {
//!     let page = cache.load(num).await?;
//!     println!("page {} -> {:?}", num, page.url);
//! }
//! cache.close();
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
mod residency;
pub mod stats;
pub mod transport;

pub use blob::{Blob, BlobStore, BlobUrl};
pub use cache::{PageCache, PageSnapshot, PageState};
pub use config::CacheConfig;
pub use error::{CacheError, FetchError, Result};
pub use events::CacheEvent;
pub use manifest::{Manifest, PageEntry};
pub use stats::CacheStats;
pub use transport::{HttpTransport, Transport};
