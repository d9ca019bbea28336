//! Notifications the page cache broadcasts to the presentation layer.

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;

use crate::blob::BlobUrl;

/// Buffered events per subscriber before the slowest one starts lagging.
pub(crate) const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    /// A new manifest replaced the previous one.
    Ready { pages: usize },
    /// The manifest could not be fetched; the previous one is kept.
    ManifestFailed { locator: String, error: String },
    /// A page's payload was materialized.
    PageLoaded { num: usize, url: BlobUrl },
    /// A page gave up after its retries.
    PageFailed { num: usize, error: String },
    /// A resident page was released to stay under the residency bound.
    Evicted { num: usize },
}

impl CacheEvent {
    /// Page number the event is about, if any.
    pub fn page(&self) -> Option<usize> {
        match self {
            CacheEvent::PageLoaded { num, .. }
            | CacheEvent::PageFailed { num, .. }
            | CacheEvent::Evicted { num } => Some(*num),
            CacheEvent::Ready { .. } | CacheEvent::ManifestFailed { .. } => None,
        }
    }
}

/// Wrap a receiver as a stream, dropping lag notices.
pub(crate) fn into_stream(rx: broadcast::Receiver<CacheEvent>) -> impl Stream<Item = CacheEvent> {
    BroadcastStream::new(rx).filter_map(|item| item.ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[test]
    fn test_page_of_event() {
        assert_eq!(CacheEvent::Evicted { num: 3 }.page(), Some(3));
        assert_eq!(
            CacheEvent::PageFailed {
                num: 2,
                error: "HTTP 500".into()
            }
            .page(),
            Some(2)
        );
        assert_eq!(CacheEvent::Ready { pages: 9 }.page(), None);
    }

    #[tokio::test]
    async fn test_stream_yields_sent_events() {
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        let mut stream = Box::pin(into_stream(rx));

        tx.send(CacheEvent::Ready { pages: 1 }).unwrap();
        tx.send(CacheEvent::Evicted { num: 1 }).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(CacheEvent::Ready { pages: 1 }));
        assert_eq!(stream.next().await, Some(CacheEvent::Evicted { num: 1 }));
        assert_eq!(stream.next().await, None);
    }
}
