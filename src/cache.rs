//! Page cache and look-ahead prefetcher.
//!
//! [`PageCache`] maps the 1-based page numbers of a thread manifest to
//! materialized image payloads. Asking for a page dispatches its fetch right
//! away, then prefetches the window around it on a later scheduler turn.
//! Completions update the cache and are broadcast as [`CacheEvent`]s, so the
//! viewer renders whatever [`PageCache::get_page`] returns now and re-renders
//! when notified.
//!
//! Every fetch is tagged with the epoch of the manifest it was issued for.
//! Switching threads bumps the epoch and cancels the old fetches; anything
//! that still completes under a stale epoch is dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use futures::Stream;

use crate::blob::{Blob, BlobStore, BlobUrl};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::{self, CacheEvent, EVENT_CAPACITY};
use crate::manifest::PageEntry;
use crate::residency::Residency;
use crate::stats::{CacheStats, Counters};
use crate::transport::Transport;

/// Load state of one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Never fetched, or released.
    Idle,
    /// One fetch outstanding. `attempt` counts retries so far.
    Fetching { attempt: u32 },
    /// Payload materialized behind this handle.
    Loaded(BlobUrl),
    /// Gave up after the last retry. The next request fetches again.
    Failed { error: String },
}

impl PageState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PageState::Loaded(_))
    }
}

/// What a viewer can render for a page right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSnapshot {
    pub num: usize,
    /// Handle to render, present exactly when `loaded` is true.
    pub url: Option<BlobUrl>,
    pub loaded: bool,
}

struct PageSlot {
    entry: PageEntry,
    state: PageState,
}

struct State {
    /// Locator of the manifest currently installed.
    thread: Option<String>,
    /// Locator of a manifest being fetched.
    pending: Option<String>,
    epoch: u64,
    cancel: CancellationToken,
    pages: Vec<PageSlot>,
    current: Option<usize>,
    resident: Residency,
    closed: bool,
}

impl State {
    fn slot_mut(&mut self, num: usize) -> Option<&mut PageSlot> {
        num.checked_sub(1).and_then(|idx| self.pages.get_mut(idx))
    }

    fn snapshot(&self, num: usize) -> PageSnapshot {
        let url = match num.checked_sub(1).and_then(|idx| self.pages.get(idx)) {
            Some(PageSlot {
                state: PageState::Loaded(url),
                ..
            }) => Some(url.clone()),
            _ => None,
        };
        PageSnapshot {
            num,
            loaded: url.is_some(),
            url,
        }
    }
}

struct FetchJob {
    epoch: u64,
    num: usize,
    locator: String,
    cancel: CancellationToken,
}

struct Inner {
    config: CacheConfig,
    transport: Arc<dyn Transport>,
    blobs: BlobStore,
    state: Mutex<State>,
    events: broadcast::Sender<CacheEvent>,
    counters: Counters,
}

/// Shared handle to a page cache. Cloning is cheap; all clones see the same
/// pages.
///
/// Operations that start fetches spawn Tokio tasks and must run inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<Inner>,
}

impl PageCache {
    pub fn new(config: CacheConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = State {
            thread: None,
            pending: None,
            epoch: 0,
            cancel: CancellationToken::new(),
            pages: Vec::new(),
            current: None,
            resident: Residency::new(),
            closed: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                blobs: BlobStore::new(),
                state: Mutex::new(state),
                events,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Switch to the thread whose manifest lives at `locator`.
    ///
    /// Returns false if that thread is already installed or being fetched.
    /// Otherwise every in-flight fetch of the previous thread is cancelled
    /// and the manifest is fetched in the background; the outcome arrives as
    /// `Ready` or `ManifestFailed`.
    pub fn set_thread(&self, locator: impl Into<String>) -> bool {
        let locator = locator.into();
        let (epoch, cancel) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            let same = match &state.pending {
                Some(pending) => *pending == locator,
                None => state.thread.as_deref() == Some(locator.as_str()),
            };
            if same {
                return false;
            }

            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.epoch += 1;
            state.pending = Some(locator.clone());
            // Cancelled fetches never complete; let the old pages be asked
            // for again until the new manifest lands.
            for slot in &mut state.pages {
                if matches!(slot.state, PageState::Fetching { .. }) {
                    slot.state = PageState::Idle;
                }
            }
            (state.epoch, state.cancel.clone())
        };

        debug!("Fetching manifest {} (epoch {})", locator, epoch);
        tokio::spawn(Arc::clone(&self.inner).load_manifest(epoch, locator, cancel));
        true
    }

    /// Switch threads and wait for the outcome. Resolves at once with the
    /// page count if `locator` is already installed.
    pub async fn open_thread(&self, locator: impl Into<String>) -> Result<usize> {
        let mut rx = self.subscribe();
        if !self.set_thread(locator) {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(CacheError::Closed);
            }
            if state.pending.is_none() {
                return Ok(state.pages.len());
            }
        }
        loop {
            match rx.recv().await {
                Ok(CacheEvent::Ready { pages }) => return Ok(pages),
                Ok(CacheEvent::ManifestFailed { locator, error }) => {
                    return Err(CacheError::Manifest { locator, error });
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(CacheError::Closed),
            }
        }
    }

    /// Current state of page `num`, dispatching its fetch and the prefetch
    /// window around it.
    ///
    /// Never waits: the snapshot reflects what is loaded right now. Asking
    /// for a page that is not in the manifest is a caller bug and fails with
    /// [`CacheError::NoSuchPage`] without touching any state.
    pub fn get_page(&self, num: usize) -> Result<PageSnapshot> {
        let (snapshot, epoch) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(CacheError::Closed);
            }
            if state.thread.is_none() {
                return Err(CacheError::NoManifest);
            }
            let len = state.pages.len();
            if num == 0 || num > len {
                return Err(CacheError::NoSuchPage { num, len });
            }

            state.current = Some(num);
            state.resident.touch(num);
            self.inner.load_page(&mut state, num);
            (state.snapshot(num), state.epoch)
        };

        // The window goes out on a later turn so the requested page's fetch
        // is always dispatched first.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.prefetch_window(epoch, num) });
        Ok(snapshot)
    }

    /// Request page `num` and wait until it is loaded or has failed.
    pub async fn load(&self, num: usize) -> Result<PageSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = self.get_page(num)?;
        if snapshot.loaded {
            return Ok(snapshot);
        }
        let epoch = self.inner.state.lock().epoch;
        loop {
            match rx.recv().await {
                Ok(CacheEvent::Ready { .. } | CacheEvent::ManifestFailed { .. }) => {
                    return Err(CacheError::Superseded { num });
                }
                Ok(event) if event.page() != Some(num) => continue,
                Ok(CacheEvent::PageLoaded { url, .. }) => {
                    return Ok(PageSnapshot {
                        num,
                        url: Some(url),
                        loaded: true,
                    });
                }
                Ok(CacheEvent::PageFailed { error, .. }) => {
                    return Err(CacheError::PageFailed { num, error });
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    trace!("Waiter for page {} missed {} events", num, missed);
                    if let Some(outcome) = self.inner.settled(epoch, num) {
                        return outcome;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CacheError::Closed),
            }
        }
    }

    /// Release page `num`'s payload, returning it to `Idle`.
    ///
    /// Returns true if a payload was released.
    pub fn kill_blob(&self, num: usize) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.release(&mut state, num)
    }

    /// Bytes and type behind a handle, while it is valid.
    pub fn resource(&self, url: &BlobUrl) -> Option<Blob> {
        self.inner.blobs.get(url)
    }

    /// Snapshot of page `num` without dispatching anything.
    pub fn snapshot(&self, num: usize) -> Result<PageSnapshot> {
        let state = self.inner.state.lock();
        let len = state.pages.len();
        if num == 0 || num > len {
            return Err(CacheError::NoSuchPage { num, len });
        }
        Ok(state.snapshot(num))
    }

    pub fn page_state(&self, num: usize) -> Option<PageState> {
        let mut state = self.inner.state.lock();
        state.slot_mut(num).map(|slot| slot.state.clone())
    }

    /// Manifest entry of page `num`.
    pub fn entry(&self, num: usize) -> Option<PageEntry> {
        let mut state = self.inner.state.lock();
        state.slot_mut(num).map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locator of the installed manifest.
    pub fn thread(&self) -> Option<String> {
        self.inner.state.lock().thread.clone()
    }

    /// Page most recently passed to `get_page`.
    pub fn current_page(&self) -> Option<usize> {
        self.inner.state.lock().current
    }

    /// Pages holding a payload, ascending.
    pub fn resident_pages(&self) -> Vec<usize> {
        self.inner.state.lock().resident.pages()
    }

    /// Payload bytes currently materialized.
    pub fn resident_bytes(&self) -> usize {
        self.inner.blobs.resident_bytes()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a stream. Events missed by a lagging consumer are skipped.
    pub fn events(&self) -> impl Stream<Item = CacheEvent> + Send + use<> {
        events::into_stream(self.subscribe())
    }

    /// Tear down: cancel all fetches and release every payload. Further
    /// requests fail with [`CacheError::Closed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.cancel.cancel();
        state.pending = None;
        state.current = None;
        for slot in std::mem::take(&mut state.pages) {
            if let PageState::Loaded(url) = slot.state {
                self.inner.blobs.revoke(&url);
            }
        }
        state.resident.clear();
        self.inner.blobs.clear();
        info!("Page cache closed");
    }
}

impl Inner {
    async fn load_manifest(self: Arc<Self>, epoch: u64, locator: String, cancel: CancellationToken) {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Manifest fetch for {} cancelled", locator);
                return;
            }
            result = self.transport.fetch_manifest(&locator) => result,
        };

        let mut state = self.state.lock();
        if state.closed || state.epoch != epoch {
            self.counters.stale();
            debug!("Dropping stale manifest {} (epoch {})", locator, epoch);
            return;
        }
        state.pending = None;

        match result {
            Ok(manifest) => {
                // Pages of the old manifest may have been requested while
                // this one was pending; none of those fetches may land here.
                state.cancel.cancel();
                state.cancel = CancellationToken::new();
                state.epoch += 1;
                for slot in std::mem::take(&mut state.pages) {
                    if let PageState::Loaded(url) = slot.state {
                        self.blobs.revoke(&url);
                    }
                }
                state.resident.clear();
                state.current = None;
                state.pages = manifest
                    .pages
                    .into_iter()
                    .map(|entry| PageSlot {
                        entry,
                        state: PageState::Idle,
                    })
                    .collect();
                state.thread = Some(locator.clone());

                let pages = state.pages.len();
                info!("Loaded manifest {} with {} pages", locator, pages);
                let _ = self.events.send(CacheEvent::Ready { pages });
            }
            Err(err) => {
                warn!("Manifest {} failed: {}", locator, err);
                let _ = self.events.send(CacheEvent::ManifestFailed {
                    locator,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Outcome of a wait on page `num` that may have missed its event, or
    /// `None` while its fetch is still in flight.
    fn settled(self: &Arc<Self>, epoch: u64, num: usize) -> Option<Result<PageSnapshot>> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(Err(CacheError::Closed));
        }
        if state.epoch != epoch {
            return Some(Err(CacheError::Superseded { num }));
        }
        let page = state.slot_mut(num).map(|slot| slot.state.clone());
        match page {
            None => Some(Err(CacheError::Superseded { num })),
            Some(PageState::Loaded(_)) => Some(Ok(state.snapshot(num))),
            Some(PageState::Failed { error }) => Some(Err(CacheError::PageFailed { num, error })),
            Some(PageState::Fetching { .. }) => None,
            Some(PageState::Idle) => {
                // Released after loading; ask for it again.
                self.load_page(&mut state, num);
                None
            }
        }
    }

    /// Dispatch a fetch for page `num` unless it is missing, loaded, or
    /// already in flight. Returns whether a fetch was started.
    fn load_page(self: &Arc<Self>, state: &mut State, num: usize) -> bool {
        let Some(slot) = state.slot_mut(num) else {
            return false;
        };
        match slot.state {
            PageState::Loaded(_) => return false,
            PageState::Fetching { .. } => {
                self.counters.coalesced();
                trace!("Page {} already in flight", num);
                return false;
            }
            PageState::Idle | PageState::Failed { .. } => {}
        }
        slot.state = PageState::Fetching { attempt: 0 };
        let locator = slot.entry.image_url.clone();

        let job = FetchJob {
            epoch: state.epoch,
            num,
            locator,
            cancel: state.cancel.clone(),
        };
        self.counters.fetch();
        trace!("Fetching page {} from {}", num, job.locator);
        tokio::spawn(Arc::clone(self).fetch_page(job));
        true
    }

    fn prefetch_window(self: &Arc<Self>, epoch: u64, num: usize) {
        let mut state = self.state.lock();
        if state.closed || state.epoch != epoch {
            return;
        }
        let window = self.config.window(num);
        let first = (*window.start()).max(1);
        let last = (*window.end()).min(state.pages.len());
        for n in first..=last {
            if n != num {
                self.load_page(&mut state, n);
            }
        }
    }

    async fn fetch_page(self: Arc<Self>, job: FetchJob) {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => {
                    trace!("Fetch of page {} cancelled", job.num);
                    return;
                }
                result = self.transport.fetch_bytes(&job.locator) => result,
            };

            let err = match result {
                Ok(bytes) => {
                    self.set_blob(job.epoch, job.num, bytes);
                    return;
                }
                Err(err) => err,
            };

            if attempt >= self.config.max_retries {
                self.fail_page(job.epoch, job.num, err.to_string());
                return;
            }
            attempt += 1;
            if !self.mark_retry(job.epoch, job.num, attempt) {
                return;
            }
            self.counters.retry();
            let delay = self.config.backoff_for(attempt);
            debug!(
                "Page {} failed ({}), retry {} in {:?}",
                job.num, err, attempt, delay
            );
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn mark_retry(&self, epoch: u64, num: usize, attempt: u32) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.epoch != epoch {
            self.counters.stale();
            return false;
        }
        match state.slot_mut(num) {
            Some(slot) => {
                slot.state = PageState::Fetching { attempt };
                true
            }
            None => false,
        }
    }

    /// Install a fetched payload for page `num`.
    fn set_blob(&self, epoch: u64, num: usize, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        if state.closed || state.epoch != epoch || state.slot_mut(num).is_none() {
            self.counters.stale();
            debug!("Dropping stale payload for page {} (epoch {})", num, epoch);
            return;
        }

        let size = bytes.len();
        let url = self.blobs.create(epoch, bytes);
        if let Some(slot) = state.slot_mut(num) {
            let previous = std::mem::replace(&mut slot.state, PageState::Loaded(url.clone()));
            if let PageState::Loaded(old) = previous {
                self.blobs.revoke(&old);
            }
        }
        state.resident.insert(num);
        self.counters.loaded();
        debug!("Page {} loaded ({} bytes) as {}", num, size, url);
        let _ = self.events.send(CacheEvent::PageLoaded { num, url });

        self.evict_excess(&mut state);
    }

    fn fail_page(&self, epoch: u64, num: usize, error: String) {
        let mut state = self.state.lock();
        if state.closed || state.epoch != epoch {
            self.counters.stale();
            return;
        }
        let Some(slot) = state.slot_mut(num) else {
            return;
        };
        slot.state = PageState::Failed {
            error: error.clone(),
        };
        self.counters.failed();
        warn!("Page {} failed: {}", num, error);
        let _ = self.events.send(CacheEvent::PageFailed { num, error });
    }

    /// Release least recently used pages outside the current window until
    /// residency is back under the limit.
    fn evict_excess(&self, state: &mut State) {
        let limit = self.config.resident_limit();
        let window = state.current.map(|num| self.config.window(num));
        while state.resident.len() > limit {
            let victim = state
                .resident
                .victim(|n| window.as_ref().is_some_and(|w| w.contains(&n)));
            let Some(victim) = victim else {
                break;
            };
            if self.release(state, victim) {
                self.counters.evicted();
                debug!("Evicted page {}", victim);
                let _ = self.events.send(CacheEvent::Evicted { num: victim });
            } else {
                state.resident.remove(victim);
            }
        }
    }

    fn release(&self, state: &mut State, num: usize) -> bool {
        let Some(slot) = state.slot_mut(num) else {
            return false;
        };
        if !slot.state.is_loaded() {
            return false;
        }
        if let PageState::Loaded(url) = std::mem::replace(&mut slot.state, PageState::Idle) {
            self.blobs.revoke(&url);
        }
        state.resident.remove(num);
        true
    }
}
