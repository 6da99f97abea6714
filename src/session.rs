//! One feed view: store, reconciler, visibility tracker and playback
//! controller wired together.
//!
//! Page fetches, media loads and stream callbacks happen on other threads but
//! only post messages. Every state change is applied by [`FeedSession::pump`]
//! or [`FeedSession::wait`] on the thread that owns the session.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::error::{FeedError, MediaError, SessionError, SourceError};
use crate::feed::{Cursor, FeedItem, ItemId, Page, PlaybackState, VisibilityState};
use crate::media::{self, LoadCompletion, MediaFetcher};
use crate::playback::PlaybackController;
use crate::source::{DataSource, StreamMessage, Subscription};
use crate::store::{fetch_with_retry, FeedStore, LoadStatus};
use crate::sync::{Applied, ChangeEvent, Reconciler};
use crate::visibility::{Region, Viewport, VisibilityTracker};

/// Notification for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    ItemsChanged { revision: u64 },
    Playback { id: ItemId, state: PlaybackState },
    Status(LoadStatus),
    Stale(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Next,
    GapFill,
}

struct PageResult {
    fetch: u64,
    kind: FetchKind,
    result: Result<Page, SourceError>,
}

enum Wake {
    Stream(StreamMessage),
    Page(PageResult),
    Completion(LoadCompletion),
    Idle,
}

/// A page fetch running on a detached thread. Its result is matched by `id`,
/// so an aborted fetch that still answers is ignored.
struct InFlightFetch {
    id: u64,
    cancel: CancelHandle,
}

impl InFlightFetch {
    fn abort(mut self) {
        self.cancel.cancel();
    }
}

pub struct FeedSession {
    config: Config,
    source: Arc<dyn DataSource>,
    store: FeedStore,
    reconciler: Reconciler,
    tracker: VisibilityTracker,
    controller: PlaybackController,
    media: Option<media::Manager>,
    subscription: Option<Subscription>,
    stream_tx: Sender<StreamMessage>,
    stream_rx: Receiver<StreamMessage>,
    page_tx: Sender<PageResult>,
    page_rx: Receiver<PageResult>,
    completion_rx: Receiver<LoadCompletion>,
    next_fetch: Option<InFlightFetch>,
    gap_fetch: Option<InFlightFetch>,
    fetch_seq: u64,
    listeners: Vec<Sender<SessionUpdate>>,
    closed: bool,
}

impl FeedSession {
    pub fn new(
        source: Arc<dyn DataSource>,
        fetcher: Arc<dyn MediaFetcher>,
        config: Config,
        viewport: Viewport,
    ) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let manager = media::Manager::new(fetcher, &config.media, completion_tx);
        let controller = PlaybackController::new(config.playback.clone(), Arc::new(manager.handle()));
        let tracker = VisibilityTracker::new(config.visibility.clone(), viewport);
        let (stream_tx, stream_rx) = unbounded();
        let (page_tx, page_rx) = unbounded();

        Self {
            store: FeedStore::new(config.feed.page_size),
            reconciler: Reconciler::new(),
            tracker,
            controller,
            media: Some(manager),
            subscription: None,
            stream_tx,
            stream_rx,
            page_tx,
            page_rx,
            completion_rx,
            next_fetch: None,
            gap_fetch: None,
            fetch_seq: 0,
            listeners: Vec::new(),
            closed: false,
            source,
            config,
        }
    }

    /// Opens the live change stream and requests the first page.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.subscription.is_none() {
            let tx = self.stream_tx.clone();
            let subscription = self
                .source
                .subscribe(
                    &self.config.feed.resource,
                    Box::new(move |message| {
                        let _ = tx.send(message);
                    }),
                )
                .map_err(SessionError::Subscribe)?;
            self.subscription = Some(subscription);
            tracing::info!(resource = %self.config.feed.resource, "feed session started");
        }
        self.load_more();
        Ok(())
    }

    /// Requests the next page. Returns false when a page is already in flight,
    /// pagination is exhausted, or the session is closed.
    pub fn load_more(&mut self) -> bool {
        if self.closed || self.next_fetch.is_some() {
            return false;
        }
        if self.store.pages_fetched() > 0 && !self.store.has_more() {
            return false;
        }
        let cursor = self.store.cursor().cloned();
        self.store.begin_load();
        self.notify(SessionUpdate::Status(LoadStatus::Loading));
        self.next_fetch = Some(self.spawn_fetch(FetchKind::Next, cursor));
        true
    }

    /// Drops everything and starts again from the first page. Deletions seen
    /// so far stay remembered.
    pub fn reload(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Some(fetch) = self.next_fetch.take() {
            fetch.abort();
        }
        if let Some(fetch) = self.gap_fetch.take() {
            fetch.abort();
            self.reconciler.gap_fill_failed();
        }
        self.controller.release_all();
        self.tracker.clear();
        self.flush_playback();
        let dropped = self.store.reset();
        tracing::info!(dropped = dropped.len(), "reloading feed");
        self.notify(SessionUpdate::ItemsChanged {
            revision: self.store.revision(),
        });
        self.load_more()
    }

    /// Starts tracking an on-screen item. Only ids present in the feed can be
    /// registered; registering again updates the region.
    pub fn register_visible(&mut self, id: ItemId, region: Region) -> Result<(), SessionError> {
        self.ensure_open()?;
        let Some(item) = self.store.get(&id) else {
            return Err(SessionError::UnknownItem(id));
        };
        if self.tracker.is_registered(&id) {
            self.tracker.update_region(&id, region);
        } else {
            let media_url = item.media_url.clone();
            self.controller.register(id.clone(), media_url);
            self.tracker.register(id, region);
        }
        self.flush_visibility();
        Ok(())
    }

    pub fn unregister(&mut self, id: &ItemId) -> bool {
        let known = self.controller.unregister(id);
        let tracked = self.tracker.unregister(id);
        self.flush_visibility();
        known || tracked
    }

    pub fn scroll_to(&mut self, offset: f64) {
        self.tracker.scroll_to(offset);
        self.flush_visibility();
    }

    pub fn resize_viewport(&mut self, height: f64) {
        self.tracker.resize(height);
        self.flush_visibility();
    }

    pub fn retry(&mut self, id: &ItemId) -> bool {
        let retried = self.controller.retry(id);
        self.flush_playback();
        retried
    }

    pub fn report_playback_error(&mut self, id: &ItemId, err: MediaError) {
        self.controller.report_playback_error(id, err);
        self.flush_playback();
    }

    /// Removes an item on the user's behalf. A page fetched later will not
    /// bring it back.
    pub fn remove_item(&mut self, id: &ItemId) -> Option<FeedItem> {
        let item = self.store.remove(id)?;
        self.reconciler.forget(&item);
        self.drop_from_view(id);
        self.notify(SessionUpdate::ItemsChanged {
            revision: self.store.revision(),
        });
        Some(item)
    }

    /// True when the Visible item is within `threshold` items of the end of
    /// the loaded feed and more pages exist.
    pub fn near_end(&self, threshold: usize) -> bool {
        if !self.store.has_more() {
            return false;
        }
        let position = self
            .tracker
            .visible()
            .and_then(|id| self.store.position(id));
        match position {
            Some(index) => self.store.len() - 1 - index <= threshold,
            None => self.store.is_empty(),
        }
    }

    /// Applies every pending message without blocking. Returns how many were
    /// handled.
    pub fn pump(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        let mut handled = 0;
        loop {
            let before = handled;
            if let Ok(message) = self.stream_rx.try_recv() {
                self.on_stream(message);
                handled += 1;
            }
            if let Ok(result) = self.page_rx.try_recv() {
                self.on_page(result);
                handled += 1;
            }
            if let Ok(completion) = self.completion_rx.try_recv() {
                self.on_completion(completion);
                handled += 1;
            }
            if handled == before {
                break;
            }
        }
        self.expire_idle();
        handled
    }

    /// Blocks until a message arrives, an unload debounce elapses or
    /// `timeout` passes, then drains whatever is pending.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        if self.closed {
            return 0;
        }
        let now = Instant::now();
        let mut until = now + timeout;
        if let Some(deadline) = self.controller.next_deadline() {
            until = until.min(deadline);
        }
        let budget = until.saturating_duration_since(now);

        let wake = select! {
            recv(self.stream_rx) -> message => message.map_or(Wake::Idle, Wake::Stream),
            recv(self.page_rx) -> result => result.map_or(Wake::Idle, Wake::Page),
            recv(self.completion_rx) -> completion => completion.map_or(Wake::Idle, Wake::Completion),
            default(budget) => Wake::Idle,
        };
        let handled = match wake {
            Wake::Stream(message) => {
                self.on_stream(message);
                1
            }
            Wake::Page(result) => {
                self.on_page(result);
                1
            }
            Wake::Completion(completion) => {
                self.on_completion(completion);
                1
            }
            Wake::Idle => 0,
        };
        handled + self.pump()
    }

    /// Pumps until `done` holds or `timeout` passes.
    pub fn wait_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.closed {
                return false;
            }
            self.wait((deadline - now).min(Duration::from_millis(50)));
        }
    }

    pub fn subscribe(&mut self) -> Receiver<SessionUpdate> {
        let (tx, rx) = unbounded();
        self.listeners.push(tx);
        rx
    }

    pub fn items(&self) -> &[FeedItem] {
        self.store.items()
    }

    pub fn item(&self, id: &ItemId) -> Option<&FeedItem> {
        self.store.get(id)
    }

    pub fn state_of(&self, id: &ItemId) -> PlaybackState {
        self.controller.state_of(id)
    }

    pub fn visibility_of(&self, id: &ItemId) -> VisibilityState {
        self.tracker.state_of(id)
    }

    pub fn playing(&self) -> Option<&ItemId> {
        self.controller.playing()
    }

    pub fn is_failed(&self, id: &ItemId) -> bool {
        self.controller.is_failed(id)
    }

    pub fn last_error(&self, id: &ItemId) -> Option<&MediaError> {
        self.controller.last_error(id)
    }

    pub fn status(&self) -> &LoadStatus {
        self.store.status()
    }

    pub fn has_more(&self) -> bool {
        self.store.has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.next_fetch.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.reconciler.is_stale()
    }

    /// The most recently fetched page as received, for rendering while a
    /// reload is in flight.
    pub fn last_page(&self) -> &[FeedItem] {
        self.store.last_page()
    }

    pub fn visible_ratio(&self, id: &ItemId) -> Option<f64> {
        self.tracker.ratio_of(id)
    }

    /// Initial load failed: the UI shows an error rather than an empty feed.
    pub fn is_blocked(&self) -> bool {
        self.store.is_blocked()
    }

    pub fn resident_media(&self) -> usize {
        self.controller.resident_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Cancels outstanding work, unsubscribes from the stream, releases all
    /// media and stops the media workers. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for fetch in [self.next_fetch.take(), self.gap_fetch.take()]
            .into_iter()
            .flatten()
        {
            fetch.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.controller.release_all();
        self.tracker.clear();
        self.flush_playback();
        // Stops the media workers.
        self.media.take();
        tracing::info!("feed session closed");
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn spawn_fetch(&mut self, kind: FetchKind, cursor: Option<Cursor>) -> InFlightFetch {
        self.fetch_seq += 1;
        let id = self.fetch_seq;
        let cancel = CancelHandle::new();
        let token = cancel.token();
        let source = self.source.clone();
        let policy = self.config.feed.retry.clone();
        let page_size = self.store.page_size();
        let tx = self.page_tx.clone();

        tracing::debug!(fetch = id, ?kind, cursor = ?cursor.as_ref().map(ToString::to_string), "fetching page");
        thread::spawn(move || {
            let result = fetch_with_retry(source.as_ref(), cursor.as_ref(), page_size, &policy, &token);
            if token.is_cancelled() {
                return;
            }
            let _ = tx.send(PageResult {
                fetch: id,
                kind,
                result,
            });
        });
        InFlightFetch { id, cancel }
    }

    fn on_page(&mut self, result: PageResult) {
        let slot = match result.kind {
            FetchKind::Next => &mut self.next_fetch,
            FetchKind::GapFill => &mut self.gap_fetch,
        };
        match slot.take() {
            Some(fetch) if fetch.id == result.fetch => {}
            other => {
                *slot = other;
                tracing::debug!(fetch = result.fetch, "dropping superseded page");
                return;
            }
        }

        match (result.kind, result.result) {
            (FetchKind::Next, Ok(page)) => {
                let reconciler = &self.reconciler;
                let outcome = self.store.append_page(page, |item| reconciler.admit(item));
                tracing::debug!(added = outcome.added, skipped = outcome.skipped, has_more = outcome.has_more, "page merged");
                self.notify(SessionUpdate::ItemsChanged {
                    revision: self.store.revision(),
                });
                self.notify(SessionUpdate::Status(self.store.status().clone()));
            }
            (FetchKind::Next, Err(err)) => {
                tracing::warn!("page fetch failed: {err}");
                self.store.mark_failed(FeedError::from(err));
                self.notify(SessionUpdate::Status(self.store.status().clone()));
            }
            (FetchKind::GapFill, Ok(page)) => {
                let outcome = self.reconciler.merge_snapshot(page, &mut self.store);
                for item in &outcome.removed {
                    self.drop_from_view(&item.id);
                }
                self.notify(SessionUpdate::ItemsChanged {
                    revision: self.store.revision(),
                });
                let stale = self.reconciler.is_stale();
                self.notify(SessionUpdate::Stale(stale));
            }
            (FetchKind::GapFill, Err(err)) => {
                tracing::warn!("gap fill failed: {err}");
                self.reconciler.gap_fill_failed();
                self.store.mark_failed(FeedError::ReconciliationGap);
                self.notify(SessionUpdate::Status(self.store.status().clone()));
            }
        }
    }

    fn on_stream(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Event(raw) => {
                let event = match ChangeEvent::try_from(raw) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!("rejected change event: {err}");
                        return;
                    }
                };
                let id = event.id().clone();
                match self.reconciler.apply(event, &mut self.store) {
                    Applied::Placed(_) | Applied::Patched => {}
                    Applied::Removed(_) => self.drop_from_view(&id),
                    Applied::Recorded | Applied::Stale => return,
                }
                self.notify(SessionUpdate::ItemsChanged {
                    revision: self.store.revision(),
                });
            }
            StreamMessage::Disconnected => {
                let was_stale = self.reconciler.is_stale();
                self.reconciler.on_disconnect();
                if !was_stale {
                    self.notify(SessionUpdate::Stale(true));
                }
            }
            StreamMessage::Reconnected => {
                let was_stale = self.reconciler.is_stale();
                if !self.reconciler.on_reconnect() {
                    return;
                }
                if !was_stale {
                    self.notify(SessionUpdate::Stale(true));
                }
                // Its snapshot may predate the latest outage.
                if let Some(previous) = self.gap_fetch.take() {
                    previous.abort();
                }
                let fetch = self.spawn_fetch(FetchKind::GapFill, None);
                self.gap_fetch = Some(fetch);
            }
        }
    }

    fn on_completion(&mut self, completion: LoadCompletion) {
        self.controller.on_load_complete(completion);
        self.flush_playback();
    }

    fn expire_idle(&mut self) {
        if self.controller.expire_idle(Instant::now()) > 0 {
            self.flush_playback();
        }
    }

    /// Unloads the item's media first, then lets the tracker promote the next
    /// candidate.
    fn drop_from_view(&mut self, id: &ItemId) {
        self.controller.unregister(id);
        self.tracker.unregister(id);
        self.flush_visibility();
    }

    fn flush_visibility(&mut self) {
        for event in self.tracker.drain_events() {
            self.controller.on_visibility(&event.id, event.state);
        }
        self.flush_playback();
    }

    fn flush_playback(&mut self) {
        for change in self.controller.drain_changes() {
            self.notify(SessionUpdate::Playback {
                id: change.id,
                state: change.to,
            });
        }
    }

    fn notify(&mut self, update: SessionUpdate) {
        self.listeners
            .retain(|listener| listener.send(update.clone()).is_ok());
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.close();
    }
}
