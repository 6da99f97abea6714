use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::SourceError;
use crate::feed::{Cursor, FeedItem, ItemId, Page, SortKey};
use crate::sync::RawChangeEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(RawChangeEvent),
    Disconnected,
    Reconnected,
}

pub type ChangeSink = Box<dyn Fn(StreamMessage) + Send + Sync>;

/// Backend the feed reads from: paginated queries plus a live change stream.
pub trait DataSource: Send + Sync {
    /// Runs on a background thread. Long requests should give up once
    /// `cancel` fires; the session no longer waits for them.
    fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        page_size: usize,
        cancel: &CancelToken,
    ) -> Result<Page, SourceError>;

    fn subscribe(&self, resource: &str, sink: ChangeSink) -> Result<Subscription, SourceError>;
}

/// Live-stream registration. Unsubscribes when dropped.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<SortKey, FeedItem>,
    keys: HashMap<ItemId, SortKey>,
    next_version: u64,
    subscribers: HashMap<u64, Arc<ChangeSink>>,
    next_subscriber: u64,
    connected: bool,
    failures: VecDeque<SourceError>,
    fetches: usize,
}

impl MemoryState {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn sinks(&self) -> Vec<Arc<ChangeSink>> {
        if !self.connected {
            return Vec::new();
        }
        self.subscribers.values().cloned().collect()
    }
}

/// In-memory data source. Mutations made while the stream is disconnected
/// are not delivered, which is how a real backend loses events.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        let source = Self::default();
        source.state.lock().connected = true;
        source
    }

    pub fn with_items(items: impl IntoIterator<Item = FeedItem>) -> Self {
        let source = Self::new();
        {
            let mut state = source.state.lock();
            for mut item in items {
                let version = state.bump_version();
                item.version = version;
                let key = item.sort_key();
                state.keys.insert(item.id.clone(), key.clone());
                state.rows.insert(key, item);
            }
        }
        source
    }

    pub fn insert(&self, mut item: FeedItem) -> u64 {
        let (version, event, sinks) = {
            let mut state = self.state.lock();
            let version = state.bump_version();
            item.version = version;
            if let Some(previous) = state.keys.remove(&item.id) {
                state.rows.remove(&previous);
            }
            let key = item.sort_key();
            state.keys.insert(item.id.clone(), key.clone());
            state.rows.insert(key, item.clone());
            (version, RawChangeEvent::insert(&item), state.sinks())
        };
        deliver(&sinks, StreamMessage::Event(event));
        version
    }

    pub fn update(&self, id: &ItemId, patch: impl FnOnce(&mut FeedItem)) -> Option<u64> {
        let (version, event, sinks) = {
            let mut state = self.state.lock();
            let key = state.keys.get(id)?.clone();
            let version = state.bump_version();
            let row = state.rows.get_mut(&key)?;
            patch(row);
            row.version = version;
            let event = RawChangeEvent::update(row);
            (version, event, state.sinks())
        };
        deliver(&sinks, StreamMessage::Event(event));
        Some(version)
    }

    pub fn delete(&self, id: &ItemId) -> Option<u64> {
        let (version, event, sinks) = {
            let mut state = self.state.lock();
            let key = state.keys.remove(id)?;
            state.rows.remove(&key);
            let version = state.bump_version();
            (version, RawChangeEvent::delete(id, version), state.sinks())
        };
        deliver(&sinks, StreamMessage::Event(event));
        Some(version)
    }

    /// Pushes an arbitrary message to subscribers, e.g. to replay events out
    /// of order.
    pub fn emit(&self, message: StreamMessage) {
        let sinks = self.state.lock().sinks();
        deliver(&sinks, message);
    }

    pub fn disconnect(&self) {
        let sinks = {
            let mut state = self.state.lock();
            let sinks = state.sinks();
            state.connected = false;
            sinks
        };
        deliver(&sinks, StreamMessage::Disconnected);
    }

    pub fn reconnect(&self) {
        let sinks = {
            let mut state = self.state.lock();
            state.connected = true;
            state.sinks()
        };
        deliver(&sinks, StreamMessage::Reconnected);
    }

    pub fn fail_next(&self, err: SourceError) {
        self.state.lock().failures.push_back(err);
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }
}

impl DataSource for MemorySource {
    fn fetch_page(
        &self,
        cursor: Option<&Cursor>,
        page_size: usize,
        cancel: &CancelToken,
    ) -> Result<Page, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Network("fetch cancelled".into()));
        }
        let mut state = self.state.lock();
        state.fetches += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let items: Vec<FeedItem> = state
            .rows
            .iter()
            .rev()
            .filter(|(key, _)| cursor.map_or(true, |cursor| cursor.admits(key)))
            .take(page_size)
            .map(|(_, item)| item.clone())
            .collect();
        Ok(Page {
            next_cursor: items.last().map(Cursor::after),
            has_more: page_size > 0 && items.len() == page_size,
            items,
        })
    }

    fn subscribe(&self, resource: &str, sink: ChangeSink) -> Result<Subscription, SourceError> {
        let id = {
            let mut state = self.state.lock();
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            state.subscribers.insert(id, Arc::new(sink));
            id
        };
        tracing::debug!(resource, subscriber = id, "memory source subscription opened");
        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().subscribers.remove(&id);
            }
        }))
    }
}

fn deliver(sinks: &[Arc<ChangeSink>], message: StreamMessage) {
    for sink in sinks {
        let sink: &ChangeSink = sink;
        sink(message.clone());
    }
}
