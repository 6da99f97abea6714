//! Ordered, deduplicated feed contents plus pagination state.
//!
//! Items are kept sorted by [`SortKey`] descending with no duplicate ids.
//! Every mutating method preserves that ordering.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::{FeedError, SourceError};
use crate::feed::{Cursor, FeedItem, ItemId, Page, SortKey};
use crate::source::DataSource;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    /// Pagination reached the end of the feed. Terminal, not an error.
    Exhausted,
    Failed(FeedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Prepended,
    Inserted(usize),
    /// Older than the fetched window; pagination will pick it up.
    OutsideWindow,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub added: usize,
    pub skipped: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotOutcome {
    pub added: usize,
    pub removed: Vec<FeedItem>,
}

pub struct FeedStore {
    items: Vec<FeedItem>,
    ids: HashSet<ItemId>,
    page_size: usize,
    cursor: Option<Cursor>,
    has_more: bool,
    pages: usize,
    status: LoadStatus,
    revision: u64,
    last_page: Vec<FeedItem>,
}

impl FeedStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
            page_size: page_size.max(1),
            cursor: None,
            has_more: true,
            pages: 0,
            status: LoadStatus::Idle,
            revision: 0,
            last_page: Vec::new(),
        }
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&FeedItem> {
        self.position(id).map(|index| &self.items[index])
    }

    pub fn position(&self, id: &ItemId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.items.iter().position(|item| &item.id == id)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Items of the most recently fetched page, as received.
    pub fn last_page(&self) -> &[FeedItem] {
        &self.last_page
    }

    /// A failed load before any page arrived. Distinct from an empty feed.
    pub fn is_blocked(&self) -> bool {
        matches!(self.status, LoadStatus::Failed(_)) && self.pages == 0
    }

    /// Lowest sort key covered by fetched pages, or `None` when the whole
    /// feed is in range (nothing fetched yet, or pagination exhausted).
    pub fn window_floor(&self) -> Option<SortKey> {
        if !self.has_more {
            return None;
        }
        self.cursor.as_ref().map(Cursor::sort_key)
    }

    pub fn begin_load(&mut self) {
        self.status = LoadStatus::Loading;
    }

    pub fn mark_failed(&mut self, err: FeedError) {
        self.status = LoadStatus::Failed(err);
        self.revision += 1;
    }

    /// Merges a fetched page. Items already present, or rejected by `admit`,
    /// are dropped.
    pub fn append_page(
        &mut self,
        page: Page,
        mut admit: impl FnMut(FeedItem) -> Option<FeedItem>,
    ) -> AppendOutcome {
        let received = page.items.len();
        let last = page.items.last().map(Cursor::after);
        self.last_page = page.items.clone();

        let mut outcome = AppendOutcome::default();
        for item in page.items {
            match admit(item) {
                Some(item) if !self.ids.contains(&item.id) => {
                    self.insert_sorted(item);
                    outcome.added += 1;
                }
                _ => outcome.skipped += 1,
            }
        }

        if let Some(next) = page.next_cursor.or(last) {
            self.advance_cursor(next);
        }
        self.has_more = page.has_more && received >= self.page_size;
        self.pages += 1;
        self.status = if self.has_more {
            LoadStatus::Loaded
        } else {
            LoadStatus::Exhausted
        };
        self.revision += 1;
        outcome.has_more = self.has_more;
        outcome
    }

    /// Places a live insert: prepended when newer than the head, at its
    /// sorted position inside the fetched window, ignored below it.
    pub fn place(&mut self, item: FeedItem) -> Placement {
        if self.ids.contains(&item.id) {
            return Placement::AlreadyPresent;
        }
        let key = item.sort_key();
        if let Some(floor) = self.window_floor() {
            if key < floor {
                return Placement::OutsideWindow;
            }
        }
        let at_head = self
            .items
            .first()
            .map_or(true, |head| key > head.sort_key());
        let index = self.insert_sorted(item);
        self.revision += 1;
        if at_head {
            Placement::Prepended
        } else {
            Placement::Inserted(index)
        }
    }

    /// Applies caption/metadata from `item` in place when it is not older
    /// than the stored copy. Never moves the item.
    pub fn patch(&mut self, item: &FeedItem) -> bool {
        let Some(index) = self.position(&item.id) else {
            return false;
        };
        let stored = &mut self.items[index];
        if item.version < stored.version {
            return false;
        }
        stored.apply_patch(item);
        self.revision += 1;
        true
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<FeedItem> {
        let index = self.position(id)?;
        self.ids.remove(id);
        self.revision += 1;
        Some(self.items.remove(index))
    }

    /// Treats `snapshot` as the authoritative contents of the sort-key range
    /// from the head down to `floor` (the whole feed when `floor` is `None`).
    /// In-range items missing from the snapshot are removed unless `retain`
    /// vouches for them, e.g. because they arrived after it was taken.
    pub fn replace_range(
        &mut self,
        snapshot: Vec<FeedItem>,
        floor: Option<SortKey>,
        has_more: bool,
        retain: impl Fn(&FeedItem) -> bool,
    ) -> SnapshotOutcome {
        let keep: HashSet<ItemId> = snapshot.iter().map(|item| item.id.clone()).collect();
        let in_range = |item: &FeedItem| floor.as_ref().map_or(true, |floor| item.sort_key() >= *floor);

        let mut outcome = SnapshotOutcome::default();
        let mut retained = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if in_range(&item) && !keep.contains(&item.id) && !retain(&item) {
                self.ids.remove(&item.id);
                outcome.removed.push(item);
            } else {
                retained.push(item);
            }
        }
        self.items = retained;

        for item in snapshot {
            if self.ids.contains(&item.id) {
                self.patch(&item);
            } else {
                self.insert_sorted(item);
                outcome.added += 1;
            }
        }

        match floor {
            None => {
                self.has_more = has_more;
                if let Some(last) = self.items.last() {
                    self.cursor = Some(Cursor::after(last));
                }
            }
            Some(floor) => {
                let behind = self
                    .cursor
                    .as_ref()
                    .map_or(true, |cursor| floor < cursor.sort_key());
                if behind {
                    self.cursor = Some(Cursor::after_key(&floor));
                    self.has_more = has_more;
                }
            }
        }
        self.pages = self.pages.max(1);
        self.status = if self.has_more {
            LoadStatus::Loaded
        } else {
            LoadStatus::Exhausted
        };
        self.revision += 1;
        outcome
    }

    /// Drops all contents and pagination state, returning the removed items.
    pub fn reset(&mut self) -> Vec<FeedItem> {
        self.ids.clear();
        self.cursor = None;
        self.has_more = true;
        self.pages = 0;
        self.status = LoadStatus::Idle;
        self.last_page.clear();
        self.revision += 1;
        std::mem::take(&mut self.items)
    }

    /// True when ordering and uniqueness hold.
    pub fn check_invariants(&self) -> bool {
        let strictly_descending = self
            .items
            .windows(2)
            .all(|pair| pair[0].sort_key() > pair[1].sort_key());
        let unique = self.ids.len() == self.items.len()
            && self.items.iter().all(|item| self.ids.contains(&item.id));
        strictly_descending && unique
    }

    fn insert_sorted(&mut self, item: FeedItem) -> usize {
        let key = item.sort_key();
        let index = self.items.partition_point(|existing| existing.sort_key() > key);
        self.ids.insert(item.id.clone());
        self.items.insert(index, item);
        index
    }

    fn advance_cursor(&mut self, next: Cursor) {
        let forward = self
            .cursor
            .as_ref()
            .map_or(true, |current| next.sort_key() < current.sort_key());
        if forward {
            self.cursor = Some(next);
        }
    }
}

/// Fetches one page, retrying transient failures with exponential backoff
/// and jitter. Stops early when `cancel` fires.
pub fn fetch_with_retry(
    source: &dyn DataSource,
    cursor: Option<&Cursor>,
    page_size: usize,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<Page, SourceError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(SourceError::Network("fetch cancelled".into()));
        }
        match source.fetch_page(cursor, page_size, cancel) {
            Ok(page) => return Ok(page),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = with_jitter(policy.delay_for(attempt));
                tracing::warn!(attempt = attempt + 1, ?delay, "page fetch failed, retrying: {err}");
                attempt += 1;
                if !cancel.sleep(delay) {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::cancel::CancelHandle;
    use crate::feed::fixtures::item;
    use crate::source::MemorySource;

    fn admit_all(item: FeedItem) -> Option<FeedItem> {
        Some(item)
    }

    fn ids(store: &FeedStore) -> Vec<String> {
        store
            .items()
            .iter()
            .map(|item| item.id.to_string())
            .collect()
    }

    #[test]
    fn four_pages_of_three_cover_ten_items_once() {
        let source = MemorySource::with_items((0..10).map(|n| item(&format!("v{n}"), n)));
        let cancel = CancelHandle::new();
        let mut store = FeedStore::new(3);
        let mut sizes = Vec::new();
        let mut last_has_more = true;
        for _ in 0..4 {
            let page = source.fetch_page(store.cursor(), store.page_size(), &cancel.token()).unwrap();
            sizes.push(page.items.len());
            last_has_more = store.append_page(page, admit_all).has_more;
        }
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert!(!last_has_more);
        assert_eq!(store.status(), &LoadStatus::Exhausted);
        let expected: Vec<String> = (0..10).rev().map(|n| format!("v{n}")).collect();
        assert_eq!(ids(&store), expected);
        assert!(store.check_invariants());
    }

    #[test]
    fn append_is_idempotent() {
        let mut store = FeedStore::new(3);
        let page = Page {
            items: vec![item("c", 3), item("b", 2), item("a", 1)],
            next_cursor: None,
            has_more: true,
        };
        assert_eq!(store.append_page(page.clone(), admit_all).added, 3);
        let again = store.append_page(page, admit_all);
        assert_eq!(again.added, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn short_page_ends_pagination() {
        let mut store = FeedStore::new(3);
        let page = Page {
            items: vec![item("b", 2), item("a", 1)],
            next_cursor: None,
            has_more: true,
        };
        assert!(!store.append_page(page, admit_all).has_more);
        assert_eq!(store.window_floor(), None);
    }

    #[test]
    fn live_inserts_respect_the_window() {
        let mut store = FeedStore::new(3);
        store.append_page(
            Page {
                items: vec![item("e", 50), item("d", 40), item("c", 30)],
                next_cursor: None,
                has_more: true,
            },
            admit_all,
        );
        assert_eq!(store.place(item("f", 60)), Placement::Prepended);
        assert_eq!(store.place(item("x", 45)), Placement::Inserted(2));
        assert_eq!(store.place(item("old", 10)), Placement::OutsideWindow);
        assert_eq!(store.place(item("d", 40)), Placement::AlreadyPresent);
        assert_eq!(ids(&store), vec!["f", "e", "x", "d", "c"]);

        // The ignored item arrives with the next page.
        let next = Page {
            items: vec![item("old", 10)],
            next_cursor: None,
            has_more: false,
        };
        store.append_page(next, admit_all);
        assert_eq!(ids(&store).last().map(String::as_str), Some("old"));
        assert!(store.check_invariants());
    }

    #[test]
    fn patch_never_reorders_or_regresses() {
        let mut store = FeedStore::new(3);
        store.place(item("b", 2));
        store.place(item("a", 1));
        let mut newer = item("a", 1);
        newer.caption = Some("Amazing day at the beach!".into());
        newer.version = 5;
        assert!(store.patch(&newer));
        let mut older = item("a", 1);
        older.caption = Some("stale".into());
        older.version = 2;
        assert!(!store.patch(&older));
        assert_eq!(
            store.get(&ItemId::from("a")).unwrap().caption.as_deref(),
            Some("Amazing day at the beach!")
        );
        assert_eq!(ids(&store), vec!["b", "a"]);
    }

    #[test]
    fn snapshot_replaces_its_range_only() {
        let mut store = FeedStore::new(3);
        store.append_page(
            Page {
                items: vec![item("e", 50), item("d", 40), item("c", 30)],
                next_cursor: None,
                has_more: true,
            },
            admit_all,
        );
        store.append_page(
            Page {
                items: vec![item("b", 20), item("a", 10), item("z", 5)],
                next_cursor: None,
                has_more: true,
            },
            admit_all,
        );
        // "d" was deleted and "g" created while the stream was down.
        let snapshot = vec![item("g", 60), item("e", 50), item("c", 30)];
        let floor = snapshot.last().map(FeedItem::sort_key);
        let outcome = store.replace_range(snapshot, floor, true, |_| false);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].id, ItemId::from("d"));
        assert_eq!(ids(&store), vec!["g", "e", "c", "b", "a", "z"]);
        assert_eq!(store.cursor().map(Cursor::sort_key), Some(item("z", 5).sort_key()));
        assert!(store.check_invariants());
    }

    #[test]
    fn snapshot_spares_vouched_items() {
        let mut store = FeedStore::new(3);
        store.append_page(
            Page {
                items: vec![item("c", 30), item("b", 20), item("a", 10)],
                next_cursor: None,
                has_more: true,
            },
            admit_all,
        );
        store.place(item("live", 40));
        let snapshot = vec![item("c", 30), item("a", 10)];
        let floor = snapshot.last().map(FeedItem::sort_key);
        let outcome = store.replace_range(snapshot, floor, true, |item| item.id.as_str() == "live");
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].id, ItemId::from("b"));
        assert_eq!(ids(&store), vec!["live", "c", "a"]);
    }

    #[test]
    fn interleaved_mutations_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let source = MemorySource::with_items((0..30).map(|n| item(&format!("p{n}"), n * 10)));
        let cancel = CancelHandle::new();
        let mut store = FeedStore::new(4);
        for step in 0..300 {
            match rng.gen_range(0..4) {
                0 => {
                    if store.has_more() {
                        let page = source.fetch_page(store.cursor(), store.page_size(), &cancel.token()).unwrap();
                        store.append_page(page, admit_all);
                    }
                }
                1 => {
                    let n = rng.gen_range(0..30);
                    store.place(item(&format!("p{n}"), n * 10));
                }
                2 => {
                    let n = rng.gen_range(0..30);
                    store.remove(&ItemId::from(format!("p{n}")));
                }
                _ => {
                    let secs = rng.gen_range(0..400);
                    store.place(item(&format!("live{step}"), secs));
                }
            }
            assert!(store.check_invariants(), "step {step}");
        }
    }

    #[test]
    fn blocked_only_before_first_page() {
        let mut store = FeedStore::new(3);
        store.mark_failed(FeedError::TransientNetwork("offline".into()));
        assert!(store.is_blocked());
        assert!(store.is_empty());

        let mut loaded = FeedStore::new(3);
        loaded.append_page(
            Page {
                items: vec![item("a", 1)],
                next_cursor: None,
                has_more: false,
            },
            admit_all,
        );
        loaded.mark_failed(FeedError::TransientNetwork("offline".into()));
        assert!(!loaded.is_blocked());
    }

    #[test]
    fn retry_recovers_from_transient_errors() {
        let source = MemorySource::with_items([item("a", 1)]);
        source.fail_next(SourceError::Network("reset".into()));
        source.fail_next(SourceError::Server {
            status: 503,
            message: "busy".into(),
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let cancel = CancelHandle::new();
        let page = fetch_with_retry(&source, None, 3, &policy, &cancel.token()).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(source.fetch_count(), 3);
    }

    #[test]
    fn auth_errors_are_not_retried() {
        let source = MemorySource::with_items([item("a", 1)]);
        source.fail_next(SourceError::NotAuthenticated);
        let cancel = CancelHandle::new();
        let err = fetch_with_retry(&source, None, 3, &RetryPolicy::default(), &cancel.token())
            .unwrap_err();
        assert_eq!(err, SourceError::NotAuthenticated);
        assert_eq!(source.fetch_count(), 1);
    }
}
