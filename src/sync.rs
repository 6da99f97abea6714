//! Merges the live change stream into the [`FeedStore`].
//!
//! Every event carries a version. The reconciler keeps the highest version
//! seen per id (including deletions), so applying a set of events in any
//! arrival order converges on the same store contents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::EventError;
use crate::feed::{FeedItem, ItemId, Page};
use crate::store::{FeedStore, Placement, SnapshotOutcome};

/// Change payload as delivered by the backend, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub item: Option<serde_json::Value>,
    #[serde(default)]
    pub version: Option<u64>,
}

impl RawChangeEvent {
    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        serde_json::from_str(payload).map_err(|err| EventError::Malformed(err.to_string()))
    }

    pub fn insert(item: &FeedItem) -> Self {
        Self::with_item("INSERT", item)
    }

    pub fn update(item: &FeedItem) -> Self {
        Self::with_item("UPDATE", item)
    }

    pub fn delete(id: &ItemId, version: u64) -> Self {
        Self {
            kind: "DELETE".into(),
            id: Some(id.to_string()),
            item: None,
            version: Some(version),
        }
    }

    fn with_item(kind: &str, item: &FeedItem) -> Self {
        Self {
            kind: kind.into(),
            id: Some(item.id.to_string()),
            item: serde_json::to_value(item).ok(),
            version: Some(item.version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert { item: FeedItem, version: u64 },
    Update { item: FeedItem, version: u64 },
    Delete { id: ItemId, version: u64 },
}

impl ChangeEvent {
    pub fn id(&self) -> &ItemId {
        match self {
            ChangeEvent::Insert { item, .. } | ChangeEvent::Update { item, .. } => &item.id,
            ChangeEvent::Delete { id, .. } => id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ChangeEvent::Insert { version, .. }
            | ChangeEvent::Update { version, .. }
            | ChangeEvent::Delete { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = EventError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let kind = raw.kind.trim().to_ascii_lowercase();
        let kind: &'static str = match kind.as_str() {
            "insert" => "insert",
            "update" => "update",
            "delete" => "delete",
            _ => return Err(EventError::UnknownType(raw.kind)),
        };

        let item = match raw.item {
            Some(value) if !value.is_null() => Some(
                serde_json::from_value::<FeedItem>(value)
                    .map_err(|err| EventError::Malformed(err.to_string()))?,
            ),
            _ => None,
        };

        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .map(ItemId::from)
            .or_else(|| item.as_ref().map(|item| item.id.clone()))
            .filter(|id| !id.is_empty())
            .ok_or(EventError::MissingId)?;

        let version = raw
            .version
            .filter(|version| *version > 0)
            .ok_or_else(|| EventError::MissingVersion(id.clone()))?;

        if kind == "delete" {
            return Ok(ChangeEvent::Delete { id, version });
        }

        let mut item = item.ok_or_else(|| EventError::MissingItem {
            kind,
            id: id.clone(),
        })?;
        if item.id != id {
            return Err(EventError::IdMismatch {
                event: id,
                item: item.id,
            });
        }
        validate_media_url(&item)?;
        item.version = version;

        Ok(if kind == "insert" {
            ChangeEvent::Insert { item, version }
        } else {
            ChangeEvent::Update { item, version }
        })
    }
}

fn validate_media_url(item: &FeedItem) -> Result<(), EventError> {
    let invalid = || EventError::InvalidMediaUrl {
        id: item.id.clone(),
        url: item.media_url.clone(),
    };
    let url = Url::parse(item.media_url.trim()).map_err(|_| invalid())?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Placed(Placement),
    Patched,
    Removed(FeedItem),
    /// Newer than anything known but the item is not in the store; only
    /// the ledger changed.
    Recorded,
    /// Not newer than the ledger; ignored.
    Stale,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    version: u64,
    /// `None` is a tombstone.
    item: Option<FeedItem>,
    /// Value of the reconciler's write counter when this entry was written.
    written: u64,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    ledger: HashMap<ItemId, LedgerEntry>,
    writes: u64,
    stale: bool,
    gap_pending: bool,
    /// Write counter at the moment the pending gap fill was requested.
    gap_mark: Option<u64>,
    /// A disconnect was seen since the pending gap fill was requested.
    outage: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn gap_pending(&self) -> bool {
        self.gap_pending
    }

    /// Highest version known for `id`, from the ledger or the stored copy.
    pub fn known_version(&self, id: &ItemId, store: &FeedStore) -> Option<u64> {
        let ledger = self.ledger.get(id).map(|entry| entry.version);
        let stored = store.get(id).map(|item| item.version);
        ledger.max(stored)
    }

    pub fn apply(&mut self, event: ChangeEvent, store: &mut FeedStore) -> Applied {
        let version = event.version();
        if let Some(known) = self.known_version(event.id(), store) {
            if known >= version {
                tracing::debug!(item = %event.id(), version, known, "ignoring stale {} event", event.kind());
                return Applied::Stale;
            }
        }

        match event {
            ChangeEvent::Insert { item, .. } | ChangeEvent::Update { item, .. } => {
                self.record(item.id.clone(), version, Some(item.clone()));
                if store.contains(&item.id) {
                    store.patch(&item);
                    return Applied::Patched;
                }
                match store.place(item) {
                    Placement::OutsideWindow => Applied::Recorded,
                    placement => Applied::Placed(placement),
                }
            }
            ChangeEvent::Delete { id, .. } => {
                let removed = store.remove(&id);
                self.record(id, version, None);
                match removed {
                    Some(item) => Applied::Removed(item),
                    None => Applied::Recorded,
                }
            }
        }
    }

    /// Filters a fetched item through the ledger: tombstoned items are
    /// dropped and newer live copies replace older fetched ones.
    pub fn admit(&self, item: FeedItem) -> Option<FeedItem> {
        match self.ledger.get(&item.id) {
            Some(LedgerEntry {
                version,
                item: None,
                ..
            }) if *version >= item.version => None,
            Some(LedgerEntry {
                version,
                item: Some(newer),
                ..
            }) if *version > item.version => Some(newer.clone()),
            _ => Some(item),
        }
    }

    /// Records an explicit user removal so a late page cannot resurrect it.
    pub fn forget(&mut self, item: &FeedItem) {
        let version = self
            .ledger
            .get(&item.id)
            .map_or(item.version, |entry| entry.version.max(item.version));
        self.record(item.id.clone(), version, None);
    }

    pub fn on_disconnect(&mut self) {
        if !self.stale {
            tracing::warn!("live change stream disconnected; feed marked stale");
        }
        self.stale = true;
        self.outage = true;
    }

    /// Returns true when the caller must start a first-page refetch,
    /// replacing any pending one. A duplicate notice with no disconnect in
    /// between is coalesced into the pending refetch.
    pub fn on_reconnect(&mut self) -> bool {
        self.stale = true;
        if self.gap_pending && !self.outage {
            return false;
        }
        if self.gap_pending {
            tracing::info!("stream dropped again during gap fill; restarting it");
        } else {
            tracing::info!("live change stream reconnected; refetching first page");
        }
        self.outage = false;
        self.gap_pending = true;
        self.gap_mark = Some(self.writes);
        true
    }

    pub fn gap_fill_failed(&mut self) {
        self.gap_pending = false;
        self.gap_mark = None;
    }

    /// Merges a refetched first page as a trusted snapshot of its range.
    /// Items written by live events after the refetch was requested are
    /// newer than the snapshot and survive it. The feed stays stale if the
    /// stream dropped again in the meantime.
    pub fn merge_snapshot(&mut self, page: Page, store: &mut FeedStore) -> SnapshotOutcome {
        let complete = !page.has_more || page.items.len() < store.page_size();
        let floor = if complete {
            None
        } else {
            page.items.last().map(FeedItem::sort_key)
        };
        let items: Vec<FeedItem> = page
            .items
            .into_iter()
            .filter_map(|item| self.admit(item))
            .collect();

        let mark = self.gap_mark.take().unwrap_or(self.writes);
        let ledger = &self.ledger;
        let outcome = store.replace_range(items, floor, !complete, |item| {
            ledger
                .get(&item.id)
                .is_some_and(|entry| entry.item.is_some() && entry.written > mark)
        });
        self.gap_pending = false;
        self.stale = self.outage;
        tracing::info!(
            added = outcome.added,
            removed = outcome.removed.len(),
            stale = self.stale,
            "gap fill merged"
        );
        outcome
    }

    fn record(&mut self, id: ItemId, version: u64, item: Option<FeedItem>) {
        self.writes += 1;
        self.ledger.insert(
            id,
            LedgerEntry {
                version,
                item,
                written: self.writes,
            },
        );
    }
}
