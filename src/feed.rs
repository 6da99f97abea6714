use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const PLACEHOLDER_AVATAR: &str = "/placeholder.svg";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl AuthorRef {
    pub fn display_name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.username
        } else {
            &self.display_name
        }
    }

    pub fn avatar(&self) -> &str {
        self.avatar_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(PLACEHOLDER_AVATAR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: ItemId,
    pub media_url: String,
    #[serde(default)]
    pub author: AuthorRef,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub version: u64,
}

impl FeedItem {
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    /// Copies the mutable fields (caption and metadata) from `other`.
    /// Identity, media and ordering fields never change after creation.
    pub fn apply_patch(&mut self, other: &FeedItem) {
        self.caption = other.caption.clone();
        self.like_count = other.like_count;
        self.version = self.version.max(other.version);
    }
}

/// Feed order key. The feed is sorted by this key descending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub id: ItemId,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Continuation token pointing just past the last item of a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    last_created_at: DateTime<Utc>,
    last_id: ItemId,
}

impl Cursor {
    pub fn after(item: &FeedItem) -> Self {
        Self {
            last_created_at: item.created_at,
            last_id: item.id.clone(),
        }
    }

    pub fn after_key(key: &SortKey) -> Self {
        Self {
            last_created_at: key.created_at,
            last_id: key.id.clone(),
        }
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.last_created_at,
            id: self.last_id.clone(),
        }
    }

    /// True when `key` lies strictly beyond this cursor, i.e. on a later page.
    pub fn admits(&self, key: &SortKey) -> bool {
        *key < self.sort_key()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09}:{}",
            self.last_created_at.timestamp(),
            self.last_created_at.timestamp_subsec_nanos(),
            self.last_id
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid cursor token {0:?}")]
pub struct CursorParseError(String);

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CursorParseError(s.to_string());
        let (time, id) = s.split_once(':').ok_or_else(invalid)?;
        let (secs, nanos) = time.split_once('.').ok_or_else(invalid)?;
        if nanos.len() != 9 {
            return Err(invalid());
        }
        let secs: i64 = secs.parse().map_err(|_| invalid())?;
        let nanos: u32 = nanos.parse().map_err(|_| invalid())?;
        let created_at = Utc.timestamp_opt(secs, nanos).single().ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            last_created_at: created_at,
            last_id: ItemId::from(id),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityState {
    #[default]
    Hidden,
    Entering,
    Visible,
    Leaving,
}

impl VisibilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityState::Hidden => "hidden",
            VisibilityState::Entering => "entering",
            VisibilityState::Visible => "visible",
            VisibilityState::Leaving => "leaving",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Playing,
    Paused,
    Error,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Unloaded => "unloaded",
            PlaybackState::Loading => "loading",
            PlaybackState::Ready => "ready",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Error => "error",
        }
    }

    pub fn holds_resource(&self) -> bool {
        matches!(
            self,
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
