#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cancel;
pub mod config;
pub mod error;
pub mod feed;
pub mod media;
pub mod playback;
pub mod session;
pub mod source;
pub mod store;
pub mod sync;
pub mod visibility;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
pub use error::{EventError, FeedError, MediaError, SessionError, SourceError};
pub use feed::{AuthorRef, Cursor, FeedItem, ItemId, Page, PlaybackState, VisibilityState};
pub use session::{FeedSession, SessionUpdate};
pub use source::{DataSource, MemorySource};
pub use store::LoadStatus;
pub use visibility::{Region, Viewport};
