use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use crate::config::{self, Config};
use crate::feed::{AuthorRef, FeedItem, ItemId, PlaybackState};
use crate::media::StaticFetcher;
use crate::session::{FeedSession, SessionUpdate};
use crate::source::MemorySource;
use crate::visibility::{Region, Viewport};

const SLOT_HEIGHT: f64 = 640.0;
const STEP_TIMEOUT: Duration = Duration::from_secs(3);
const MEDIA_LATENCY: Duration = Duration::from_millis(15);

const CAPTIONS: [&str; 5] = [
    "Amazing day at the beach!",
    "Concert night with friends!",
    "Morning run along the river",
    "Street food tour, part two",
    "First snow of the year",
];

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub items: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub items: usize,
    pub fetches: usize,
    pub transitions: usize,
    pub played: Vec<ItemId>,
    pub max_playing: usize,
    pub stale: bool,
}

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    let config_path = options.config_file.or_else(config::default_path);
    tracing::info!(config = %friendly_path(config_path.as_ref()), "starting simulated feed");

    let summary = simulate(cfg, options.items.max(1))?;
    println!("reelfeed {}", crate::VERSION);
    println!("  items in feed:      {}", summary.items);
    println!("  page fetches:       {}", summary.fetches);
    println!("  playback changes:   {}", summary.transitions);
    println!("  items played:       {}", summary.played.len());
    println!("  max playing at once: {}", summary.max_playing);
    println!("  stale at exit:      {}", summary.stale);
    Ok(())
}

/// Drives a session over an in-memory backend: scrolls through the feed,
/// applies live inserts and deletes, and drops the change stream once.
pub fn simulate(cfg: Config, count: usize) -> Result<Summary> {
    let source = MemorySource::with_items(sample_items(count));
    let fetcher = Arc::new(StaticFetcher::new(MEDIA_LATENCY));
    let mut session = FeedSession::new(
        Arc::new(source.clone()),
        fetcher,
        cfg,
        Viewport {
            offset: 0.0,
            height: SLOT_HEIGHT,
        },
    );
    let updates = session.subscribe();
    session.start().context("start feed session")?;
    settle(&mut session, "first page")?;

    let mut summary = Summary::default();
    let mut step = 0;
    loop {
        layout(&mut session)?;
        session.scroll_to(step as f64 * SLOT_HEIGHT);
        session.wait_until(STEP_TIMEOUT, |s| {
            s.playing().is_some() || s.items().get(step).map_or(true, |item| s.is_failed(&item.id))
        });
        observe(&session, &mut summary);

        if session.near_end(1) && session.load_more() {
            settle(&mut session, "next page")?;
        }
        step += 1;
        if step >= session.items().len() {
            break;
        }
    }

    // A new clip lands at the head while the viewer is deep in the feed.
    let fresh = clip(count, Utc::now());
    source.insert(fresh);
    session.pump();

    // The clip being watched is deleted by its author.
    if let Some(playing) = session.playing().cloned() {
        source.delete(&playing);
        session.wait_until(STEP_TIMEOUT, |s| s.item(&playing).is_none());
        layout(&mut session)?;
        session.wait_until(STEP_TIMEOUT, |s| s.playing().is_some());
        observe(&session, &mut summary);
    }

    // Changes made while the stream is down only arrive through the gap fill.
    source.disconnect();
    session.pump();
    source.insert(clip(count + 1, Utc::now() + ChronoDuration::seconds(1)));
    source.reconnect();
    if !session.wait_until(STEP_TIMEOUT, |s| !s.is_stale()) {
        bail!("gap fill did not complete");
    }
    layout(&mut session)?;
    session.pump();

    summary.items = session.items().len();
    summary.fetches = source.fetch_count();
    summary.stale = session.is_stale();
    summary.transitions = updates
        .try_iter()
        .filter(|update| matches!(update, SessionUpdate::Playback { .. }))
        .count();
    session.close();
    Ok(summary)
}

fn settle(session: &mut FeedSession, what: &str) -> Result<()> {
    if !session.wait_until(STEP_TIMEOUT, |s| !s.is_loading()) {
        bail!("timed out waiting for {what}");
    }
    if session.is_blocked() {
        bail!("feed failed to load: {:?}", session.status());
    }
    Ok(())
}

fn layout(session: &mut FeedSession) -> Result<()> {
    let ids: Vec<ItemId> = session.items().iter().map(|item| item.id.clone()).collect();
    for (index, id) in ids.into_iter().enumerate() {
        session
            .register_visible(id, Region::new(index as f64 * SLOT_HEIGHT, SLOT_HEIGHT))
            .context("register item")?;
    }
    Ok(())
}

fn observe(session: &FeedSession, summary: &mut Summary) {
    let playing = session
        .items()
        .iter()
        .filter(|item| session.state_of(&item.id) == PlaybackState::Playing)
        .count();
    summary.max_playing = summary.max_playing.max(playing);
    if let Some(id) = session.playing() {
        if !summary.played.contains(id) {
            tracing::info!(item = %id, "now playing");
            summary.played.push(id.clone());
        }
    }
}

fn sample_items(count: usize) -> Vec<FeedItem> {
    let base = Utc
        .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    (0..count)
        .map(|n| clip(n, base - ChronoDuration::minutes(n as i64 * 7)))
        .collect()
}

fn clip(n: usize, created_at: chrono::DateTime<Utc>) -> FeedItem {
    let (username, display_name) = if n % 2 == 0 {
        ("sarah", "Sarah Wilson")
    } else {
        ("qaiss", "")
    };
    FeedItem {
        id: ItemId::new(format!("clip-{n}")),
        media_url: format!(
            "https://storage.reelfeed.test/videos/big_buck_bunny_{}.mp4",
            n % 4
        ),
        author: AuthorRef {
            id: format!("user-{username}"),
            username: username.into(),
            display_name: display_name.into(),
            avatar_url: None,
        },
        created_at,
        caption: Some(CAPTIONS[n % CAPTIONS.len()].into()),
        like_count: (n as u64 * 37) % 500,
        version: 0,
    }
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/reelfeed/config.yaml".to_string()
    }
}
