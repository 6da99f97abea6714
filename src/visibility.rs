//! Viewport intersection tracking for registered feed items.
//!
//! The tracker works in content coordinates: each item registers the vertical
//! span it occupies in the scrollable list and the viewport is a window of
//! `height` starting at `offset`. Every mutation re-evaluates all regions and
//! queues [`VisibilityEvent`]s in emission order.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use crate::config::VisibilityConfig;
use crate::feed::{ItemId, VisibilityState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub top: f64,
    pub height: f64,
}

impl Region {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    fn bottom(&self) -> f64 {
        self.top + self.height
    }

    fn center(&self) -> f64 {
        self.top + self.height / 2.0
    }

    fn overlap(&self, start: f64, end: f64) -> f64 {
        (self.bottom().min(end) - self.top.max(start)).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub offset: f64,
    pub height: f64,
}

impl Viewport {
    fn center(&self) -> f64 {
        self.offset + self.height / 2.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityEvent {
    pub id: ItemId,
    pub ratio: f64,
    pub is_intersecting: bool,
    pub state: VisibilityState,
}

#[derive(Debug, Clone)]
struct Tracked {
    region: Region,
    ratio: f64,
    intersecting: bool,
    state: VisibilityState,
    bucket: usize,
}

pub struct VisibilityTracker {
    config: VisibilityConfig,
    viewport: Viewport,
    tracked: HashMap<ItemId, Tracked>,
    selected: Option<ItemId>,
    queue: VecDeque<VisibilityEvent>,
}

impl VisibilityTracker {
    pub fn new(config: VisibilityConfig, viewport: Viewport) -> Self {
        Self {
            config,
            viewport,
            tracked: HashMap::new(),
            selected: None,
            queue: VecDeque::new(),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn register(&mut self, id: ItemId, region: Region) {
        self.tracked.insert(
            id,
            Tracked {
                region,
                ratio: 0.0,
                intersecting: false,
                state: VisibilityState::Hidden,
                bucket: 0,
            },
        );
        self.evaluate();
    }

    /// Removes `id` and re-evaluates immediately, so unregistering the
    /// Visible item promotes the next candidate in the same call.
    pub fn unregister(&mut self, id: &ItemId) -> bool {
        let removed = self.tracked.remove(id).is_some();
        if removed {
            if self.selected.as_ref() == Some(id) {
                self.selected = None;
            }
            self.queue.retain(|event| &event.id != id);
            self.evaluate();
        }
        removed
    }

    pub fn update_region(&mut self, id: &ItemId, region: Region) -> bool {
        match self.tracked.get_mut(id) {
            Some(tracked) => {
                tracked.region = region;
                self.evaluate();
                true
            }
            None => false,
        }
    }

    pub fn scroll_to(&mut self, offset: f64) {
        self.viewport.offset = offset;
        self.evaluate();
    }

    pub fn resize(&mut self, height: f64) {
        self.viewport.height = height.max(0.0);
        self.evaluate();
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
        self.selected = None;
        self.queue.clear();
    }

    pub fn state_of(&self, id: &ItemId) -> VisibilityState {
        self.tracked
            .get(id)
            .map(|tracked| tracked.state)
            .unwrap_or_default()
    }

    pub fn ratio_of(&self, id: &ItemId) -> Option<f64> {
        self.tracked.get(id).map(|tracked| tracked.ratio)
    }

    pub fn visible(&self) -> Option<&ItemId> {
        self.selected.as_ref()
    }

    pub fn is_registered(&self, id: &ItemId) -> bool {
        self.tracked.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn drain_events(&mut self) -> Vec<VisibilityEvent> {
        self.queue.drain(..).collect()
    }

    fn evaluate(&mut self) {
        let view_start = self.viewport.offset;
        let view_end = self.viewport.offset + self.viewport.height;
        let margin = self.viewport.height * self.config.preload_margin;

        for tracked in self.tracked.values_mut() {
            let region = tracked.region;
            tracked.ratio = if region.height > 0.0 {
                (region.overlap(view_start, view_end) / region.height).clamp(0.0, 1.0)
            } else {
                0.0
            };
            tracked.intersecting = region.bottom() > view_start - margin
                && region.top < view_end + margin
                && region.height > 0.0;
        }

        let winner = self.pick_candidate();

        let mut ordered: Vec<ItemId> = self.tracked.keys().cloned().collect();
        ordered.sort_by(|a, b| {
            let ra = self.tracked[a].region.top;
            let rb = self.tracked[b].region.top;
            ra.total_cmp(&rb).then_with(|| a.cmp(b))
        });

        let mut demotions = Vec::new();
        let mut promotion = None;
        for id in ordered {
            let is_winner = winner.as_ref() == Some(&id);
            let bucket = self.bucket_for(self.tracked[&id].ratio);
            let Some(tracked) = self.tracked.get_mut(&id) else {
                continue;
            };
            let next = if is_winner {
                VisibilityState::Visible
            } else if matches!(
                tracked.state,
                VisibilityState::Visible | VisibilityState::Leaving
            ) && tracked.ratio > 0.0
            {
                VisibilityState::Leaving
            } else if tracked.intersecting {
                VisibilityState::Entering
            } else {
                VisibilityState::Hidden
            };

            let changed = next != tracked.state || bucket != tracked.bucket;
            tracked.state = next;
            tracked.bucket = bucket;
            if !changed {
                continue;
            }
            let event = VisibilityEvent {
                id,
                ratio: tracked.ratio,
                is_intersecting: tracked.intersecting,
                state: next,
            };
            if is_winner {
                promotion = Some(event);
            } else {
                demotions.push(event);
            }
        }

        self.queue.extend(demotions);
        self.queue.extend(promotion);
        self.selected = winner;
    }

    fn pick_candidate(&self) -> Option<ItemId> {
        let view_center = self.viewport.center();
        self.tracked
            .iter()
            .filter(|(_, tracked)| {
                tracked.ratio > 0.0 && tracked.ratio >= self.config.visible_ratio
            })
            .min_by(|(a_id, a), (b_id, b)| {
                b.ratio
                    .total_cmp(&a.ratio)
                    .then_with(|| {
                        let da = (a.region.center() - view_center).abs();
                        let db = (b.region.center() - view_center).abs();
                        da.total_cmp(&db)
                    })
                    .then_with(|| a.region.top.total_cmp(&b.region.top))
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| id.clone())
    }

    fn bucket_for(&self, ratio: f64) -> usize {
        self.config
            .thresholds
            .iter()
            .filter(|threshold| match ratio.partial_cmp(threshold) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => **threshold > 0.0,
                _ => false,
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> VisibilityTracker {
        VisibilityTracker::new(
            VisibilityConfig::default(),
            Viewport {
                offset: 0.0,
                height: 100.0,
            },
        )
    }

    fn id(value: &str) -> ItemId {
        ItemId::from(value)
    }

    fn register_column(tracker: &mut VisibilityTracker, count: usize) {
        for index in 0..count {
            tracker.register(
                id(&format!("v{index}")),
                Region::new(index as f64 * 100.0, 100.0),
            );
        }
    }

    #[test]
    fn first_item_becomes_visible() {
        let mut tracker = tracker();
        register_column(&mut tracker, 3);
        assert_eq!(tracker.visible(), Some(&id("v0")));
        assert_eq!(tracker.state_of(&id("v0")), VisibilityState::Visible);
        // Within the 25% preload margin below the viewport.
        assert_eq!(tracker.state_of(&id("v1")), VisibilityState::Entering);
        assert_eq!(tracker.state_of(&id("v2")), VisibilityState::Hidden);
    }

    #[test]
    fn higher_ratio_wins_between_two_candidates() {
        let mut tracker = tracker();
        register_column(&mut tracker, 3);
        tracker.drain_events();

        tracker.scroll_to(60.0);
        let events = tracker.drain_events();
        let visible: Vec<_> = events
            .iter()
            .filter(|event| event.state == VisibilityState::Visible)
            .collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, id("v1"));
        assert_eq!(tracker.state_of(&id("v0")), VisibilityState::Leaving);
    }

    #[test]
    fn ratio_tie_breaks_on_center_distance() {
        let mut tracker = VisibilityTracker::new(
            VisibilityConfig::default(),
            Viewport {
                offset: 0.0,
                height: 200.0,
            },
        );
        // Both fully visible; "b" sits closer to the viewport center.
        tracker.register(id("a"), Region::new(0.0, 60.0));
        tracker.register(id("b"), Region::new(80.0, 60.0));
        assert_eq!(tracker.visible(), Some(&id("b")));
    }

    #[test]
    fn demotion_is_emitted_before_promotion() {
        let mut tracker = tracker();
        register_column(&mut tracker, 3);
        tracker.drain_events();

        tracker.scroll_to(100.0);
        let events = tracker.drain_events();
        let leave = events
            .iter()
            .position(|event| event.id == id("v0"))
            .unwrap();
        let enter = events
            .iter()
            .position(|event| event.id == id("v1") && event.state == VisibilityState::Visible)
            .unwrap();
        assert!(leave < enter);
    }

    #[test]
    fn never_reports_two_visible_items() {
        let mut tracker = tracker();
        register_column(&mut tracker, 6);
        let mut offset = 0.0;
        while offset <= 500.0 {
            tracker.scroll_to(offset);
            let visible = tracker
                .tracked
                .values()
                .filter(|tracked| tracked.state == VisibilityState::Visible)
                .count();
            assert!(visible <= 1, "offset {offset}");
            offset += 7.5;
        }
    }

    #[test]
    fn unregistering_visible_promotes_next_candidate() {
        let mut tracker = tracker();
        tracker.register(id("a"), Region::new(0.0, 100.0));
        tracker.register(id("b"), Region::new(40.0, 100.0));
        assert_eq!(tracker.visible(), Some(&id("a")));
        tracker.drain_events();

        assert!(tracker.unregister(&id("a")));
        assert_eq!(tracker.visible(), Some(&id("b")));
        let events = tracker.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, VisibilityState::Visible);
    }

    #[test]
    fn hidden_after_scrolling_past_margin() {
        let mut tracker = tracker();
        register_column(&mut tracker, 4);
        tracker.scroll_to(300.0);
        assert_eq!(tracker.state_of(&id("v0")), VisibilityState::Hidden);
        assert_eq!(tracker.state_of(&id("v3")), VisibilityState::Visible);
    }

    #[test]
    fn threshold_crossings_emit_without_state_change() {
        let mut tracker = tracker();
        register_column(&mut tracker, 2);
        tracker.drain_events();
        tracker.scroll_to(10.0);
        let events = tracker.drain_events();
        // v1 crosses the 0.0 threshold while staying Entering.
        assert!(events
            .iter()
            .any(|event| event.id == id("v1") && event.state == VisibilityState::Entering));
        tracker.scroll_to(12.0);
        assert!(tracker.drain_events().is_empty());
    }
}
