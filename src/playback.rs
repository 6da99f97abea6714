//! Per-item playback state machine.
//!
//! The controller consumes visibility signals in the order the tracker emits
//! them and owns every acquired [`MediaResource`]. Resources are released when
//! a slot reaches `Unloaded` or `Error`. At most one slot is `Playing`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancelHandle;
use crate::config::PlaybackConfig;
use crate::error::MediaError;
use crate::feed::{ItemId, PlaybackState, VisibilityState};
use crate::media::{LoadCompletion, LoadRequest, MediaLoader, MediaResource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackChange {
    pub id: ItemId,
    pub from: PlaybackState,
    pub to: PlaybackState,
}

struct InFlightLoad {
    ticket: u64,
    cancel: CancelHandle,
}

struct Slot {
    media_url: String,
    state: PlaybackState,
    visibility: VisibilityState,
    resource: Option<MediaResource>,
    load: Option<InFlightLoad>,
    failures: u8,
    last_error: Option<MediaError>,
    paused_at: Option<Instant>,
}

impl Slot {
    fn new(media_url: String, state: PlaybackState) -> Self {
        Self {
            media_url,
            state,
            visibility: VisibilityState::Hidden,
            resource: None,
            load: None,
            failures: 0,
            last_error: None,
            paused_at: None,
        }
    }
}

pub struct PlaybackController {
    config: PlaybackConfig,
    loader: Arc<dyn MediaLoader>,
    slots: HashMap<ItemId, Slot>,
    /// Items that exhausted their automatic retries. Outlives the slot so a
    /// re-registered item stays failed until [`PlaybackController::retry`].
    failed: HashSet<ItemId>,
    playing: Option<ItemId>,
    next_ticket: u64,
    changes: VecDeque<PlaybackChange>,
}

impl PlaybackController {
    pub fn new(config: PlaybackConfig, loader: Arc<dyn MediaLoader>) -> Self {
        Self {
            config,
            loader,
            slots: HashMap::new(),
            failed: HashSet::new(),
            playing: None,
            next_ticket: 1,
            changes: VecDeque::new(),
        }
    }

    pub fn register(&mut self, id: ItemId, media_url: impl Into<String>) -> bool {
        if self.slots.contains_key(&id) {
            return false;
        }
        let state = if self.failed.contains(&id) {
            PlaybackState::Error
        } else {
            PlaybackState::Unloaded
        };
        self.slots.insert(id, Slot::new(media_url.into(), state));
        true
    }

    /// Forces the slot to `Unloaded`, cancelling any load and releasing the
    /// resource, then forgets it.
    pub fn unregister(&mut self, id: &ItemId) -> bool {
        if !self.slots.contains_key(id) {
            return false;
        }
        self.set_state(id, PlaybackState::Unloaded);
        self.slots.remove(id);
        true
    }

    pub fn on_visibility(&mut self, id: &ItemId, visibility: VisibilityState) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.visibility = visibility;
        let state = slot.state;

        match visibility {
            VisibilityState::Visible => self.activate(id),
            VisibilityState::Entering => match state {
                PlaybackState::Playing => self.set_state(id, PlaybackState::Paused),
                PlaybackState::Loading if !self.config.preload => {
                    self.set_state(id, PlaybackState::Unloaded)
                }
                PlaybackState::Unloaded | PlaybackState::Error if self.config.preload => {
                    self.start_load(id)
                }
                _ => {}
            },
            VisibilityState::Leaving | VisibilityState::Hidden => match state {
                PlaybackState::Playing | PlaybackState::Ready => {
                    self.set_state(id, PlaybackState::Paused)
                }
                // Visibility lost mid-load: abort rather than park in Ready.
                PlaybackState::Loading => self.set_state(id, PlaybackState::Unloaded),
                _ => {}
            },
        }
    }

    pub fn on_load_complete(&mut self, completion: LoadCompletion) {
        let LoadCompletion { id, ticket, result } = completion;
        let Some(slot) = self.slots.get_mut(&id) else {
            tracing::debug!(item = %id, ticket, "dropping load for unregistered item");
            return;
        };
        match &slot.load {
            Some(load) if load.ticket == ticket => {}
            _ => {
                tracing::debug!(item = %id, ticket, "dropping stale load result");
                return;
            }
        }
        slot.load = None;

        match result {
            Ok(resource) => {
                slot.resource = Some(resource);
                slot.failures = 0;
                slot.last_error = None;
                let visible = slot.visibility == VisibilityState::Visible;
                self.set_state(&id, PlaybackState::Ready);
                let other_playing = self.playing.as_ref().is_some_and(|current| *current != id);
                if visible && !other_playing {
                    self.set_state(&id, PlaybackState::Playing);
                }
            }
            Err(MediaError::Cancelled) => self.set_state(&id, PlaybackState::Unloaded),
            Err(err) => self.record_failure(&id, err),
        }
    }

    /// Failure reported by the renderer while the media was playing.
    pub fn report_playback_error(&mut self, id: &ItemId, err: MediaError) {
        if self.slots.contains_key(id) {
            self.record_failure(id, err);
        }
    }

    /// User-initiated retry: clears the failure budget and reloads if the item
    /// is still wanted.
    pub fn retry(&mut self, id: &ItemId) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        slot.failures = 0;
        slot.last_error = None;
        let visibility = slot.visibility;
        self.failed.remove(id);
        if slot.state == PlaybackState::Error {
            self.set_state(id, PlaybackState::Unloaded);
        }
        match visibility {
            VisibilityState::Visible => self.activate(id),
            VisibilityState::Entering if self.config.preload => self.start_load(id),
            _ => {}
        }
        true
    }

    /// Unloads every paused slot whose debounce window ended at or before `now`.
    pub fn expire_idle(&mut self, now: Instant) -> usize {
        let debounce = self.config.unload_debounce;
        let expired: Vec<ItemId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == PlaybackState::Paused)
            .filter(|(_, slot)| {
                slot.paused_at
                    .is_some_and(|paused_at| paused_at + debounce <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.set_state(id, PlaybackState::Unloaded);
        }
        expired.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.state == PlaybackState::Paused)
            .filter_map(|slot| slot.paused_at)
            .min()
            .map(|paused_at| paused_at + self.config.unload_debounce)
    }

    pub fn release_all(&mut self) {
        let ids: Vec<ItemId> = self.slots.keys().cloned().collect();
        for id in &ids {
            self.set_state(id, PlaybackState::Unloaded);
        }
        self.slots.clear();
        self.playing = None;
    }

    pub fn state_of(&self, id: &ItemId) -> PlaybackState {
        self.slots
            .get(id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub fn playing(&self) -> Option<&ItemId> {
        self.playing.as_ref()
    }

    pub fn is_failed(&self, id: &ItemId) -> bool {
        self.failed.contains(id)
    }

    pub fn last_error(&self, id: &ItemId) -> Option<&MediaError> {
        self.slots.get(id).and_then(|slot| slot.last_error.as_ref())
    }

    pub fn is_registered(&self, id: &ItemId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn resident_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.resource.is_some())
            .count()
    }

    pub fn loading_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.load.is_some()).count()
    }

    pub fn drain_changes(&mut self) -> Vec<PlaybackChange> {
        self.changes.drain(..).collect()
    }

    fn activate(&mut self, id: &ItemId) {
        if let Some(current) = self.playing.clone() {
            if current != *id {
                self.set_state(&current, PlaybackState::Paused);
            }
        }
        if self.failed.contains(id) {
            return;
        }
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        match slot.state {
            PlaybackState::Unloaded | PlaybackState::Error => self.start_load(id),
            PlaybackState::Ready | PlaybackState::Paused => {
                self.set_state(id, PlaybackState::Playing)
            }
            PlaybackState::Loading | PlaybackState::Playing => {}
        }
    }

    fn start_load(&mut self, id: &ItemId) {
        if self.failed.contains(id) {
            return;
        }
        let ticket = self.next_ticket;
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        self.next_ticket += 1;
        let cancel = CancelHandle::new();
        let request = LoadRequest {
            id: id.clone(),
            url: slot.media_url.clone(),
            ticket,
            cancel: cancel.token(),
        };
        slot.load = Some(InFlightLoad { ticket, cancel });
        self.set_state(id, PlaybackState::Loading);
        self.loader.begin(request);
    }

    fn record_failure(&mut self, id: &ItemId, err: MediaError) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.failures = slot.failures.saturating_add(1);
        let exhausted = slot.failures > self.config.max_auto_retries;
        slot.last_error = Some(err.clone());
        let wanted = match slot.visibility {
            VisibilityState::Visible => true,
            VisibilityState::Entering => self.config.preload,
            _ => false,
        };
        tracing::warn!(item = %id, attempt = slot.failures, permanent = exhausted, "media failure: {err}");
        if exhausted {
            self.failed.insert(id.clone());
        }
        self.set_state(id, PlaybackState::Error);
        if !exhausted && wanted {
            self.start_load(id);
        }
    }

    fn set_state(&mut self, id: &ItemId, to: PlaybackState) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let from = slot.state;
        if from == to {
            return;
        }
        slot.state = to;

        if to != PlaybackState::Loading {
            if let Some(mut load) = slot.load.take() {
                load.cancel.cancel();
            }
        }
        if !to.holds_resource() {
            slot.resource = None;
        }
        slot.paused_at = (to == PlaybackState::Paused).then(Instant::now);

        if to == PlaybackState::Playing {
            debug_assert!(
                self.playing.as_ref().map_or(true, |current| current == id),
                "second item entered Playing"
            );
            self.playing = Some(id.clone());
        } else if self.playing.as_ref() == Some(id) {
            self.playing = None;
        }

        tracing::debug!(item = %id, %from, %to, "playback transition");
        self.changes.push_back(PlaybackChange {
            id: id.clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingLoader {
        requests: Mutex<Vec<LoadRequest>>,
    }

    impl RecordingLoader {
        pub fn requests(&self) -> Vec<LoadRequest> {
            self.requests.lock().clone()
        }

        pub fn latest(&self, id: &ItemId) -> Option<LoadRequest> {
            self.requests
                .lock()
                .iter()
                .rev()
                .find(|request| &request.id == id)
                .cloned()
        }

        pub fn count_for(&self, id: &ItemId) -> usize {
            self.requests
                .lock()
                .iter()
                .filter(|request| &request.id == id)
                .count()
        }
    }

    impl MediaLoader for RecordingLoader {
        fn begin(&self, request: LoadRequest) {
            self.requests.lock().push(request);
        }
    }

    pub fn succeed(request: &LoadRequest) -> LoadCompletion {
        LoadCompletion {
            id: request.id.clone(),
            ticket: request.ticket,
            result: Ok(MediaResource::new(
                request.url.clone(),
                "video/mp4",
                vec![0u8; 32],
            )),
        }
    }

    pub fn fail(request: &LoadRequest, err: MediaError) -> LoadCompletion {
        LoadCompletion {
            id: request.id.clone(),
            ticket: request.ticket,
            result: Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{fail, succeed, RecordingLoader};
    use super::*;

    fn id(value: &str) -> ItemId {
        ItemId::from(value)
    }

    fn setup(preload: bool) -> (PlaybackController, Arc<RecordingLoader>) {
        let loader = Arc::new(RecordingLoader::default());
        let config = PlaybackConfig {
            preload,
            ..PlaybackConfig::default()
        };
        let mut controller = PlaybackController::new(config, loader.clone());
        for name in ["a", "b", "c"] {
            controller.register(id(name), format!("https://cdn.test/{name}.mp4"));
        }
        (controller, loader)
    }

    fn play(controller: &mut PlaybackController, loader: &RecordingLoader, name: &str) {
        controller.on_visibility(&id(name), VisibilityState::Visible);
        let request = loader.latest(&id(name)).unwrap();
        controller.on_load_complete(succeed(&request));
    }

    #[test]
    fn visible_item_loads_then_plays() {
        let (mut controller, loader) = setup(false);
        controller.on_visibility(&id("a"), VisibilityState::Visible);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Loading);

        let request = loader.latest(&id("a")).unwrap();
        assert_eq!(request.url, "https://cdn.test/a.mp4");
        controller.on_load_complete(succeed(&request));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Playing);

        let path: Vec<_> = controller
            .drain_changes()
            .into_iter()
            .map(|change| change.to)
            .collect();
        assert_eq!(
            path,
            vec![
                PlaybackState::Loading,
                PlaybackState::Ready,
                PlaybackState::Playing
            ]
        );
    }

    #[test]
    fn losing_visibility_mid_load_cancels() {
        let (mut controller, loader) = setup(false);
        controller.on_visibility(&id("a"), VisibilityState::Visible);
        let request = loader.latest(&id("a")).unwrap();

        controller.on_visibility(&id("a"), VisibilityState::Hidden);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Unloaded);
        assert!(request.cancel.is_cancelled());

        // A late completion must not resurrect the slot.
        controller.on_load_complete(succeed(&request));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Unloaded);
        assert_eq!(controller.resident_count(), 0);
    }

    #[test]
    fn new_visible_pauses_previous_first() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.drain_changes();

        controller.on_visibility(&id("b"), VisibilityState::Visible);
        let changes = controller.drain_changes();
        assert_eq!(
            changes[0],
            PlaybackChange {
                id: id("a"),
                from: PlaybackState::Playing,
                to: PlaybackState::Paused
            }
        );
        assert_eq!(changes[1].id, id("b"));
        assert_eq!(controller.playing(), None);

        let request = loader.latest(&id("b")).unwrap();
        controller.on_load_complete(succeed(&request));
        assert_eq!(controller.playing(), Some(&id("b")));
    }

    #[test]
    fn paused_unloads_after_debounce() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.on_visibility(&id("a"), VisibilityState::Leaving);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Paused);
        assert_eq!(controller.resident_count(), 1);

        assert_eq!(controller.expire_idle(Instant::now()), 0);
        let deadline = controller.next_deadline().unwrap();
        assert_eq!(controller.expire_idle(deadline + Duration::from_millis(1)), 1);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Unloaded);
        assert_eq!(controller.resident_count(), 0);
    }

    #[test]
    fn quick_return_resumes_without_reload() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.on_visibility(&id("a"), VisibilityState::Leaving);
        controller.on_visibility(&id("a"), VisibilityState::Visible);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Playing);
        assert_eq!(loader.count_for(&id("a")), 1);
    }

    #[test]
    fn unloaded_item_plays_again_when_visible() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.on_visibility(&id("a"), VisibilityState::Hidden);
        controller.expire_idle(Instant::now() + Duration::from_secs(1));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Unloaded);

        play(&mut controller, &loader, "a");
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Playing);
        assert_eq!(loader.count_for(&id("a")), 2);
    }

    #[test]
    fn one_automatic_retry_then_permanent_failure() {
        let (mut controller, loader) = setup(false);
        controller.on_visibility(&id("a"), VisibilityState::Visible);
        let first = loader.latest(&id("a")).unwrap();
        controller.on_load_complete(fail(&first, MediaError::Decode("bad moov atom".into())));

        // Retried automatically.
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Loading);
        assert!(!controller.is_failed(&id("a")));
        let second = loader.latest(&id("a")).unwrap();
        assert_ne!(first.ticket, second.ticket);

        controller.on_load_complete(fail(&second, MediaError::Decode("bad moov atom".into())));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Error);
        assert!(controller.is_failed(&id("a")));
        assert_eq!(loader.count_for(&id("a")), 2);

        // Scrolling back does not auto-retry a permanently failed item.
        controller.on_visibility(&id("a"), VisibilityState::Hidden);
        controller.on_visibility(&id("a"), VisibilityState::Visible);
        assert_eq!(loader.count_for(&id("a")), 2);

        assert!(controller.retry(&id("a")));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Loading);
        assert_eq!(loader.count_for(&id("a")), 3);
    }

    #[test]
    fn permanent_failure_survives_reregistration() {
        let (mut controller, loader) = setup(false);
        for _ in 0..2 {
            controller.on_visibility(&id("a"), VisibilityState::Visible);
            let request = loader.latest(&id("a")).unwrap();
            controller.on_load_complete(fail(&request, MediaError::Decode("bad moov atom".into())));
        }
        assert!(controller.is_failed(&id("a")));

        assert!(controller.unregister(&id("a")));
        assert!(controller.register(id("a"), "https://cdn.test/a.mp4"));
        assert!(controller.is_failed(&id("a")));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Error);

        controller.on_visibility(&id("a"), VisibilityState::Visible);
        assert_eq!(loader.count_for(&id("a")), 2);
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Error);

        assert!(controller.retry(&id("a")));
        assert!(!controller.is_failed(&id("a")));
        assert_eq!(loader.count_for(&id("a")), 3);
    }

    #[test]
    fn failure_of_one_item_leaves_others_alone() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.on_visibility(&id("b"), VisibilityState::Visible);
        let request = loader.latest(&id("b")).unwrap();
        controller.on_load_complete(fail(&request, MediaError::Network("reset".into())));
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Paused);
        assert_eq!(controller.state_of(&id("b")), PlaybackState::Loading);
    }

    #[test]
    fn preload_parks_in_ready_until_visible() {
        let (mut controller, loader) = setup(true);
        controller.on_visibility(&id("b"), VisibilityState::Entering);
        let request = loader.latest(&id("b")).unwrap();
        controller.on_load_complete(succeed(&request));
        assert_eq!(controller.state_of(&id("b")), PlaybackState::Ready);

        controller.on_visibility(&id("b"), VisibilityState::Visible);
        assert_eq!(controller.state_of(&id("b")), PlaybackState::Playing);
        assert_eq!(loader.count_for(&id("b")), 1);
    }

    #[test]
    fn completion_while_other_plays_stays_ready() {
        let (mut controller, loader) = setup(true);
        controller.on_visibility(&id("b"), VisibilityState::Entering);
        play(&mut controller, &loader, "a");
        let request = loader.latest(&id("b")).unwrap();
        controller.on_load_complete(succeed(&request));
        assert_eq!(controller.state_of(&id("b")), PlaybackState::Ready);
        assert_eq!(controller.playing(), Some(&id("a")));
    }

    #[test]
    fn unregister_playing_releases_everything() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.drain_changes();
        assert!(controller.unregister(&id("a")));
        assert_eq!(controller.playing(), None);
        assert_eq!(controller.resident_count(), 0);
        assert_eq!(
            controller.drain_changes(),
            vec![PlaybackChange {
                id: id("a"),
                from: PlaybackState::Playing,
                to: PlaybackState::Unloaded
            }]
        );
        assert_eq!(controller.state_of(&id("a")), PlaybackState::Unloaded);
        assert!(!controller.is_registered(&id("a")));
    }

    #[test]
    fn release_all_cancels_loads() {
        let (mut controller, loader) = setup(false);
        play(&mut controller, &loader, "a");
        controller.on_visibility(&id("b"), VisibilityState::Visible);
        let pending = loader.latest(&id("b")).unwrap();
        controller.release_all();
        assert!(pending.cancel.is_cancelled());
        assert_eq!(controller.playing(), None);
        assert_eq!(controller.resident_count(), 0);
        assert_eq!(controller.loading_count(), 0);
    }

    #[test]
    fn scroll_trajectory_never_plays_two() {
        let (mut controller, loader) = setup(true);
        let script = [
            ("a", VisibilityState::Visible),
            ("b", VisibilityState::Entering),
            ("a", VisibilityState::Leaving),
            ("b", VisibilityState::Visible),
            ("a", VisibilityState::Visible),
            ("b", VisibilityState::Leaving),
            ("c", VisibilityState::Entering),
            ("c", VisibilityState::Visible),
            ("a", VisibilityState::Hidden),
        ];
        for (name, visibility) in script {
            controller.on_visibility(&id(name), visibility);
            for request in loader.requests() {
                controller.on_load_complete(succeed(&request));
            }
            let playing = ["a", "b", "c"]
                .iter()
                .filter(|name| controller.state_of(&id(name)) == PlaybackState::Playing)
                .count();
            assert!(playing <= 1);
        }
    }
}
