//! The running program: every playlist of one schedule, the regions they draw
//! into, and the timer queue that drives them.
//!
//! Nothing here blocks or spawns. Timers are events in a `TimerQueue`; the
//! runtime thread (or a test) moves time forward with `run_until`, and the
//! renderer reports back through `media_ended` / `media_error` /
//! `media_playing`.

use crate::config::{EngineSettings, Parameters, PlayerConfig};
use crate::content::{ContentKind, ContentState};
use crate::error::Result;
use crate::fullscreen::FullScreenArbiter;
use crate::local_content::LocalContentSource;
use crate::playlist::{ItemRef, Playlist, PlaylistId};
use crate::region::{RegionId, RegionTable};
use crate::render::{Liveness, RenderRequest, Renderer};
use crate::schedule::{BuiltProgram, ScheduleDocument};
use crate::smart::{self, OverrideAction, ScheduleView};
use crate::status::{PlayReport, StatusReporter, StatusSink, StatusSnapshot};
use crate::timer::{TimerId, TimerQueue};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// ── Events ──────────────────────────────────────────────────────────

/// Everything the program schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An item's duration ran out.
    ItemTimeout(ItemRef),
    /// A placeholder found nothing to play.
    PlaceholderIdle(ItemRef),
    /// Ask the renderer whether a stream or open-ended flash still plays.
    LivenessPoll(ItemRef),
    /// Retry starting a playlist (stagger or full-screen backoff).
    StartPlaylist(PlaylistId),
    /// Move past an item that could not get its exclusive resource.
    Skip(PlaylistId, usize),
    /// Stop an item whose render start failed.
    RenderFailed(ItemRef),
    TransitionEnd {
        playlist: PlaylistId,
        outgoing: RegionId,
    },
    ResolverPass,
    StatusTick,
}

// ── Program ─────────────────────────────────────────────────────────

pub struct Program {
    name: String,
    version: String,
    playlists: Vec<Playlist>,
    regions: RegionTable,
    arbiter: FullScreenArbiter,
    timers: TimerQueue<Event>,
    renderer: Box<dyn Renderer>,
    status: StatusReporter,
    settings: EngineSettings,
    parameters: Parameters,
    now: NaiveDateTime,
    resolver_timer: Option<TimerId>,
    status_timer: Option<TimerId>,
    /// Playlist holding the exclusive stream renderer.
    external_owner: Option<PlaylistId>,
    background_audio: Option<ItemRef>,
    /// Playing videos with a sound track.
    audio_mutes: u32,
    /// Playlists whose transition waits for the renderer's "playing".
    awaiting_playing: HashSet<PlaylistId>,
    fatal: bool,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("playlists", &self.playlists.len())
            .field("now", &self.now)
            .field("fatal", &self.fatal)
            .finish()
    }
}

impl Program {
    /// Wrap already built playlists. Call `start` to begin playback.
    pub fn new(
        built: BuiltProgram,
        config: &PlayerConfig,
        renderer: Box<dyn Renderer>,
        sink: Box<dyn StatusSink>,
        now: NaiveDateTime,
    ) -> Self {
        let mut regions = RegionTable::new();
        let fa = regions.add("fullscreen/A");
        let fb = regions.add("fullscreen/B");
        let mut program = Program {
            name: String::new(),
            version: String::new(),
            playlists: Vec::new(),
            regions,
            arbiter: FullScreenArbiter::new(fa, fb),
            timers: TimerQueue::new(),
            renderer,
            status: StatusReporter::new(sink),
            settings: config.engine.clone(),
            parameters: config.parameters.clone(),
            now,
            resolver_timer: None,
            status_timer: None,
            external_owner: None,
            background_audio: None,
            audio_mutes: 0,
            awaiting_playing: HashSet::new(),
            fatal: false,
        };
        program.install(built);
        program
    }

    /// Build the program named by the `program` parameter (or the first one)
    /// from a schedule document.
    pub fn from_document(
        doc: &ScheduleDocument,
        config: &PlayerConfig,
        local: &dyn LocalContentSource,
        renderer: Box<dyn Renderer>,
        sink: Box<dyn StatusSink>,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let built = doc
            .program(config.parameters.program())?
            .build(now, &config.engine, local);
        let mut program = Self::new(built, config, renderer, sink, now);
        program.version = doc.version.clone();
        Ok(program)
    }

    fn install(&mut self, built: BuiltProgram) {
        self.name = built.name;
        for problem in &built.problems {
            self.status.error(self.now, problem);
        }
        let mut regions = RegionTable::new();
        let fa = regions.add("fullscreen/A");
        let fb = regions.add("fullscreen/B");
        self.arbiter = FullScreenArbiter::new(fa, fb);
        self.playlists = built.playlists;
        for pl in &mut self.playlists {
            if !pl.is_smart() {
                pl.buffers = Some(regions.add_pair(&pl.name));
            }
        }
        self.regions = regions;
    }

    /// Start every normal playlist and the periodic passes.
    pub fn start(&mut self) {
        info!(program = %self.name, playlists = self.playlists.len(), "program start");
        let ids: Vec<PlaylistId> = self
            .playlists
            .iter()
            .filter(|p| !p.is_smart())
            .map(|p| p.id)
            .collect();
        for id in ids {
            self.start_playlist(id);
        }
        if self.playlists.iter().any(|p| p.is_smart()) {
            self.resolver_timer = Some(self.timers.schedule(
                self.now,
                self.settings.smart_poll(),
                Event::ResolverPass,
            ));
        }
        self.status_timer = Some(self.timers.schedule(
            self.now,
            self.settings.status_interval(),
            Event::StatusTick,
        ));
    }

    // ── Accessors ──

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn playlists(&self) -> &[Playlist] {
        &self.playlists
    }

    pub fn playlist(&self, id: PlaylistId) -> Option<&Playlist> {
        self.playlists.get(id.0)
    }

    /// Normal playlist by name, case-insensitive.
    pub fn find_playlist(&self, name: &str) -> Option<&Playlist> {
        self.playlists
            .iter()
            .find(|p| !p.is_smart() && p.name.eq_ignore_ascii_case(name))
    }

    /// Schedule bound to the named target.
    pub fn find_schedule(&self, target: &str) -> Option<&Playlist> {
        self.playlists
            .iter()
            .find(|p| p.is_smart() && p.name.eq_ignore_ascii_case(target))
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn full_screen_owner(&self) -> Option<PlaylistId> {
        self.arbiter.owner()
    }

    /// Who is drawing into a normal playlist's regions right now.
    pub fn controller(&self, id: PlaylistId) -> PlaylistId {
        self.playlists
            .get(id.0)
            .and_then(|p| p.overridden_by)
            .unwrap_or(id)
    }

    /// File (or stream URL) on screen for a normal playlist, if any.
    pub fn now_showing(&self, id: PlaylistId) -> Option<String> {
        let pl = self.playlists.get(self.controller(id).0)?;
        let item = pl.item(pl.playing_ref()?)?;
        item.is_active().then(|| item.source())
    }

    // ── Time ──

    /// Fire every timer due at or before `until`, in order, then set the
    /// clock to `until`.
    pub fn run_until(&mut self, until: NaiveDateTime) {
        while let Some(due) = self.timers.next_due() {
            if due > until {
                break;
            }
            if due > self.now {
                self.now = due;
            }
            if let Some((_, event)) = self.timers.pop_due(self.now) {
                self.handle(event);
            }
        }
        if until > self.now {
            self.now = until;
        }
    }

    pub fn run_for(&mut self, span: Duration) {
        let span = chrono::Duration::from_std(span).unwrap_or_else(|_| chrono::Duration::days(1));
        self.run_until(self.now + span);
    }

    pub fn next_due(&mut self) -> Option<NaiveDateTime> {
        self.timers.next_due()
    }

    pub fn handle(&mut self, event: Event) {
        trace!(?event, "event");
        match event {
            Event::ItemTimeout(r) => self.stop_item(r),
            Event::PlaceholderIdle(r) => self.stop_item(r),
            Event::LivenessPoll(r) => self.poll_liveness(r),
            Event::StartPlaylist(id) => {
                if let Some(pl) = self.playlists.get_mut(id.0) {
                    pl.start_timer = None;
                }
                self.start_playlist(id);
            }
            Event::Skip(id, index) => {
                let Some(pl) = self.playlists.get(id.0) else { return };
                let idle = pl.items.get(index).is_some_and(|i| !i.is_active());
                if pl.current_index == index && idle && !pl.is_suppressed() {
                    self.next(id);
                }
            }
            Event::RenderFailed(r) => self.stop_item(r),
            Event::TransitionEnd { playlist, outgoing } => self.transition_end(playlist, outgoing),
            Event::ResolverPass => {
                self.resolver_timer = None;
                self.resolve_overrides();
            }
            Event::StatusTick => {
                self.status_timer = None;
                self.send_status();
            }
        }
    }

    // ── Renderer signals ──

    fn is_current(&self, r: ItemRef) -> bool {
        self.playlists.get(r.playlist.0).is_some_and(|pl| {
            pl.playing_ref() == Some(r) && pl.item(r).is_some_and(|i| i.is_active())
        })
    }

    /// The renderer finished an item on its own.
    pub fn media_ended(&mut self, r: ItemRef) {
        if !self.is_current(r) {
            debug!(?r, "ignoring end of an item no longer playing");
            return;
        }
        self.stop_item(r);
    }

    /// The renderer could not play an item.
    pub fn media_error(&mut self, r: ItemRef, message: &str) {
        if !self.is_current(r) {
            debug!(?r, "ignoring error from an item no longer playing");
            return;
        }
        let file = self
            .playlists
            .get(r.playlist.0)
            .and_then(|p| p.item(r))
            .map(|i| i.source())
            .unwrap_or_default();
        self.status.error(self.now, &format!("ERROR playing {}: {}", file, message));
        self.stop_item(r);
    }

    /// The renderer reports an item is actually on screen.
    pub fn media_playing(&mut self, r: ItemRef) {
        if self.is_current(r) && self.awaiting_playing.remove(&r.playlist) {
            self.begin_transition(r.playlist);
        }
    }

    // ── Starting ──

    fn start_playlist(&mut self, id: PlaylistId) {
        let now = self.now;
        let step = self.settings.start_step();
        let backoff = self.settings.fullscreen_backoff();
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        if let Some(t) = pl.start_timer.take() {
            self.timers.cancel(t);
        }
        if pl.is_empty() || pl.buffers.is_none() || pl.is_suppressed() {
            trace!(playlist = %pl.name, "not starting");
            return;
        }
        if let Some(delay) = pl.take_start_step(step) {
            pl.start_timer = Some(self.timers.schedule(now, delay, Event::StartPlaylist(id)));
            return;
        }

        if let Some(owner) = self.arbiter.owner() {
            let live = owner != id
                && self
                    .playlists
                    .get(owner.0)
                    .is_some_and(|o| !o.is_suppressed());
            if live {
                self.arbiter.wait(id);
                let pl = &mut self.playlists[id.0];
                pl.start_timer = Some(self.timers.schedule(now, backoff, Event::StartPlaylist(id)));
                let msg = format!("Another playlist is in fullscreen mode, {} waits", pl.name);
                self.status.trace(now, &msg);
                return;
            }
        }

        let pl = &self.playlists[id.0];
        let Some(item) = pl.current_item() else { return };
        if !item.is_placeholder() && item.is_active() {
            debug!(playlist = %pl.name, index = pl.current_index, "already playing");
            return;
        }
        let wants_full = item.full_screen;
        let is_video = matches!(item.kind, ContentKind::Video);
        let holds_full = pl.full_screen_active;
        let last_full = pl.last_full_screen;

        if wants_full {
            let region = self.arbiter.next_region(last_full);
            self.playlists[id.0].use_full_screen_region(region);
            if !holds_full {
                // The gate above let us through, so a claim still held
                // elsewhere belongs to a suppressed playlist.
                if !self.arbiter.acquire(id) {
                    if let Some(prev) = self.arbiter.take_over(id) {
                        if let Some(p) = self.playlists.get_mut(prev.0) {
                            p.full_screen_active = false;
                        }
                    }
                }
                self.playlists[id.0].full_screen_active = true;
                self.renderer.show_full_screen(true);
                self.pause_others(id);
            }
        } else if holds_full {
            self.resume_others(id);
            self.playlists[id.0].full_screen_active = false;
            self.renderer.show_full_screen(false);
            for waiter in self.arbiter.release(id) {
                self.retry_now(waiter);
            }
        }

        self.playlists[id.0].started_at = Some(now);
        self.abort_transition(id);
        let Some(shown) = self.start_current(id) else { return };
        if let Some(region) = self.playlists[id.0].current_region() {
            self.regions.occupy(region, shown);
        }
        if is_video && self.renderer.defers_video_transition() {
            self.awaiting_playing.insert(id);
        } else {
            self.begin_transition(id);
        }
    }

    fn retry_now(&mut self, id: PlaylistId) {
        let now = self.now;
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        if let Some(t) = pl.start_timer.take() {
            self.timers.cancel(t);
        }
        pl.start_timer = Some(self.timers.schedule(now, Duration::ZERO, Event::StartPlaylist(id)));
    }

    /// Start the current entry. Returns the item actually shown.
    fn start_current(&mut self, id: PlaylistId) -> Option<ItemRef> {
        let pl = self.playlists.get(id.0)?;
        let index = pl.current_index;
        if pl.items.get(index)?.is_placeholder() {
            self.activate_placeholder(id, index)
        } else {
            self.start_leaf(ItemRef::new(id, index))
        }
    }

    fn activate_placeholder(&mut self, id: PlaylistId, index: usize) -> Option<ItemRef> {
        let now = self.now;
        let idle = self.settings.placeholder_idle();
        let top = ItemRef::new(id, index);
        let item = self.playlists.get_mut(id.0)?.items.get_mut(index)?;
        let next = item.placeholder_mut()?.activate();
        if !item.is_active() {
            // The slot's own duration bounds the whole run of nested items.
            let duration = item.duration;
            item.playback
                .start(now, duration, &mut self.timers, Event::ItemTimeout(top));
        }
        match next {
            Some(n) => self.start_leaf(ItemRef::nested(id, index, n)),
            None => {
                let t = self.timers.schedule(now, idle, Event::PlaceholderIdle(top));
                item.playback.set_poll(&mut self.timers, t);
                debug!(playlist = id.0, index, "placeholder has nothing to play");
                None
            }
        }
    }

    fn start_leaf(&mut self, r: ItemRef) -> Option<ItemRef> {
        let now = self.now;
        let skip = self.settings.skip_delay();
        let backoff = self.settings.fullscreen_backoff();
        let (stream_poll, flash_poll) = (self.settings.stream_poll(), self.settings.flash_poll());

        let pl = self.playlists.get_mut(r.playlist.0)?;
        let region = pl.current_region()?;
        let full_screen = pl.full_screen_active;
        let len = pl.len();
        let item = pl.item_mut(r)?;

        match &item.kind {
            ContentKind::VideoStream { .. } => {
                if self.fatal {
                    warn!(file = %item.source(), "stream renderer is down, not starting");
                    return None;
                }
                if self.external_owner.is_some_and(|o| o != r.playlist) {
                    let msg = format!("external player in use, skipping {}", item.source());
                    self.status.error(now, &msg);
                    self.timers.schedule(now, skip, Event::Skip(r.playlist, r.index));
                    return None;
                }
                self.external_owner = Some(r.playlist);
            }
            ContentKind::Audio => {
                if self.background_audio.is_some_and(|a| a != r) {
                    let msg = format!("background audio already playing, skipping {}", item.file);
                    self.status.trace(now, &msg);
                    self.timers.schedule(now, skip, Event::Skip(r.playlist, r.index));
                    return None;
                }
                self.background_audio = Some(r);
            }
            _ => {}
        }

        if !item.start(now, &mut self.timers, Event::ItemTimeout(r)) {
            return None;
        }
        let source = item.source();
        let mutes = item.mutes_background_audio();
        let result = self.renderer.start(&RenderRequest {
            item: r,
            content: item,
            region,
            full_screen,
        });
        if let Some(interval) = item.liveness_interval(stream_poll, flash_poll) {
            let t = self.timers.schedule(now, interval, Event::LivenessPoll(r));
            item.playback.set_poll(&mut self.timers, t);
        }
        pl.playing_file = Some(source.clone());

        if mutes {
            self.audio_mutes += 1;
            if self.audio_mutes == 1 {
                self.renderer.set_background_audio(false);
            }
        }

        match result {
            Ok(()) => pl.failure_streak = 0,
            Err(e) => {
                pl.failure_streak += 1;
                // A playlist where nothing renders must not spin in place.
                let delay = if pl.failure_streak >= len {
                    backoff
                } else {
                    Duration::ZERO
                };
                self.status.error(now, &format!("ERROR starting {}: {}", source, e));
                self.timers.schedule(now, delay, Event::RenderFailed(r));
            }
        }
        Some(r)
    }

    // ── Stopping and sequencing ──

    /// Stop an item and advance its playlist. No-op when it is not active.
    fn stop_item(&mut self, r: ItemRef) {
        let Some(item) = self.playlists.get_mut(r.playlist.0).and_then(|p| p.item_mut(r)) else {
            return;
        };
        if r.nested.is_none() && item.is_placeholder() {
            self.stop_placeholder(r);
            return;
        }
        let is_stream = matches!(item.kind, ContentKind::VideoStream { .. });
        let mutes = item.mutes_background_audio();
        if !item.stop(&mut self.timers) {
            return;
        }
        self.renderer.stop(r);
        if is_stream && self.external_owner == Some(r.playlist) {
            self.external_owner = None;
        }
        if self.background_audio == Some(r) {
            self.background_audio = None;
        }
        if mutes && self.audio_mutes > 0 {
            self.audio_mutes -= 1;
            if self.audio_mutes == 0 {
                self.renderer.set_background_audio(true);
            }
        }
        self.next(r.playlist);
    }

    /// The placeholder's slot time ran out, or it had nothing to play. Either
    /// way the playlist moves past it.
    fn stop_placeholder(&mut self, top: ItemRef) {
        let Some(item) = self
            .playlists
            .get_mut(top.playlist.0)
            .and_then(|p| p.items.get_mut(top.index))
        else {
            return;
        };
        if !item.stop(&mut self.timers) {
            return;
        }
        let nested = item.placeholder_mut().and_then(|ph| {
            ph.timeout_fired = true;
            ph.current
                .filter(|n| ph.local.get(*n).is_some_and(|c| c.is_active()))
        });
        match nested {
            Some(n) => self.stop_item(ItemRef::nested(top.playlist, top.index, n)),
            None => self.next(top.playlist),
        }
    }

    fn next(&mut self, id: PlaylistId) {
        let now = self.now;
        let limit = self.parameters.placeholder_limit();
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        let adv = pl.advance(limit, &mut self.timers);
        debug!(
            playlist = %pl.name,
            index = pl.current_index,
            moved = adv.moved,
            wrapped = adv.wrapped,
            "advance"
        );
        let report = adv.finished.map(|f| PlayReport {
            file: f.file,
            id: f.id,
            start: pl.started_at,
            end: now,
            playlist: pl.name.clone(),
            program: self.name.clone(),
        });
        if adv.exhausted {
            info!(playlist = %pl.name, "play count used up");
            self.expedite_resolver();
        }
        if adv.restart {
            self.start_playlist(id);
        } else {
            let name = self.playlists[id.0].name.clone();
            self.status
                .trace(now, &format!("not restarting replaced or stopped playlist {}", name));
        }
        if let Some(report) = report {
            self.status.played(report);
        }
    }

    // ── Pause / resume for full screen ──

    fn controllers(&self) -> Vec<PlaylistId> {
        self.playlists
            .iter()
            .filter(|p| !p.is_smart())
            .map(|p| p.overridden_by.unwrap_or(p.id))
            .collect()
    }

    fn pause_others(&mut self, except: PlaylistId) {
        for c in self.controllers() {
            if c != except {
                self.pause_playlist(c);
            }
        }
    }

    fn resume_others(&mut self, except: PlaylistId) {
        for c in self.controllers() {
            if c != except {
                self.resume_playlist(c);
            }
        }
    }

    fn pause_playlist(&mut self, id: PlaylistId) {
        let now = self.now;
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        if pl.full_screen_active {
            return;
        }
        let shown = pl.playing_ref();
        let Some(item) = pl.current_item_mut() else { return };
        if !item.pauses_with_program() {
            return;
        }
        let mut paused = item.pause(now, &mut self.timers);
        if let Some(nested) = item.placeholder_mut().and_then(|ph| ph.nested_mut()) {
            paused = nested.pause(now, &mut self.timers) || paused;
        }
        if let (true, Some(r)) = (paused, shown) {
            self.renderer.pause(r);
        }
    }

    fn resume_playlist(&mut self, id: PlaylistId) {
        let now = self.now;
        let (stream_poll, flash_poll) = (self.settings.stream_poll(), self.settings.flash_poll());
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        if pl.full_screen_active {
            return;
        }
        let index = pl.current_index;
        let shown = pl.playing_ref();
        let Some(item) = pl.current_item_mut() else { return };
        let is_placeholder = item.is_placeholder();
        let mut resumed = item.resume(now, &mut self.timers, Event::ItemTimeout(ItemRef::new(id, index)));
        let Some(r) = shown else { return };
        let leaf = if is_placeholder {
            match item.placeholder_mut().and_then(|ph| ph.nested_mut()) {
                Some(nested) => {
                    resumed = nested.resume(now, &mut self.timers, Event::ItemTimeout(r)) || resumed;
                    nested
                }
                None => return,
            }
        } else {
            item
        };
        if !resumed {
            return;
        }
        if let Some(interval) = leaf.liveness_interval(stream_poll, flash_poll) {
            let t = self.timers.schedule(now, interval, Event::LivenessPoll(r));
            leaf.playback.set_poll(&mut self.timers, t);
        }
        self.renderer.resume(r);
    }

    // ── Liveness ──

    fn poll_liveness(&mut self, r: ItemRef) {
        let now = self.now;
        let grace = self.settings.stream_end_grace();
        let (stream_poll, flash_poll) = (self.settings.stream_poll(), self.settings.flash_poll());
        let Some(item) = self.playlists.get_mut(r.playlist.0).and_then(|p| p.item_mut(r)) else {
            return;
        };
        if item.state() != ContentState::Playing {
            return;
        }
        let is_stream = matches!(item.kind, ContentKind::VideoStream { .. });
        let source = item.source();
        match self.renderer.is_playing(r) {
            Liveness::Playing => {
                item.playback.end_grace = false;
                if let Some(interval) = item.liveness_interval(stream_poll, flash_poll) {
                    let t = self.timers.schedule(now, interval, Event::LivenessPoll(r));
                    item.playback.set_poll(&mut self.timers, t);
                }
            }
            Liveness::Ended if is_stream && !item.playback.end_grace => {
                debug!(file = %source, "stream looks finished, checking again");
                item.playback.end_grace = true;
                let t = self.timers.schedule(now, grace, Event::LivenessPoll(r));
                item.playback.set_poll(&mut self.timers, t);
            }
            Liveness::Ended => self.stop_item(r),
            Liveness::Unavailable => {
                self.set_fatal(&format!("renderer for {} is unavailable", source));
                self.stop_item(r);
            }
        }
    }

    fn set_fatal(&mut self, message: &str) {
        if self.fatal {
            return;
        }
        error!("fatal: {}", message);
        self.fatal = true;
        self.status.error(self.now, &format!("FATAL: {}", message));
        self.status.halt();
    }

    // ── Transitions ──

    fn begin_transition(&mut self, id: PlaylistId) {
        let now = self.now;
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        let Some(b) = pl.buffers else { return };
        let span = pl.transition.begin(b.last, b.current);
        if span.is_zero() {
            self.transition_end(id, b.last);
        } else {
            let event = Event::TransitionEnd {
                playlist: id,
                outgoing: b.last,
            };
            pl.transition_timer = Some((self.timers.schedule(now, span, event), b.last));
        }
    }

    /// Finish an in-flight transition right away.
    fn abort_transition(&mut self, id: PlaylistId) {
        let Some(pl) = self.playlists.get_mut(id.0) else { return };
        if let Some((t, outgoing)) = pl.transition_timer.take() {
            self.timers.cancel(t);
            self.transition_end(id, outgoing);
        }
    }

    /// Clear whatever the outgoing region still shows, unless another item is
    /// playing there now.
    fn transition_end(&mut self, id: PlaylistId, outgoing: RegionId) {
        if let Some(pl) = self.playlists.get_mut(id.0) {
            if pl.transition_timer.is_some_and(|(_, r)| r == outgoing) {
                pl.transition_timer = None;
            }
        }
        let Some(occupant) = self.regions.occupant(outgoing) else { return };
        let live = self.playlists.get(occupant.playlist.0).is_some_and(|p| {
            p.current_region() == Some(outgoing) && p.item(occupant).is_some_and(|i| i.is_active())
        });
        if live {
            return;
        }
        self.regions.vacate(outgoing);
        self.renderer.cleanup(occupant, outgoing);
    }

    // ── Schedules ──

    fn target_of(&self, schedule: &Playlist) -> Option<PlaylistId> {
        let target = &schedule.smart.as_ref()?.target;
        self.playlists
            .iter()
            .find(|p| !p.is_smart() && p.name == *target)
            .map(|p| p.id)
    }

    fn expedite_resolver(&mut self) {
        if let Some(t) = self.resolver_timer.take() {
            self.timers.cancel(t);
        }
        self.resolver_timer = Some(self.timers.schedule(
            self.now,
            self.settings.expedited_poll(),
            Event::ResolverPass,
        ));
    }

    /// One resolver pass: start and stop schedules by their windows, then
    /// re-arm the poll.
    pub fn resolve_overrides(&mut self) {
        if let Some(t) = self.resolver_timer.take() {
            self.timers.cancel(t);
        }
        let tod = smart::time_of_day(self.now);
        let views: Vec<ScheduleView> = self
            .playlists
            .iter()
            .filter_map(|pl| {
                let sched = pl.smart.as_ref()?;
                let target = self.target_of(pl)?;
                Some(ScheduleView {
                    schedule: pl.id,
                    target,
                    running: pl.is_running_override(),
                    self_stopped: sched.stopped,
                    active_window: sched.active_window(tod),
                    target_overridden: self.playlists[target.0].overridden_by.is_some(),
                })
            })
            .collect();

        for action in smart::resolve(&views) {
            match action {
                OverrideAction::Stop { schedule, target } => self.stop_override(schedule, target),
                OverrideAction::Start {
                    schedule,
                    target,
                    window,
                } => self.start_override(schedule, target, window),
            }
        }

        self.resolver_timer = Some(self.timers.schedule(
            self.now,
            self.settings.smart_poll(),
            Event::ResolverPass,
        ));
    }

    fn start_override(&mut self, schedule: PlaylistId, target: PlaylistId, window: usize) {
        let Some(win) = self.playlists[schedule.0]
            .smart
            .as_ref()
            .and_then(|s| s.windows.get(window).copied())
        else {
            return;
        };
        info!(
            schedule = schedule.0,
            target = %self.playlists[target.0].name,
            start = %smart::format_time_of_day(win.start),
            "schedule takes over"
        );

        self.playlists[target.0].overridden_by = Some(schedule);
        if let Some(t) = self.playlists[target.0].start_timer.take() {
            self.timers.cancel(t);
        }
        let index = self.playlists[target.0].current_index;
        self.stop_item(ItemRef::new(target, index));
        self.abort_transition(target);

        let buffers = self.playlists[target.0].buffers.take();
        let holds_full = std::mem::take(&mut self.playlists[target.0].full_screen_active);
        let last_full = self.playlists[target.0].last_full_screen;

        let sched = &mut self.playlists[schedule.0];
        sched.buffers = buffers;
        sched.last_full_screen = last_full;
        sched.set_full_screen(win.full_screen);
        if let Some(s) = &mut sched.smart {
            s.remaining_play_count = win.play_count;
            s.stopped = false;
        }
        if holds_full {
            sched.full_screen_active = true;
            self.arbiter.transfer(target, schedule);
        }
        self.start_playlist(schedule);
    }

    fn stop_override(&mut self, schedule: PlaylistId, target: PlaylistId) {
        info!(
            schedule = schedule.0,
            target = %self.playlists[target.0].name,
            "schedule hands back"
        );
        let tod = smart::time_of_day(self.now);
        self.playlists[target.0].overridden_by = None;
        if let Some(t) = self.playlists[schedule.0].start_timer.take() {
            self.timers.cancel(t);
        }
        let self_stopped = self.playlists[schedule.0]
            .smart
            .as_ref()
            .is_some_and(|s| s.stopped);
        if !self_stopped {
            if let Some(s) = &mut self.playlists[schedule.0].smart {
                s.stopped = true;
            }
            let index = self.playlists[schedule.0].current_index;
            self.stop_item(ItemRef::new(schedule, index));
        }
        self.abort_transition(schedule);

        let sched = &mut self.playlists[schedule.0];
        if let Some(s) = &mut sched.smart {
            s.reset_windows(tod);
        }
        let buffers = sched.buffers.take();
        let holds_full = std::mem::take(&mut sched.full_screen_active);
        let last_full = sched.last_full_screen;

        let tgt = &mut self.playlists[target.0];
        tgt.buffers = buffers;
        tgt.last_full_screen = last_full;
        if holds_full {
            tgt.full_screen_active = true;
            self.arbiter.transfer(schedule, target);
        }
        self.start_playlist(target);
    }

    // ── Status ──

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut currently_playing = BTreeMap::new();
        for pl in self.playlists.iter().filter(|p| !p.is_smart()) {
            if let Some(file) = self.now_showing(pl.id) {
                currently_playing.insert(pl.name.clone(), file);
            }
        }
        StatusSnapshot {
            time: Some(self.now),
            program: self.name.clone(),
            currently_playing,
            last_played: self.status.last_played.clone(),
            error_message_last: self.status.last_error.as_ref().map(|(m, _)| m.clone()),
            error_message_time: self.status.last_error.as_ref().map(|(_, t)| *t),
        }
    }

    fn send_status(&mut self) {
        // A fatal error silences status so the outside notices the hang.
        if self.fatal {
            return;
        }
        let snapshot = self.snapshot();
        self.status.snapshot(&snapshot);
        self.status_timer = Some(self.timers.schedule(
            self.now,
            self.settings.status_interval(),
            Event::StatusTick,
        ));
    }

    // ── Teardown and reload ──

    /// Stop everything without advancing any playlist.
    pub fn shutdown(&mut self) {
        info!(program = %self.name, "program stop");
        let mut playing = Vec::new();
        for pl in &mut self.playlists {
            let id = pl.id;
            for (index, item) in pl.items.iter_mut().enumerate() {
                if let Some(ph) = item.placeholder_mut() {
                    for n in 0..ph.local.len() {
                        if let Some(nested) = ph.local.get_mut(n) {
                            if nested.stop(&mut self.timers) {
                                playing.push(ItemRef::nested(id, index, n));
                            }
                        }
                    }
                    item.stop(&mut self.timers);
                } else if item.stop(&mut self.timers) {
                    playing.push(ItemRef::new(id, index));
                }
            }
            pl.start_timer = None;
            pl.transition_timer = None;
        }
        for r in playing {
            self.renderer.stop(r);
        }
        for region in (0..self.regions.len()).map(RegionId) {
            if let Some(occupant) = self.regions.vacate(region) {
                self.renderer.cleanup(occupant, region);
            }
        }
        if self.arbiter.owner().is_some() {
            self.renderer.show_full_screen(false);
        }
        self.arbiter.clear();
        if self.audio_mutes > 0 {
            self.renderer.set_background_audio(true);
        }
        self.audio_mutes = 0;
        self.external_owner = None;
        self.background_audio = None;
        self.awaiting_playing.clear();
        self.timers.clear();
        self.resolver_timer = None;
        self.status_timer = None;
    }

    /// Replace the running program when the document's version changed.
    /// Returns false when the version is the one already playing. A document
    /// without a usable program leaves the current one running.
    pub fn reload(
        &mut self,
        doc: &ScheduleDocument,
        config: &PlayerConfig,
        local: &dyn LocalContentSource,
    ) -> Result<bool> {
        if doc.version == self.version {
            debug!(version = %doc.version, "schedule unchanged");
            return Ok(false);
        }
        let built = doc
            .program(config.parameters.program())?
            .build(self.now, &config.engine, local);
        info!(from = %self.version, to = %doc.version, "reloading schedule");
        self.shutdown();
        self.settings = config.engine.clone();
        self.parameters = config.parameters.clone();
        self.version = doc.version.clone();
        self.install(built);
        self.start();
        Ok(true)
    }
}
