use crate::local_content::LocalContentList;
use crate::timer::{TimerId, TimerQueue};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// Media type tag carried by every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Video,
    Still,
    Flash,
    Html,
    Audio,
    Placeholder,
    #[serde(alias = "stream")]
    VideoStream,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Video => write!(f, "video"),
            ContentType::Still => write!(f, "still"),
            ContentType::Flash => write!(f, "flash"),
            ContentType::Html => write!(f, "html"),
            ContentType::Audio => write!(f, "audio"),
            ContentType::Placeholder => write!(f, "placeholder"),
            ContentType::VideoStream => write!(f, "videostream"),
        }
    }
}

impl ContentType {
    /// Parse a type tag (case-insensitive).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "video" => Ok(ContentType::Video),
            "still" | "image" => Ok(ContentType::Still),
            "flash" => Ok(ContentType::Flash),
            "html" => Ok(ContentType::Html),
            "audio" => Ok(ContentType::Audio),
            "placeholder" => Ok(ContentType::Placeholder),
            "videostream" | "stream" => Ok(ContentType::VideoStream),
            _ => Err(format!("Unknown content type '{}'", s)),
        }
    }
}

/// Content lifecycle. `Starting` and `Stopping` only exist for the duration of
/// the call that performs the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentState {
    #[default]
    Idle,
    Starting,
    Playing,
    Paused,
    Stopping,
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentState::Idle => write!(f, "idle"),
            ContentState::Starting => write!(f, "starting"),
            ContentState::Playing => write!(f, "playing"),
            ContentState::Paused => write!(f, "paused"),
            ContentState::Stopping => write!(f, "stopping"),
        }
    }
}

// --- Timing record ---

/// Timing state shared by every content variant.
#[derive(Debug, Clone, Default)]
pub struct Playback {
    pub state: ContentState,
    /// Time spent playing, frozen while paused.
    pub elapsed: Duration,
    /// Time left on the duration timer when paused. Zero otherwise.
    pub remainder: Duration,
    last_start: Option<NaiveDateTime>,
    timer: Option<TimerId>,
    poll: Option<TimerId>,
    /// Set after the first "not playing" answer from a liveness poll.
    pub end_grace: bool,
}

impl Playback {
    pub fn is_active(&self) -> bool {
        matches!(self.state, ContentState::Playing | ContentState::Paused)
    }

    /// Idle -> Playing. Arms the duration timer when `duration` is non-zero.
    /// Returns false if the item was not idle.
    pub fn start<E>(
        &mut self,
        now: NaiveDateTime,
        duration: Duration,
        timers: &mut TimerQueue<E>,
        on_timeout: E,
    ) -> bool {
        if self.state != ContentState::Idle {
            return false;
        }
        self.state = ContentState::Starting;
        self.elapsed = Duration::ZERO;
        self.remainder = Duration::ZERO;
        self.end_grace = false;
        if !duration.is_zero() {
            self.timer = Some(timers.schedule(now, duration, on_timeout));
        }
        self.last_start = Some(now);
        self.state = ContentState::Playing;
        true
    }

    /// Playing -> Paused. Freezes elapsed time and computes the remainder.
    pub fn pause<E>(
        &mut self,
        now: NaiveDateTime,
        duration: Duration,
        timers: &mut TimerQueue<E>,
    ) -> bool {
        if self.state != ContentState::Playing {
            return false;
        }
        self.elapsed += self.running_for(now);
        self.last_start = None;
        if !duration.is_zero() {
            self.remainder = (duration + Duration::from_secs(1)).saturating_sub(self.elapsed);
        }
        self.cancel_timers(timers);
        self.state = ContentState::Paused;
        true
    }

    /// Paused -> Playing. Re-arms for the remainder, or the full duration when
    /// nothing remains.
    pub fn resume<E>(
        &mut self,
        now: NaiveDateTime,
        duration: Duration,
        timers: &mut TimerQueue<E>,
        on_timeout: E,
    ) -> bool {
        if self.state != ContentState::Paused {
            return false;
        }
        let arm = if !self.remainder.is_zero() {
            self.remainder
        } else {
            duration
        };
        if !arm.is_zero() {
            self.timer = Some(timers.schedule(now, arm, on_timeout));
        }
        self.remainder = Duration::ZERO;
        self.last_start = Some(now);
        self.state = ContentState::Playing;
        true
    }

    /// Any active state -> Idle. Returns false when already idle.
    pub fn stop<E>(&mut self, timers: &mut TimerQueue<E>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = ContentState::Stopping;
        self.cancel_timers(timers);
        self.elapsed = Duration::ZERO;
        self.remainder = Duration::ZERO;
        self.last_start = None;
        self.end_grace = false;
        self.state = ContentState::Idle;
        true
    }

    /// Total time played so far, including the running stretch.
    pub fn played(&self, now: NaiveDateTime) -> Duration {
        self.elapsed + self.running_for(now)
    }

    /// Replace the liveness poll timer, cancelling any previous one.
    pub fn set_poll<E>(&mut self, timers: &mut TimerQueue<E>, id: TimerId) {
        if let Some(old) = self.poll.replace(id) {
            timers.cancel(old);
        }
    }

    fn running_for(&self, now: NaiveDateTime) -> Duration {
        match self.last_start {
            Some(since) if self.state == ContentState::Playing => {
                (now - since).to_std().unwrap_or_default()
            }
            _ => Duration::ZERO,
        }
    }

    fn cancel_timers<E>(&mut self, timers: &mut TimerQueue<E>) {
        if let Some(id) = self.timer.take() {
            timers.cancel(id);
        }
        if let Some(id) = self.poll.take() {
            timers.cancel(id);
        }
    }
}

// --- Content items ---

/// Variant-specific data. Everything else lives on `ContentItem`.
#[derive(Debug, Clone)]
pub enum ContentKind {
    Video,
    Still,
    Flash,
    Html,
    Audio,
    VideoStream { address: String, port: u16 },
    Placeholder(Box<Placeholder>),
}

/// A playable unit bound to one playlist.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub id: String,
    pub file: String,
    pub kind: ContentKind,
    /// Zero means "until the renderer reports the end".
    pub duration: Duration,
    pub full_screen: bool,
    pub playback: Playback,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, file: impl Into<String>, kind: ContentKind) -> Self {
        ContentItem {
            id: id.into(),
            file: file.into(),
            kind,
            duration: Duration::ZERO,
            full_screen: false,
            playback: Playback::default(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_full_screen(mut self, full_screen: bool) -> Self {
        self.full_screen = full_screen;
        self
    }

    pub fn content_type(&self) -> ContentType {
        match &self.kind {
            ContentKind::Video => ContentType::Video,
            ContentKind::Still => ContentType::Still,
            ContentKind::Flash => ContentType::Flash,
            ContentKind::Html => ContentType::Html,
            ContentKind::Audio => ContentType::Audio,
            ContentKind::VideoStream { .. } => ContentType::VideoStream,
            ContentKind::Placeholder(_) => ContentType::Placeholder,
        }
    }

    pub fn state(&self) -> ContentState {
        self.playback.state
    }

    pub fn is_active(&self) -> bool {
        self.playback.is_active()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, ContentKind::Placeholder(_))
    }

    pub fn placeholder(&self) -> Option<&Placeholder> {
        match &self.kind {
            ContentKind::Placeholder(p) => Some(p),
            _ => None,
        }
    }

    pub fn placeholder_mut(&mut self) -> Option<&mut Placeholder> {
        match &mut self.kind {
            ContentKind::Placeholder(p) => Some(p),
            _ => None,
        }
    }

    /// What the renderer should open: the file, or the stream URL.
    pub fn source(&self) -> String {
        match &self.kind {
            ContentKind::VideoStream { address, port } => format!("udp://@{}:{}", address, port),
            _ => self.file.clone(),
        }
    }

    /// Whether this item silences background audio while it plays.
    /// Files tagged `nsnd` carry no sound track.
    pub fn mutes_background_audio(&self) -> bool {
        matches!(self.kind, ContentKind::Video) && !self.file.contains("nsnd")
    }

    /// Background audio keeps playing through a full-screen claim.
    pub fn pauses_with_program(&self) -> bool {
        !matches!(self.kind, ContentKind::Audio)
    }

    /// Interval for polling the renderer's "still playing" answer, if this
    /// item needs one.
    pub fn liveness_interval(&self, stream: Duration, flash: Duration) -> Option<Duration> {
        match self.kind {
            ContentKind::VideoStream { .. } => Some(stream),
            ContentKind::Flash if self.duration.is_zero() => Some(flash),
            _ => None,
        }
    }

    /// Time played so far. Zero unless active.
    pub fn played(&self, now: NaiveDateTime) -> Duration {
        self.playback.played(now)
    }

    pub fn start<E>(&mut self, now: NaiveDateTime, timers: &mut TimerQueue<E>, on_timeout: E) -> bool {
        let started = self.playback.start(now, self.duration, timers, on_timeout);
        if started {
            debug!(id = %self.id, file = %self.file, kind = %self.content_type(), "content start");
        }
        started
    }

    pub fn pause<E>(&mut self, now: NaiveDateTime, timers: &mut TimerQueue<E>) -> bool {
        let paused = self.playback.pause(now, self.duration, timers);
        if paused {
            trace!(
                id = %self.id,
                played = self.playback.elapsed.as_secs_f64(),
                left = self.playback.remainder.as_secs_f64(),
                "content pause"
            );
        }
        paused
    }

    pub fn resume<E>(&mut self, now: NaiveDateTime, timers: &mut TimerQueue<E>, on_timeout: E) -> bool {
        let resumed = self.playback.resume(now, self.duration, timers, on_timeout);
        if resumed {
            trace!(id = %self.id, "content resume");
        }
        resumed
    }

    pub fn stop<E>(&mut self, timers: &mut TimerQueue<E>) -> bool {
        let stopped = self.playback.stop(timers);
        if stopped {
            debug!(id = %self.id, file = %self.file, "content stop");
        }
        stopped
    }
}

// --- Placeholder ---

/// An item that plays a rotating selection from a local content list.
#[derive(Debug, Clone)]
pub struct Placeholder {
    pub slot: String,
    /// Activations before the parent advances. Zero defers to the
    /// program-wide `placeholderlimit`.
    pub limit: u32,
    pub local: LocalContentList,
    /// Activations since the parent last advanced past this item.
    pub count: u32,
    pub timeout_fired: bool,
    /// Index into `local` of the nested item most recently pulled.
    pub current: Option<usize>,
}

impl Placeholder {
    pub fn new(slot: impl Into<String>, limit: u32, local: LocalContentList) -> Self {
        Placeholder {
            slot: slot.into(),
            limit,
            local,
            count: 0,
            timeout_fired: false,
            current: None,
        }
    }

    /// Pull the next local item. Counts the activation when one exists.
    pub fn activate(&mut self) -> Option<usize> {
        self.current = self.local.next_index();
        if self.current.is_some() {
            self.count += 1;
        }
        self.current
    }

    pub fn nested(&self) -> Option<&ContentItem> {
        self.current.and_then(|i| self.local.get(i))
    }

    pub fn nested_mut(&mut self) -> Option<&mut ContentItem> {
        let index = self.current?;
        self.local.get_mut(index)
    }

    /// Whether the parent playlist may move past this item. Consumes the
    /// count and the timeout flag when it answers yes.
    pub fn reached_limit(&mut self, program_limit: Option<u32>) -> bool {
        let limit = if self.limit > 0 {
            Some(self.limit)
        } else {
            program_limit
        };
        let counted_out = matches!(limit, Some(l) if l > 0 && l <= self.count);
        if counted_out || self.timeout_fired {
            self.count = 0;
            self.timeout_fired = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn still(secs: u64) -> ContentItem {
        ContentItem::new("1", "a.png", ContentKind::Still).with_duration(Duration::from_secs(secs))
    }

    // --- Playback tests ---

    #[test]
    fn start_arms_duration_timer() {
        let mut timers = TimerQueue::new();
        let mut item = still(10);
        assert!(item.start(t(0), &mut timers, "end"));
        assert_eq!(item.state(), ContentState::Playing);
        assert_eq!(timers.len(), 1);
        assert!(timers.pop_due(t(9)).is_none());
        assert_eq!(timers.pop_due(t(10)).map(|(_, e)| e), Some("end"));
    }

    #[test]
    fn zero_duration_is_unarmed() {
        let mut timers: TimerQueue<()> = TimerQueue::new();
        let mut item = still(0);
        item.start(t(0), &mut timers, ());
        assert!(timers.is_empty());
        assert!(item.is_active());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut timers = TimerQueue::new();
        let mut item = still(10);
        assert!(item.start(t(0), &mut timers, ()));
        assert!(!item.start(t(1), &mut timers, ()));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn pause_freezes_elapsed_and_computes_remainder() {
        let mut timers = TimerQueue::new();
        let mut item = still(30);
        item.start(t(0), &mut timers, ());
        assert!(item.pause(t(12), &mut timers));
        assert_eq!(item.state(), ContentState::Paused);
        assert_eq!(item.playback.elapsed, Duration::from_secs(12));
        assert_eq!(item.playback.remainder, Duration::from_secs(19));
        assert!(timers.is_empty());
        assert_eq!(item.played(t(100)), Duration::from_secs(12));
    }

    #[test]
    fn resume_rearms_for_remainder() {
        let mut timers = TimerQueue::new();
        let mut item = still(30);
        item.start(t(0), &mut timers, "end");
        item.pause(t(10), &mut timers);
        assert!(item.resume(t(50), &mut timers, "end"));
        assert_eq!(item.state(), ContentState::Playing);
        assert!(timers.pop_due(t(70)).is_none());
        assert_eq!(timers.pop_due(t(71)).map(|(_, e)| e), Some("end"));
    }

    #[test]
    fn resume_without_remainder_uses_full_duration() {
        let mut timers = TimerQueue::new();
        let mut item = still(5);
        item.start(t(0), &mut timers, ());
        // Paused long after the timer should have fired: nothing remains.
        item.pause(t(20), &mut timers);
        assert_eq!(item.playback.remainder, Duration::ZERO);
        item.resume(t(30), &mut timers, ());
        assert!(timers.pop_due(t(34)).is_none());
        assert!(timers.pop_due(t(35)).is_some());
    }

    #[test]
    fn elapsed_accumulates_across_pauses() {
        let mut timers = TimerQueue::new();
        let mut item = still(60);
        item.start(t(0), &mut timers, ());
        item.pause(t(10), &mut timers);
        item.resume(t(20), &mut timers, ());
        item.pause(t(35), &mut timers);
        assert_eq!(item.playback.elapsed, Duration::from_secs(25));
        assert_eq!(item.playback.remainder, Duration::from_secs(36));
    }

    #[test]
    fn pause_requires_playing() {
        let mut timers: TimerQueue<()> = TimerQueue::new();
        let mut item = still(10);
        assert!(!item.pause(t(0), &mut timers));
        assert!(!item.resume(t(0), &mut timers, ()));
    }

    #[test]
    fn stop_is_idempotent_and_zeroes_counters() {
        let mut timers = TimerQueue::new();
        let mut item = still(10);
        item.start(t(0), &mut timers, ());
        item.pause(t(4), &mut timers);
        assert!(item.stop(&mut timers));
        assert_eq!(item.state(), ContentState::Idle);
        assert_eq!(item.playback.elapsed, Duration::ZERO);
        assert_eq!(item.playback.remainder, Duration::ZERO);
        assert!(!item.stop(&mut timers));
    }

    #[test]
    fn stop_cancels_poll_timer() {
        let mut timers = TimerQueue::new();
        let mut item = still(10);
        item.start(t(0), &mut timers, "end");
        let poll = timers.schedule(t(0), Duration::from_millis(200), "poll");
        item.playback.set_poll(&mut timers, poll);
        item.stop(&mut timers);
        assert!(timers.is_empty());
    }

    // --- Item tests ---

    #[test]
    fn content_type_parsing() {
        assert_eq!(ContentType::from_str_loose("Video"), Ok(ContentType::Video));
        assert_eq!(ContentType::from_str_loose("stream"), Ok(ContentType::VideoStream));
        assert!(ContentType::from_str_loose("gif").is_err());
        assert_eq!(ContentType::Html.to_string(), "html");
    }

    #[test]
    fn stream_source_is_udp_url() {
        let item = ContentItem::new(
            "s",
            "",
            ContentKind::VideoStream {
                address: "239.0.0.1".into(),
                port: 1234,
            },
        );
        assert_eq!(item.source(), "udp://@239.0.0.1:1234");
    }

    #[test]
    fn nsnd_video_keeps_background_audio() {
        let loud = ContentItem::new("1", "clip.mp4", ContentKind::Video);
        let quiet = ContentItem::new("2", "clip_nsnd.mp4", ContentKind::Video);
        assert!(loud.mutes_background_audio());
        assert!(!quiet.mutes_background_audio());
        assert!(!still(5).mutes_background_audio());
    }

    #[test]
    fn liveness_only_for_streams_and_open_flash() {
        let stream = Duration::from_millis(200);
        let flash = Duration::from_millis(400);
        let open_flash = ContentItem::new("f", "a.swf", ContentKind::Flash);
        let timed_flash = open_flash.clone().with_duration(Duration::from_secs(5));
        assert_eq!(open_flash.liveness_interval(stream, flash), Some(flash));
        assert_eq!(timed_flash.liveness_interval(stream, flash), None);
        assert_eq!(still(0).liveness_interval(stream, flash), None);
    }

    // --- Placeholder tests ---

    fn placeholder(limit: u32, len: usize) -> Placeholder {
        let items = (0..len)
            .map(|i| ContentItem::new(i.to_string(), format!("{}.png", i), ContentKind::Still))
            .collect();
        Placeholder::new("1", limit, LocalContentList::new(items))
    }

    #[test]
    fn activate_counts_only_when_item_available() {
        let mut ph = placeholder(0, 1);
        assert_eq!(ph.activate(), Some(0));
        assert_eq!(ph.count, 1);
        assert_eq!(ph.activate(), None);
        assert_eq!(ph.count, 1);
        assert!(ph.nested().is_none());
    }

    #[test]
    fn reached_limit_counts_activations() {
        let mut ph = placeholder(2, 5);
        ph.activate();
        assert!(!ph.reached_limit(None));
        ph.activate();
        assert!(ph.reached_limit(None));
        assert_eq!(ph.count, 0);
    }

    #[test]
    fn reached_limit_falls_back_to_program_limit() {
        let mut ph = placeholder(0, 5);
        ph.activate();
        assert!(!ph.reached_limit(None));
        assert!(ph.reached_limit(Some(1)));
    }

    #[test]
    fn timeout_flag_forces_limit_and_is_consumed() {
        let mut ph = placeholder(0, 5);
        ph.timeout_fired = true;
        assert!(ph.reached_limit(None));
        assert!(!ph.timeout_fired);
        assert!(!ph.reached_limit(None));
    }
}
