//! Status reporting toward the control process: periodic snapshots, play
//! reports, and rate-limited error/trace strings.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ERROR_BURST_LIMIT: u32 = 10;
pub const TRACE_BURST_LIMIT: u32 = 40;
pub const BURST_WINDOW: Duration = Duration::from_secs(20);

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One finished item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayReport {
    pub file: String,
    pub id: String,
    pub start: Option<NaiveDateTime>,
    pub end: NaiveDateTime,
    pub playlist: String,
    pub program: String,
}

/// Periodic status, built by the program.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub time: Option<NaiveDateTime>,
    pub program: String,
    /// Playlist name -> file currently shown.
    pub currently_playing: BTreeMap<String, String>,
    pub last_played: Option<PlayReport>,
    pub error_message_last: Option<String>,
    pub error_message_time: Option<NaiveDateTime>,
}

impl StatusSnapshot {
    /// Comma-joined list of everything on screen.
    pub fn currently_playing_files(&self) -> String {
        self.currently_playing
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Flatten into the key/value form the control process expects.
    pub fn to_status_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (playlist, file) in &self.currently_playing {
            map.insert(format!("currentlyPlaying-{}", playlist), file.clone());
        }
        map.insert("currentlyPlayingFiles".into(), self.currently_playing_files());
        map.insert("programName".into(), self.program.clone());
        if let Some(time) = self.time {
            map.insert("statusTime".into(), time.format(TIME_FORMAT).to_string());
        }
        if let Some(played) = &self.last_played {
            map.insert("playedFile".into(), played.file.clone());
            map.insert("playedId".into(), played.id.clone());
            map.insert("playedPlaylist".into(), played.playlist.clone());
            if let Some(start) = played.start {
                map.insert("playedStart".into(), start.format(TIME_FORMAT).to_string());
            }
            map.insert("playedEnd".into(), played.end.format(TIME_FORMAT).to_string());
        }
        if let Some(msg) = &self.error_message_last {
            map.insert("errorMessageLast".into(), msg.clone());
        }
        if let Some(time) = self.error_message_time {
            map.insert("errorMessageTime".into(), time.format(TIME_FORMAT).to_string());
        }
        map
    }
}

// --- Sinks ---

/// Receives status output. Implementations must not block scheduling.
pub trait StatusSink {
    fn snapshot(&mut self, snapshot: &StatusSnapshot);
    fn played(&mut self, report: &PlayReport);
    fn error(&mut self, message: &str);
    fn trace(&mut self, message: &str);
}

/// Writes everything to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn snapshot(&mut self, snapshot: &StatusSnapshot) {
        info!(files = %snapshot.currently_playing_files(), "status");
    }

    fn played(&mut self, report: &PlayReport) {
        info!(file = %report.file, id = %report.id, playlist = %report.playlist, "played");
    }

    fn error(&mut self, message: &str) {
        warn!(target: "signage_player::status", "{}", message);
    }

    fn trace(&mut self, message: &str) {
        debug!(target: "signage_player::status", "{}", message);
    }
}

/// Keeps the latest snapshot as a JSON file for a local dashboard.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusSink for JsonFileSink {
    fn snapshot(&mut self, snapshot: &StatusSnapshot) {
        let written = serde_json::to_string_pretty(&snapshot.to_status_map())
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(&self.path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            error!(path = %self.path.display(), "writing status: {}", e);
        }
    }

    fn played(&mut self, _report: &PlayReport) {}

    fn error(&mut self, _message: &str) {}

    fn trace(&mut self, _message: &str) {}
}

/// Everything a `MemorySink` saw. Shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    pub snapshots: Vec<StatusSnapshot>,
    pub played: Vec<PlayReport>,
    pub errors: Vec<String>,
    pub traces: Vec<String>,
}

/// Collects status in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MemoryLog {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, f: impl FnOnce(&mut MemoryLog)) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

impl StatusSink for MemorySink {
    fn snapshot(&mut self, snapshot: &StatusSnapshot) {
        self.push(|l| l.snapshots.push(snapshot.clone()));
    }

    fn played(&mut self, report: &PlayReport) {
        self.push(|l| l.played.push(report.clone()));
    }

    fn error(&mut self, message: &str) {
        self.push(|l| l.errors.push(message.to_string()));
    }

    fn trace(&mut self, message: &str) {
        self.push(|l| l.traces.push(message.to_string()));
    }
}

// --- Rate limiting ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Pass,
    /// First message over the limit: send a notice instead.
    Notice,
    Drop,
}

/// Allows `limit` messages per window, then drops the rest of the window.
#[derive(Debug, Clone)]
pub struct BurstLimiter {
    limit: u32,
    window: Duration,
    window_start: Option<NaiveDateTime>,
    count: u32,
}

impl BurstLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        BurstLimiter {
            limit,
            window,
            window_start: None,
            count: 0,
        }
    }

    pub fn admit(&mut self, now: NaiveDateTime) -> Admit {
        let expired = match self.window_start {
            Some(start) => (now - start).to_std().unwrap_or_default() >= self.window,
            None => true,
        };
        if expired {
            self.window_start = Some(now);
            self.count = 0;
        }
        self.count += 1;
        if self.count <= self.limit {
            Admit::Pass
        } else if self.count == self.limit + 1 {
            Admit::Notice
        } else {
            Admit::Drop
        }
    }
}

/// Front end for a sink: rate limits messages and remembers the last error
/// and the last play report for snapshots. Goes silent after a fatal error.
pub struct StatusReporter {
    sink: Box<dyn StatusSink>,
    errors: BurstLimiter,
    traces: BurstLimiter,
    pub last_error: Option<(String, NaiveDateTime)>,
    pub last_played: Option<PlayReport>,
    halted: bool,
}

impl StatusReporter {
    pub fn new(sink: Box<dyn StatusSink>) -> Self {
        StatusReporter {
            sink,
            errors: BurstLimiter::new(ERROR_BURST_LIMIT, BURST_WINDOW),
            traces: BurstLimiter::new(TRACE_BURST_LIMIT, BURST_WINDOW),
            last_error: None,
            last_played: None,
            halted: false,
        }
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn error(&mut self, now: NaiveDateTime, message: &str) {
        error!("{}", message);
        self.last_error = Some((message.to_string(), now));
        match self.errors.admit(now) {
            Admit::Pass => self.sink.error(message),
            Admit::Notice => self
                .sink
                .error("errors are happening too fast, pausing logging for 20 seconds"),
            Admit::Drop => {}
        }
    }

    pub fn trace(&mut self, now: NaiveDateTime, message: &str) {
        debug!("{}", message);
        match self.traces.admit(now) {
            Admit::Pass => self.sink.trace(message),
            Admit::Notice => self
                .sink
                .trace("traces are happening too fast, pausing tracing for 20 seconds"),
            Admit::Drop => {}
        }
    }

    pub fn played(&mut self, report: PlayReport) {
        self.sink.played(&report);
        self.last_played = Some(report);
    }

    pub fn snapshot(&mut self, snapshot: &StatusSnapshot) {
        if self.halted {
            return;
        }
        self.sink.snapshot(snapshot);
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("last_error", &self.last_error)
            .field("last_played", &self.last_played)
            .field("halted", &self.halted)
            .finish()
    }
}
