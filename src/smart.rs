use crate::error::{Error, Result};
use crate::playlist::PlaylistId;
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// Parse "HH:MM:SS" into seconds since midnight.
pub fn parse_time_of_day(s: &str) -> Result<u32> {
    let time = NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
        .map_err(|_| Error::InvalidTime(s.to_string()))?;
    // chrono accepts a leap second; a wall-clock schedule does not.
    if time.nanosecond() >= 1_000_000_000 {
        return Err(Error::InvalidTime(s.to_string()));
    }
    Ok(time.num_seconds_from_midnight())
}

/// Seconds since local midnight.
pub fn time_of_day(now: NaiveDateTime) -> u32 {
    now.time().num_seconds_from_midnight()
}

/// Render seconds since midnight as "HH:MM:SS".
pub fn format_time_of_day(secs: u32) -> String {
    let secs = secs % SECONDS_PER_DAY;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

// --- Time windows ---

/// A `<time>` entry of a smart block as written in the schedule document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDoc {
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_count: Option<u32>,
    #[serde(default)]
    pub full_screen: bool,
}

/// Daily window during which a schedule replaces its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Seconds since midnight.
    pub start: u32,
    pub duration: u32,
    /// Passes to play before handing back. Zero means no limit.
    pub play_count: u32,
    pub full_screen: bool,
}

impl TimeWindow {
    /// Build a window. Without an `end`, a non-zero `play_count` is required
    /// and the window runs from `start` until the time of day `now_tod`.
    pub fn from_doc(doc: &WindowDoc, now_tod: u32) -> Result<Self> {
        let (end, play_count) = match (&doc.end, doc.play_count) {
            (Some(end), _) => (parse_time_of_day(end)?, 0),
            (None, Some(count)) if count > 0 => (now_tod, count),
            (None, _) => {
                return Err(Error::Schedule(format!(
                    "time window starting {} needs an end or a play_count",
                    doc.start
                )));
            }
        };
        let mut window = TimeWindow {
            start: parse_time_of_day(&doc.start)?,
            duration: 0,
            play_count,
            full_screen: doc.full_screen,
        };
        window.duration = window.interval_from_start(end);
        Ok(window)
    }

    /// Seconds from the window start forward to `tod`, wrapping at midnight.
    pub fn interval_from_start(&self, tod: u32) -> u32 {
        (tod % SECONDS_PER_DAY + SECONDS_PER_DAY - self.start) % SECONDS_PER_DAY
    }

    pub fn is_active(&self, tod: u32) -> bool {
        self.interval_from_start(tod) < self.duration
    }

    /// Close a play-count window at `tod` so it does not start again until
    /// its next occurrence.
    pub fn reset_play_count(&mut self, tod: u32) {
        if self.play_count > 0 {
            self.duration = self.interval_from_start(tod);
        }
    }
}

// --- Schedules ---

/// Binding of a playlist to the target it replaces during its windows.
#[derive(Debug, Clone)]
pub struct SmartSchedule {
    pub target: String,
    pub windows: Vec<TimeWindow>,
    /// Passes left before the schedule stops itself. Zero means unbounded.
    pub remaining_play_count: u32,
    /// Set when the play count ran out or the resolver stopped it.
    pub stopped: bool,
}

impl SmartSchedule {
    pub fn new(target: impl Into<String>, windows: Vec<TimeWindow>) -> Self {
        SmartSchedule {
            target: target.into(),
            windows,
            remaining_play_count: 0,
            stopped: false,
        }
    }

    /// First window active at `tod`.
    pub fn active_window(&self, tod: u32) -> Option<usize> {
        self.windows.iter().position(|w| w.is_active(tod))
    }

    pub fn reset_windows(&mut self, tod: u32) {
        for window in &mut self.windows {
            window.reset_play_count(tod);
        }
    }
}

// --- Resolver ---

/// What the resolver needs to know about one schedule at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleView {
    pub schedule: PlaylistId,
    pub target: PlaylistId,
    /// The schedule currently holds its target's regions.
    pub running: bool,
    pub self_stopped: bool,
    pub active_window: Option<usize>,
    /// The target is currently controlled by some schedule.
    pub target_overridden: bool,
}

impl ScheduleView {
    pub fn should_run(&self) -> bool {
        !(self.running && self.self_stopped) && self.active_window.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideAction {
    Start {
        schedule: PlaylistId,
        target: PlaylistId,
        window: usize,
    },
    Stop {
        schedule: PlaylistId,
        target: PlaylistId,
    },
}

/// Decide a whole resolver pass from a snapshot. Stops come first and free
/// their targets; starts are then granted in iteration order, so when two
/// schedules want the same target in one pass the first one checked wins.
pub fn resolve(views: &[ScheduleView]) -> Vec<OverrideAction> {
    let mut actions = Vec::new();
    let mut claimed: HashSet<PlaylistId> = views
        .iter()
        .filter(|v| v.target_overridden)
        .map(|v| v.target)
        .collect();

    for v in views {
        if v.running && !v.should_run() {
            claimed.remove(&v.target);
            actions.push(OverrideAction::Stop {
                schedule: v.schedule,
                target: v.target,
            });
        }
    }

    for v in views {
        if v.running || !v.should_run() {
            continue;
        }
        let Some(window) = v.active_window else {
            continue;
        };
        if !claimed.insert(v.target) {
            debug!(
                schedule = v.schedule.0,
                target = v.target.0,
                "target already overridden, not starting"
            );
            continue;
        }
        actions.push(OverrideAction::Start {
            schedule: v.schedule,
            target: v.target,
            window,
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hms(h: u32, m: u32, s: u32) -> u32 {
        h * 3600 + m * 60 + s
    }

    fn window(start: &str, end: &str) -> TimeWindow {
        TimeWindow::from_doc(
            &WindowDoc {
                start: start.into(),
                end: Some(end.into()),
                play_count: None,
                full_screen: false,
            },
            0,
        )
        .unwrap()
    }

    fn view(schedule: usize, target: usize) -> ScheduleView {
        ScheduleView {
            schedule: PlaylistId(schedule),
            target: PlaylistId(target),
            running: false,
            self_stopped: false,
            active_window: None,
            target_overridden: false,
        }
    }

    // --- Time parsing tests ---

    #[test]
    fn parse_time_of_day_valid() {
        assert_eq!(parse_time_of_day("00:00:00").unwrap(), 0);
        assert_eq!(parse_time_of_day("13:45:10").unwrap(), hms(13, 45, 10));
        assert_eq!(parse_time_of_day(" 23:59:59 ").unwrap(), hms(23, 59, 59));
    }

    #[test]
    fn parse_time_of_day_rejects_out_of_range() {
        assert!(parse_time_of_day("24:00:00").is_err());
        assert!(parse_time_of_day("12:60:00").is_err());
        assert!(parse_time_of_day("12:00:60").is_err());
        assert!(parse_time_of_day("12:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn format_time_of_day_pads() {
        assert_eq!(format_time_of_day(hms(7, 5, 3)), "07:05:03");
    }

    // --- Window tests ---

    #[test]
    fn window_with_end() {
        let w = window("08:00:00", "09:30:00");
        assert_eq!(w.duration, 5400);
        assert!(!w.is_active(hms(7, 59, 59)));
        assert!(w.is_active(hms(8, 0, 0)));
        assert!(w.is_active(hms(9, 29, 59)));
        assert!(!w.is_active(hms(9, 30, 0)));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let mut w = window("23:59:50", "00:00:00");
        w.duration = 20;
        assert!(w.is_active(hms(0, 0, 5)));
        assert!(!w.is_active(hms(0, 0, 11)));
        assert!(w.is_active(hms(23, 59, 55)));
    }

    #[test]
    fn play_count_window_ends_at_construction_time() {
        let doc = WindowDoc {
            start: "10:00:00".into(),
            end: None,
            play_count: Some(2),
            full_screen: true,
        };
        let w = TimeWindow::from_doc(&doc, hms(9, 0, 0)).unwrap();
        assert_eq!(w.play_count, 2);
        assert!(w.full_screen);
        assert_eq!(w.duration, SECONDS_PER_DAY - 3600);
        assert!(w.is_active(hms(10, 0, 0)));
        assert!(!w.is_active(hms(9, 0, 0)));
    }

    #[test]
    fn window_without_end_or_count_is_rejected() {
        let doc = WindowDoc {
            start: "10:00:00".into(),
            end: None,
            play_count: Some(0),
            full_screen: false,
        };
        assert!(TimeWindow::from_doc(&doc, 0).is_err());
    }

    #[test]
    fn reset_play_count_closes_window_at_now() {
        let doc = WindowDoc {
            start: "10:00:00".into(),
            end: None,
            play_count: Some(1),
            full_screen: false,
        };
        let mut w = TimeWindow::from_doc(&doc, hms(9, 0, 0)).unwrap();
        w.reset_play_count(hms(10, 5, 0));
        assert_eq!(w.duration, 300);
        assert!(!w.is_active(hms(10, 5, 1)));
        assert!(w.is_active(hms(10, 4, 0)));
    }

    #[test]
    fn reset_leaves_end_windows_alone() {
        let mut w = window("08:00:00", "09:00:00");
        w.reset_play_count(hms(8, 10, 0));
        assert_eq!(w.duration, 3600);
    }

    #[test]
    fn active_window_picks_first_match() {
        let s = SmartSchedule::new(
            "main",
            vec![window("08:00:00", "10:00:00"), window("09:00:00", "11:00:00")],
        );
        assert_eq!(s.active_window(hms(9, 30, 0)), Some(0));
        assert_eq!(s.active_window(hms(10, 30, 0)), Some(1));
        assert_eq!(s.active_window(hms(12, 0, 0)), None);
    }

    // --- Resolver tests ---

    #[test]
    fn resolve_starts_active_idle_schedule() {
        let mut v = view(1, 0);
        v.active_window = Some(0);
        assert_eq!(
            resolve(&[v]),
            vec![OverrideAction::Start {
                schedule: PlaylistId(1),
                target: PlaylistId(0),
                window: 0
            }]
        );
    }

    #[test]
    fn resolve_leaves_running_active_schedule() {
        let mut v = view(1, 0);
        v.active_window = Some(0);
        v.running = true;
        v.target_overridden = true;
        assert!(resolve(&[v]).is_empty());
    }

    #[test]
    fn resolve_stops_exhausted_schedule_even_inside_window() {
        let mut v = view(1, 0);
        v.active_window = Some(0);
        v.running = true;
        v.self_stopped = true;
        v.target_overridden = true;
        assert_eq!(
            resolve(&[v]),
            vec![OverrideAction::Stop {
                schedule: PlaylistId(1),
                target: PlaylistId(0)
            }]
        );
    }

    #[test]
    fn resolve_first_checked_wins() {
        let mut first = view(1, 0);
        first.active_window = Some(0);
        let mut second = view(2, 0);
        second.active_window = Some(0);
        let actions = resolve(&[first, second]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            OverrideAction::Start {
                schedule: PlaylistId(1),
                ..
            }
        ));
    }

    #[test]
    fn resolve_refuses_target_held_by_other() {
        let mut holder = view(1, 0);
        holder.running = true;
        holder.active_window = Some(0);
        holder.target_overridden = true;
        let mut other = view(2, 0);
        other.active_window = Some(0);
        other.target_overridden = true;
        assert!(resolve(&[holder, other]).is_empty());
    }

    #[test]
    fn resolve_hands_over_within_one_pass() {
        let mut leaving = view(2, 0);
        leaving.running = true;
        leaving.target_overridden = true;
        let mut arriving = view(1, 0);
        arriving.active_window = Some(0);
        arriving.target_overridden = true;
        let actions = resolve(&[arriving, leaving]);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], OverrideAction::Stop { .. }));
        assert!(matches!(actions[1], OverrideAction::Start { .. }));
    }
}
