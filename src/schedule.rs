use crate::config::EngineSettings;
use crate::content::{ContentItem, ContentKind, ContentType, Placeholder};
use crate::error::{Error, Result};
use crate::local_content::{LocalContentList, LocalContentSource};
use crate::playlist::{Playlist, PlaylistId};
use crate::smart::{time_of_day, SmartSchedule, TimeWindow, WindowDoc};
use crate::transition;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

// --- Document ---

/// A schedule as delivered by the control process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub programs: Vec<ProgramDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDoc {
    pub name: String,
    #[serde(default)]
    pub playlists: Vec<PlaylistDoc>,
    #[serde(default)]
    pub smart: Vec<SmartDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistDoc {
    pub name: String,
    /// Effect names separated by commas or spaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_duration: Option<f64>,
    #[serde(default)]
    pub items: Vec<ItemDoc>,
}

/// A playlist that replaces `playlist` during its time windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartDoc {
    pub playlist: String,
    #[serde(default)]
    pub times: Vec<WindowDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_duration: Option<f64>,
    #[serde(default)]
    pub items: Vec<ItemDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemDoc {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub id: String,
    /// Seconds. Zero plays until the renderer reports the end.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub fullscreen: bool,
    /// First day the item may play, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Last day the item may play, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(default)]
    pub limit: u32,
}

impl ScheduleDocument {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Schedule(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Find a program by name (case-insensitive), or the first one.
    pub fn program(&self, name: Option<&str>) -> Result<&ProgramDoc> {
        match name {
            Some(name) => {
                let lower = name.to_lowercase();
                self.programs
                    .iter()
                    .find(|p| p.name.to_lowercase() == lower)
                    .ok_or_else(|| Error::NotFound(format!("program '{}'", name)))
            }
            None => self
                .programs
                .first()
                .ok_or_else(|| Error::Schedule("schedule has no programs".into())),
        }
    }
}

// --- Dates ---

/// Leading `YYYY-MM-DD` of a string.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_and_remainder(s.trim(), "%Y-%m-%d")
        .ok()
        .map(|(d, _)| d)
}

/// Date-time in any of the forms schedules use. A bare date means midnight.
pub fn parse_datetime_loose(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

impl ItemDoc {
    /// Whether `start`/`expire` allow playing at `now`. Expiry is inclusive of
    /// the whole day. Unparsable dates are ignored.
    pub fn is_current(&self, now: NaiveDateTime) -> bool {
        if let Some(expire) = self.expire.as_deref().and_then(parse_date) {
            let end_of_day = expire.and_hms_opt(23, 59, 59).unwrap_or_else(|| expire.and_time(NaiveTime::MIN));
            if now > end_of_day {
                return false;
            }
        }
        if let Some(start) = self.start.as_deref().and_then(parse_date) {
            if now < start.and_time(NaiveTime::MIN) {
                return false;
            }
        }
        true
    }

    /// Build the content item. Placeholders load their slot from `local`.
    pub fn to_item(
        &self,
        fallback_id: &str,
        now: NaiveDateTime,
        local: &dyn LocalContentSource,
        problems: &mut Vec<String>,
    ) -> Result<ContentItem> {
        let id = if self.id.is_empty() { fallback_id.to_string() } else { self.id.clone() };
        let kind = match ContentType::from_str_loose(&self.content_type)
            .map_err(Error::Schedule)?
        {
            ContentType::Video => ContentKind::Video,
            ContentType::Still => ContentKind::Still,
            ContentType::Flash => ContentKind::Flash,
            ContentType::Html => ContentKind::Html,
            ContentType::Audio => ContentKind::Audio,
            ContentType::VideoStream => ContentKind::VideoStream {
                address: self
                    .address
                    .clone()
                    .ok_or_else(|| Error::Schedule(format!("stream item {} has no address", id)))?,
                port: self
                    .port
                    .ok_or_else(|| Error::Schedule(format!("stream item {} has no port", id)))?,
            },
            ContentType::Placeholder => {
                let slot = match &self.slot {
                    Some(slot) if !slot.is_empty() => slot.clone(),
                    _ => id.clone(),
                };
                let list = local.load(&slot, now).unwrap_or_else(|e| {
                    problems.push(format!("ERROR reading local content for slot {}: {}", slot, e));
                    LocalContentList::default()
                });
                ContentKind::Placeholder(Box::new(Placeholder::new(slot, self.limit, list)))
            }
        };
        Ok(ContentItem::new(id, self.file.clone(), kind)
            .with_duration(Duration::from_secs(self.duration))
            .with_full_screen(self.fullscreen))
    }
}

// --- Building ---

/// Playlists built from one program of a schedule, plus everything that was
/// wrong with it.
#[derive(Debug)]
pub struct BuiltProgram {
    pub name: String,
    /// Normal playlists first, then schedules. Index == `PlaylistId`.
    pub playlists: Vec<Playlist>,
    pub problems: Vec<String>,
}

fn build_items(
    docs: &[ItemDoc],
    playlist: &str,
    now: NaiveDateTime,
    local: &dyn LocalContentSource,
    problems: &mut Vec<String>,
) -> Vec<ContentItem> {
    let mut items = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if !doc.is_current(now) {
            continue;
        }
        match doc.to_item(&(i + 1).to_string(), now, local, problems) {
            Ok(item) => items.push(item),
            Err(e) => problems.push(format!("playlist {}: {}", playlist, e)),
        }
    }
    if items.is_empty() {
        problems.push(format!("ERROR: empty playlist {}", playlist));
    }
    items
}

fn transition_for(names: Option<&str>, secs: Option<f64>) -> Box<dyn transition::Transition> {
    let duration = secs
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64);
    transition::from_names(names.unwrap_or(""), duration)
}

fn start_delay(items: &[ContentItem], settings: &EngineSettings) -> i64 {
    if items.iter().any(|i| i.is_placeholder()) {
        settings.placeholder_start_delay_ms as i64
    } else {
        settings.initial_start_delay_ms as i64
    }
}

impl ProgramDoc {
    /// Turn this program into playlists as of `now`.
    pub fn build(
        &self,
        now: NaiveDateTime,
        settings: &EngineSettings,
        local: &dyn LocalContentSource,
    ) -> BuiltProgram {
        let mut problems = Vec::new();
        let mut playlists: Vec<Playlist> = Vec::new();

        for doc in &self.playlists {
            if playlists.iter().any(|p| p.name == doc.name) {
                problems.push(format!("duplicate playlist {} ignored", doc.name));
                continue;
            }
            let items = build_items(&doc.items, &doc.name, now, local, &mut problems);
            let mut pl = Playlist::new(PlaylistId(playlists.len()), doc.name.clone(), items);
            pl.start_delay_ms = start_delay(&pl.items, settings);
            pl.transition = transition_for(doc.transition.as_deref(), doc.transition_duration);
            playlists.push(pl);
        }

        let tod = time_of_day(now);
        for doc in &self.smart {
            if !playlists.iter().any(|p| p.name == doc.playlist && !p.is_smart()) {
                problems.push(format!("smart playlist target {} not found", doc.playlist));
                continue;
            }
            if doc.times.is_empty() {
                problems.push(format!("smart playlist for {} has no time windows", doc.playlist));
                continue;
            }
            let windows: Result<Vec<TimeWindow>> =
                doc.times.iter().map(|w| TimeWindow::from_doc(w, tod)).collect();
            let windows = match windows {
                Ok(w) => w,
                Err(e) => {
                    problems.push(format!("smart playlist for {} ignored: {}", doc.playlist, e));
                    continue;
                }
            };
            let items = build_items(&doc.items, &doc.playlist, now, local, &mut problems);
            // A schedule with nothing to play must never take over its target.
            if items.is_empty() {
                problems.push(format!("smart playlist for {} ignored: nothing to play", doc.playlist));
                continue;
            }
            let mut pl = Playlist::new(PlaylistId(playlists.len()), doc.playlist.clone(), items);
            pl.start_delay_ms = start_delay(&pl.items, settings);
            pl.transition = transition_for(doc.transition.as_deref(), doc.transition_duration);
            pl.smart = Some(SmartSchedule::new(doc.playlist.clone(), windows));
            playlists.push(pl);
        }

        BuiltProgram {
            name: self.name.clone(),
            playlists,
            problems,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_content::{LocalDescription, LocalItemDoc, MemoryLocalContent};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn item(kind: &str, file: &str) -> ItemDoc {
        ItemDoc {
            content_type: kind.into(),
            file: file.into(),
            duration: 10,
            ..Default::default()
        }
    }

    fn window(start: &str, end: &str) -> WindowDoc {
        WindowDoc {
            start: start.into(),
            end: Some(end.into()),
            play_count: None,
            full_screen: false,
        }
    }

    fn build(doc: &ProgramDoc) -> BuiltProgram {
        doc.build(
            at(2024, 4, 10, 12, 0, 0),
            &EngineSettings::default(),
            &MemoryLocalContent::new(),
        )
    }

    // --- Date tests ---

    #[test]
    fn parse_date_takes_leading_date() {
        assert_eq!(parse_date("2024-04-10"), NaiveDate::from_ymd_opt(2024, 4, 10));
        assert_eq!(parse_date("2024-04-10T08:00:00"), NaiveDate::from_ymd_opt(2024, 4, 10));
        assert_eq!(parse_date("April"), None);
    }

    #[test]
    fn parse_datetime_loose_forms() {
        assert_eq!(
            parse_datetime_loose("2024-04-10T08:30:00"),
            Some(at(2024, 4, 10, 8, 30, 0))
        );
        assert_eq!(
            parse_datetime_loose("2024-04-10 08:30:15"),
            Some(at(2024, 4, 10, 8, 30, 15))
        );
        assert_eq!(parse_datetime_loose("2024-04-10"), Some(at(2024, 4, 10, 0, 0, 0)));
        assert!(parse_datetime_loose("2024-04-10T08:30:00+02:00").is_some());
        assert_eq!(parse_datetime_loose("tomorrow"), None);
    }

    #[test]
    fn expire_includes_whole_day() {
        let mut doc = item("still", "a.png");
        doc.expire = Some("2024-04-10".into());
        assert!(doc.is_current(at(2024, 4, 10, 23, 59, 59)));
        assert!(!doc.is_current(at(2024, 4, 11, 0, 0, 0)));
    }

    #[test]
    fn start_begins_at_midnight() {
        let mut doc = item("still", "a.png");
        doc.start = Some("2024-04-10".into());
        assert!(!doc.is_current(at(2024, 4, 9, 23, 59, 59)));
        assert!(doc.is_current(at(2024, 4, 10, 0, 0, 0)));
    }

    // --- Item tests ---

    #[test]
    fn to_item_stream_needs_address() {
        let mut problems = Vec::new();
        let local = MemoryLocalContent::new();
        let now = at(2024, 4, 10, 12, 0, 0);
        let mut doc = item("stream", "");
        assert!(doc.to_item("1", now, &local, &mut problems).is_err());
        doc.address = Some("239.1.1.1".into());
        doc.port = Some(5000);
        let built = doc.to_item("1", now, &local, &mut problems).unwrap();
        assert_eq!(built.source(), "udp://@239.1.1.1:5000");
    }

    #[test]
    fn to_item_placeholder_uses_slot_or_id() {
        let mut local = MemoryLocalContent::new();
        local.insert(
            "lobby",
            LocalDescription {
                items: vec![LocalItemDoc {
                    file: "x.png".into(),
                    content_type: "still".into(),
                    duration: 3,
                    start: None,
                    end: None,
                }],
            },
        );
        let mut problems = Vec::new();
        let now = at(2024, 4, 10, 12, 0, 0);
        let mut doc = item("placeholder", "");
        doc.slot = Some("lobby".into());
        doc.limit = 2;
        let built = doc.to_item("9", now, &local, &mut problems).unwrap();
        let ph = built.placeholder().unwrap();
        assert_eq!(ph.limit, 2);
        assert_eq!(ph.local.len(), 1);
        assert!(problems.is_empty());

        doc.slot = None;
        let missing = doc.to_item("9", now, &local, &mut problems).unwrap();
        assert_eq!(missing.placeholder().unwrap().slot, "9");
        assert!(missing.placeholder().unwrap().local.is_empty());
        assert_eq!(problems.len(), 1);
    }

    // --- Build tests ---

    #[test]
    fn build_skips_duplicates_and_unknown_types() {
        let doc = ProgramDoc {
            name: "lobby".into(),
            playlists: vec![
                PlaylistDoc {
                    name: "main".into(),
                    items: vec![item("video", "a.mp4"), item("gif", "b.gif")],
                    ..Default::default()
                },
                PlaylistDoc {
                    name: "main".into(),
                    items: vec![item("still", "c.png")],
                    ..Default::default()
                },
            ],
            smart: vec![],
        };
        let built = build(&doc);
        assert_eq!(built.playlists.len(), 1);
        assert_eq!(built.playlists[0].len(), 1);
        assert_eq!(built.problems.len(), 2);
    }

    #[test]
    fn build_keeps_empty_playlist_inert() {
        let doc = ProgramDoc {
            name: "lobby".into(),
            playlists: vec![PlaylistDoc {
                name: "side".into(),
                items: vec![],
                ..Default::default()
            }],
            smart: vec![],
        };
        let built = build(&doc);
        assert_eq!(built.playlists.len(), 1);
        assert!(built.playlists[0].is_empty());
        assert!(built.problems[0].contains("empty playlist"));
    }

    #[test]
    fn build_binds_smart_playlists() {
        let doc = ProgramDoc {
            name: "lobby".into(),
            playlists: vec![PlaylistDoc {
                name: "main".into(),
                items: vec![item("still", "a.png")],
                ..Default::default()
            }],
            smart: vec![
                SmartDoc {
                    playlist: "main".into(),
                    times: vec![window("08:00:00", "09:00:00")],
                    items: vec![item("still", "promo.png")],
                    ..Default::default()
                },
                SmartDoc {
                    playlist: "ghost".into(),
                    times: vec![window("08:00:00", "09:00:00")],
                    items: vec![item("still", "x.png")],
                    ..Default::default()
                },
                SmartDoc {
                    playlist: "main".into(),
                    times: vec![window("08:00:00", "25:00:00")],
                    items: vec![item("still", "y.png")],
                    ..Default::default()
                },
            ],
        };
        let built = build(&doc);
        assert_eq!(built.playlists.len(), 2);
        let smart = &built.playlists[1];
        assert_eq!(smart.id, PlaylistId(1));
        assert_eq!(smart.name, "main");
        assert_eq!(smart.smart.as_ref().unwrap().windows[0].duration, 3600);
        assert!(smart.buffers.is_none());
        assert_eq!(built.problems.len(), 2);
    }

    #[test]
    fn build_drops_smart_block_with_no_current_items() {
        let mut expired = item("still", "old.png");
        expired.expire = Some("2000-01-01".into());
        let doc = ProgramDoc {
            name: "lobby".into(),
            playlists: vec![PlaylistDoc {
                name: "main".into(),
                items: vec![item("still", "a.png")],
                ..Default::default()
            }],
            smart: vec![SmartDoc {
                playlist: "main".into(),
                times: vec![window("08:00:00", "09:00:00")],
                items: vec![expired],
                ..Default::default()
            }],
        };
        let built = build(&doc);
        assert_eq!(built.playlists.len(), 1);
        assert!(!built.playlists[0].is_smart());
        assert!(built.problems.iter().any(|p| p.contains("nothing to play")));
    }

    #[test]
    fn build_sets_start_delays_and_transitions() {
        let doc = ProgramDoc {
            name: "lobby".into(),
            playlists: vec![
                PlaylistDoc {
                    name: "main".into(),
                    transition: Some("dissolve".into()),
                    transition_duration: Some(2.0),
                    items: vec![item("still", "a.png")],
                },
                PlaylistDoc {
                    name: "local".into(),
                    items: vec![item("placeholder", "")],
                    ..Default::default()
                },
            ],
            smart: vec![],
        };
        let mut built = build(&doc);
        assert_eq!(built.playlists[0].start_delay_ms, 10);
        assert_eq!(built.playlists[1].start_delay_ms, 700);
        let d = built.playlists[0]
            .transition
            .begin(crate::region::RegionId(0), crate::region::RegionId(1));
        assert_eq!(d, Duration::from_millis(2100));
    }

    #[test]
    fn document_program_lookup() {
        let doc = ScheduleDocument::from_json_str(
            r#"{"version":"3","programs":[{"name":"Lobby"},{"name":"Cafe"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.program(Some("cafe")).unwrap().name, "Cafe");
        assert_eq!(doc.program(None).unwrap().name, "Lobby");
        assert!(matches!(doc.program(Some("bar")), Err(Error::NotFound(_))));
    }

    #[test]
    fn document_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        let doc = ScheduleDocument {
            version: "12".into(),
            programs: vec![ProgramDoc {
                name: "lobby".into(),
                playlists: vec![],
                smart: vec![],
            }],
        };
        doc.save(&path).unwrap();
        let loaded = ScheduleDocument::load(&path).unwrap();
        assert_eq!(loaded.version, "12");
        assert_eq!(loaded.programs[0].name, "lobby");
    }
}
