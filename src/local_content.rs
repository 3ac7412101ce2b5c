//! Locally stored content pulled in by placeholder items.
//!
//! Each placeholder slot has a description file at
//! `localcontent/<slot>/description.json` listing the files in that slot and
//! their validity window.

use crate::content::{ContentItem, ContentKind, ContentType};
use crate::error::{Error, Result};
use crate::schedule::parse_datetime_loose;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

// --- Cursor ---

/// Ordered local items with a cursor that can resume mid-list on the next
/// pass of the parent playlist.
#[derive(Debug, Clone, Default)]
pub struct LocalContentList {
    items: Vec<ContentItem>,
    /// -1 before the first item.
    cursor: isize,
    wrap_pending: bool,
}

impl LocalContentList {
    pub fn new(items: Vec<ContentItem>) -> Self {
        LocalContentList {
            items,
            cursor: -1,
            wrap_pending: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> isize {
        self.cursor
    }

    pub fn get(&self, index: usize) -> Option<&ContentItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ContentItem> {
        self.items.get_mut(index)
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    /// Step to the next item. Wraps to the front only when a new pass asked
    /// to resume mid-list.
    pub fn next_index(&mut self) -> Option<usize> {
        let len = self.items.len() as isize;
        if self.cursor < len {
            self.cursor += 1;
        }
        if self.cursor >= len && self.wrap_pending {
            self.cursor = 0;
            self.wrap_pending = false;
        }
        if self.cursor >= len {
            None
        } else {
            Some(self.cursor as usize)
        }
    }

    /// Prepare for a new pass of the parent playlist. A list that was left
    /// partway through keeps its place and wraps once it runs out.
    pub fn begin_pass(&mut self) {
        let len = self.items.len() as isize;
        if self.cursor + 1 >= len || self.cursor == -1 {
            self.cursor = -1;
            self.wrap_pending = false;
        } else {
            self.wrap_pending = true;
        }
    }

    /// True once the last item has been handed out and no wrap is pending.
    pub fn reached_end(&self) -> bool {
        self.cursor + 1 >= self.items.len() as isize && !self.wrap_pending
    }
}

// --- Description documents ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalItemDoc {
    pub file: String,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalDescription {
    #[serde(default)]
    pub items: Vec<LocalItemDoc>,
}

impl LocalDescription {
    /// Turn the description into playable items. Entries outside their
    /// validity window or of a type that cannot play locally are left out.
    pub fn build(&self, slot: &str, now: NaiveDateTime) -> LocalContentList {
        let mut items = Vec::new();
        for (i, doc) in self.items.iter().enumerate() {
            if doc.file.is_empty() {
                continue;
            }
            let end = doc.end.as_deref().and_then(parse_datetime_loose);
            if matches!(end, Some(end) if now > end) {
                continue;
            }
            let start = doc.start.as_deref().and_then(parse_datetime_loose);
            if matches!(start, Some(start) if now < start) {
                continue;
            }
            let kind = match ContentType::from_str_loose(&doc.content_type) {
                Ok(ContentType::Video) => ContentKind::Video,
                Ok(ContentType::Still) => ContentKind::Still,
                Ok(ContentType::Flash) => ContentKind::Flash,
                Ok(ContentType::Html) => ContentKind::Html,
                _ => {
                    warn!(slot, kind = %doc.content_type, "unknown local content type");
                    continue;
                }
            };
            let file = format!("localcontent/{}/{}", slot, doc.file);
            items.push(
                ContentItem::new(format!("{}-{}", slot, i + 1), file, kind)
                    .with_duration(Duration::from_secs(doc.duration)),
            );
        }
        LocalContentList::new(items)
    }
}

// --- Sources ---

/// Where placeholder slots get their item lists from.
pub trait LocalContentSource {
    fn load(&self, slot: &str, now: NaiveDateTime) -> Result<LocalContentList>;
}

/// Reads `localcontent/<slot>/description.json` under a root directory.
#[derive(Debug, Clone)]
pub struct DirLocalContent {
    root: PathBuf,
}

impl DirLocalContent {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirLocalContent { root: root.into() }
    }

    pub fn description_path(&self, slot: &str) -> PathBuf {
        self.root
            .join("localcontent")
            .join(slot)
            .join("description.json")
    }
}

impl LocalContentSource for DirLocalContent {
    fn load(&self, slot: &str, now: NaiveDateTime) -> Result<LocalContentList> {
        let path = self.description_path(slot);
        let json = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "reading local content description {}: {}",
                path.display(),
                e
            ))
        })?;
        let description: LocalDescription = serde_json::from_str(&json)?;
        Ok(description.build(slot, now))
    }
}

/// In-memory slots, for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocalContent {
    slots: HashMap<String, LocalDescription>,
}

impl MemoryLocalContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: impl Into<String>, description: LocalDescription) {
        self.slots.insert(slot.into(), description);
    }
}

impl LocalContentSource for MemoryLocalContent {
    fn load(&self, slot: &str, now: NaiveDateTime) -> Result<LocalContentList> {
        match self.slots.get(slot) {
            Some(description) => Ok(description.build(slot, now)),
            None => Err(Error::NotFound(format!("local content slot '{}'", slot))),
        }
    }
}
