use crate::content::ContentItem;
use crate::region::{BufferPair, RegionId};
use crate::smart::SmartSchedule;
use crate::timer::{TimerId, TimerQueue};
use crate::transition::{NullTransition, Transition};
use chrono::NaiveDateTime;
use std::time::Duration;

/// Index of a playlist inside its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaylistId(pub usize);

/// Address of one playable item: a playlist entry, or an item nested in a
/// placeholder entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub playlist: PlaylistId,
    pub index: usize,
    pub nested: Option<usize>,
}

impl ItemRef {
    pub fn new(playlist: PlaylistId, index: usize) -> Self {
        ItemRef {
            playlist,
            index,
            nested: None,
        }
    }

    pub fn nested(playlist: PlaylistId, index: usize, nested: usize) -> Self {
        ItemRef {
            playlist,
            index,
            nested: Some(nested),
        }
    }
}

/// The item that just finished, for the play report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub file: String,
    pub id: String,
}

/// Outcome of `Playlist::advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub finished: Option<Finished>,
    /// The index moved (false when a placeholder keeps its slot).
    pub moved: bool,
    pub wrapped: bool,
    /// A schedule just used up its last pass.
    pub exhausted: bool,
    /// Whether the caller should start the new current item.
    pub restart: bool,
}

/// Ordered items bound to a named region.
#[derive(Debug)]
pub struct Playlist {
    pub id: PlaylistId,
    pub name: String,
    pub items: Vec<ContentItem>,
    pub current_index: usize,
    /// Region buffers. A schedule only has these while it is running.
    pub buffers: Option<BufferPair>,
    pub last_full_screen: Option<RegionId>,
    pub full_screen_active: bool,
    /// Schedule currently controlling this playlist's regions.
    pub overridden_by: Option<PlaylistId>,
    pub smart: Option<SmartSchedule>,
    pub transition: Box<dyn Transition>,
    /// Remaining start stagger in milliseconds. May go negative.
    pub start_delay_ms: i64,
    pub started_at: Option<NaiveDateTime>,
    pub playing_file: Option<String>,
    pub start_timer: Option<TimerId>,
    pub transition_timer: Option<(TimerId, RegionId)>,
    /// Render failures in a row.
    pub failure_streak: usize,
}

impl Playlist {
    pub fn new(id: PlaylistId, name: impl Into<String>, items: Vec<ContentItem>) -> Self {
        Playlist {
            id,
            name: name.into(),
            items,
            current_index: 0,
            buffers: None,
            last_full_screen: None,
            full_screen_active: false,
            overridden_by: None,
            smart: None,
            transition: Box::new(NullTransition),
            start_delay_ms: 0,
            started_at: None,
            playing_file: None,
            start_timer: None,
            transition_timer: None,
            failure_streak: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_smart(&self) -> bool {
        self.smart.is_some()
    }

    /// A schedule is running while it holds its target's regions.
    pub fn is_running_override(&self) -> bool {
        self.smart.is_some() && self.buffers.is_some()
    }

    /// Records advances but does not start items: overridden, or a schedule
    /// that stopped.
    pub fn is_suppressed(&self) -> bool {
        self.overridden_by.is_some() || self.smart.as_ref().is_some_and(|s| s.stopped)
    }

    pub fn has_placeholder(&self) -> bool {
        self.items.iter().any(|i| i.is_placeholder())
    }

    pub fn current_item(&self) -> Option<&ContentItem> {
        self.items.get(self.current_index)
    }

    pub fn current_item_mut(&mut self) -> Option<&mut ContentItem> {
        self.items.get_mut(self.current_index)
    }

    /// The item actually on screen: the nested item for a placeholder.
    pub fn playing_ref(&self) -> Option<ItemRef> {
        let item = self.current_item()?;
        match item.placeholder() {
            Some(ph) => ph
                .current
                .map(|n| ItemRef::nested(self.id, self.current_index, n)),
            None => Some(ItemRef::new(self.id, self.current_index)),
        }
    }

    pub fn item(&self, r: ItemRef) -> Option<&ContentItem> {
        let item = self.items.get(r.index)?;
        match r.nested {
            Some(n) => item.placeholder()?.local.get(n),
            None => Some(item),
        }
    }

    pub fn item_mut(&mut self, r: ItemRef) -> Option<&mut ContentItem> {
        let item = self.items.get_mut(r.index)?;
        match r.nested {
            Some(n) => item.placeholder_mut()?.local.get_mut(n),
            None => Some(item),
        }
    }

    pub fn current_region(&self) -> Option<RegionId> {
        self.buffers.map(|b| b.current)
    }

    pub fn last_region(&self) -> Option<RegionId> {
        self.buffers.map(|b| b.last)
    }

    /// Consume one step of the start stagger. Returns the delay to wait
    /// before trying again, or None when the playlist may start now.
    pub fn take_start_step(&mut self, step: Duration) -> Option<Duration> {
        if self.start_delay_ms > 0 {
            self.start_delay_ms -= (step.as_millis() as i64).max(1);
            Some(step)
        } else {
            None
        }
    }

    /// Point `current` at a full-screen region, alternating between the two
    /// the arbiter offers.
    pub fn use_full_screen_region(&mut self, region: RegionId) {
        if let Some(b) = &mut self.buffers {
            b.current = region;
        }
        self.last_full_screen = Some(region);
    }

    /// Apply a window's full-screen flag to every item.
    pub fn set_full_screen(&mut self, full_screen: bool) {
        for item in &mut self.items {
            item.full_screen = full_screen;
        }
    }

    /// Move to the next item after the current one ended.
    ///
    /// A placeholder keeps its slot until it reaches its limit or its local
    /// list runs out. Passing the end wraps to the first item and counts a
    /// pass against a schedule's play count. Buffers always swap.
    pub fn advance<E>(&mut self, program_limit: Option<u32>, timers: &mut TimerQueue<E>) -> Advance {
        let suppressed = self.is_suppressed();
        let finished = self.current_item().and_then(|item| {
            let shown = match item.placeholder() {
                Some(ph) => ph.nested()?,
                None => item,
            };
            Some(Finished {
                file: shown.file.clone(),
                id: shown.id.clone(),
            })
        });

        let mut moved = true;
        if let Some(item) = self.items.get_mut(self.current_index) {
            if let Some(ph) = item.placeholder_mut() {
                moved = ph.reached_limit(program_limit) || ph.local.reached_end();
                if moved {
                    ph.count = 0;
                    if program_limit.is_none() && ph.limit == 0 && !suppressed {
                        ph.local.begin_pass();
                    }
                }
            }
            if moved && item.is_placeholder() {
                item.stop(timers);
            }
        }
        if moved {
            self.current_index += 1;
        }

        let mut wrapped = false;
        let mut exhausted = false;
        if self.current_index >= self.items.len() {
            self.current_index = 0;
            wrapped = true;
            if let Some(smart) = &mut self.smart {
                if smart.remaining_play_count > 0 {
                    smart.remaining_play_count -= 1;
                    if smart.remaining_play_count == 0 {
                        smart.stopped = true;
                        exhausted = true;
                    }
                }
            }
            if !self.is_suppressed() {
                for item in &mut self.items {
                    if let Some(ph) = item.placeholder_mut() {
                        ph.local.begin_pass();
                    }
                }
            }
        }

        if let Some(b) = &mut self.buffers {
            b.swap();
        }

        Advance {
            finished,
            moved,
            wrapped,
            exhausted,
            restart: !self.is_suppressed(),
        }
    }
}
