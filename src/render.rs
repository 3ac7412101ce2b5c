use crate::content::ContentItem;
use crate::error::{Error, Result};
use crate::playlist::ItemRef;
use crate::region::RegionId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Answer to a "still playing?" poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Playing,
    Ended,
    /// The backend is gone. Fatal for its renderer family.
    Unavailable,
}

/// What to put where.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub item: ItemRef,
    pub content: &'a ContentItem,
    pub region: RegionId,
    pub full_screen: bool,
}

/// Presentation backend. Media end and errors come back asynchronously
/// through `Program::media_ended` and `Program::media_error`.
pub trait Renderer {
    fn start(&mut self, req: &RenderRequest<'_>) -> Result<()>;
    fn pause(&mut self, item: ItemRef);
    fn resume(&mut self, item: ItemRef);
    fn stop(&mut self, item: ItemRef);
    /// Clear the region after a transition moved away from it.
    fn cleanup(&mut self, item: ItemRef, region: RegionId);
    fn is_playing(&mut self, item: ItemRef) -> Liveness;

    fn set_background_audio(&mut self, _audible: bool) {}

    fn show_full_screen(&mut self, _visible: bool) {}

    /// Some backends can only run a transition once a video is actually
    /// playing. They call `Program::media_playing` when it is.
    fn defers_video_transition(&self) -> bool {
        false
    }
}

/// Renders nothing, logs every call.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn start(&mut self, req: &RenderRequest<'_>) -> Result<()> {
        info!(
            source = %req.content.source(),
            kind = %req.content.content_type(),
            region = req.region.0,
            full_screen = req.full_screen,
            "render"
        );
        Ok(())
    }

    fn pause(&mut self, item: ItemRef) {
        info!(playlist = item.playlist.0, index = item.index, "render pause");
    }

    fn resume(&mut self, item: ItemRef) {
        info!(playlist = item.playlist.0, index = item.index, "render resume");
    }

    fn stop(&mut self, item: ItemRef) {
        info!(playlist = item.playlist.0, index = item.index, "render stop");
    }

    fn cleanup(&mut self, _item: ItemRef, region: RegionId) {
        info!(region = region.0, "render cleanup");
    }

    fn is_playing(&mut self, _item: ItemRef) -> Liveness {
        Liveness::Playing
    }
}

// --- Recording renderer ---

/// One call made on a `RecordingRenderer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Start {
        item: ItemRef,
        file: String,
        region: RegionId,
        full_screen: bool,
    },
    Pause(ItemRef),
    Resume(ItemRef),
    Stop(ItemRef),
    Cleanup(ItemRef, RegionId),
    BackgroundAudio(bool),
    FullScreen(bool),
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<RenderCall>,
    failing: HashSet<String>,
    liveness: HashMap<String, Liveness>,
    files: HashMap<ItemRef, String>,
    defer_video: bool,
}

/// Renderer that remembers what it was asked to do. Clones share the record,
/// so a test can keep one while the program owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recording) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.with(|r| r.calls.clone())
    }

    pub fn clear(&self) {
        self.with(|r| r.calls.clear());
    }

    /// Files passed to `start`, in order.
    pub fn started_files(&self) -> Vec<String> {
        self.with(|r| {
            r.calls
                .iter()
                .filter_map(|c| match c {
                    RenderCall::Start { file, .. } => Some(file.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    /// Make `start` fail for this file.
    pub fn fail_on(&self, file: &str) {
        self.with(|r| {
            r.failing.insert(file.to_string());
        });
    }

    /// Answer liveness polls for this file with `answer`.
    pub fn set_liveness(&self, file: &str, answer: Liveness) {
        self.with(|r| {
            r.liveness.insert(file.to_string(), answer);
        });
    }

    pub fn set_defers_video_transition(&self, defer: bool) {
        self.with(|r| r.defer_video = defer);
    }
}

impl Renderer for RecordingRenderer {
    fn start(&mut self, req: &RenderRequest<'_>) -> Result<()> {
        let file = req.content.source();
        self.with(|r| {
            r.calls.push(RenderCall::Start {
                item: req.item,
                file: file.clone(),
                region: req.region,
                full_screen: req.full_screen,
            });
            r.files.insert(req.item, file.clone());
            if r.failing.contains(&file) {
                Err(Error::Render(format!("cannot open {}", file)))
            } else {
                Ok(())
            }
        })
    }

    fn pause(&mut self, item: ItemRef) {
        self.with(|r| r.calls.push(RenderCall::Pause(item)));
    }

    fn resume(&mut self, item: ItemRef) {
        self.with(|r| r.calls.push(RenderCall::Resume(item)));
    }

    fn stop(&mut self, item: ItemRef) {
        self.with(|r| r.calls.push(RenderCall::Stop(item)));
    }

    fn cleanup(&mut self, item: ItemRef, region: RegionId) {
        self.with(|r| r.calls.push(RenderCall::Cleanup(item, region)));
    }

    fn is_playing(&mut self, item: ItemRef) -> Liveness {
        self.with(|r| {
            r.files
                .get(&item)
                .and_then(|f| r.liveness.get(f).copied())
                .unwrap_or(Liveness::Playing)
        })
    }

    fn set_background_audio(&mut self, audible: bool) {
        self.with(|r| r.calls.push(RenderCall::BackgroundAudio(audible)));
    }

    fn show_full_screen(&mut self, visible: bool) {
        self.with(|r| r.calls.push(RenderCall::FullScreen(visible)));
    }

    fn defers_video_transition(&self) -> bool {
        self.with(|r| r.defer_video)
    }
}
