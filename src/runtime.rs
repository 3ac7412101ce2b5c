//! PlayerRuntime: dedicated engine thread with channel-based command dispatch.
//!
//! The `Program` (and the renderer and status sink it owns) lives on a single
//! thread, so none of them need to be `Send` once built. External code talks
//! to it through `PlayerHandle`, a clonable wrapper around
//! `mpsc::Sender<PlayerCmd>`. Timers fire inside the loop: the thread sleeps in
//! `recv_timeout` until the next due timer or the next command.

use crate::clock::Clock;
use crate::config::PlayerConfig;
use crate::error::Result;
use crate::local_content::LocalContentSource;
use crate::playlist::ItemRef;
use crate::program::Program;
use crate::schedule::ScheduleDocument;
use crate::status::StatusSnapshot;
use chrono::NaiveDateTime;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Longest sleep between clock checks.
pub const IDLE_WAIT: Duration = Duration::from_millis(50);

// ── Commands & Events ────────────────────────────────────────────────────────

/// Commands sent to the engine thread.
pub enum PlayerCmd {
    MediaPlaying(ItemRef),
    MediaEnded(ItemRef),
    MediaError(ItemRef, String),
    /// Swap in a new schedule document if its version differs.
    Reload(Box<ScheduleDocument>),
    /// Reply with the current status snapshot.
    Snapshot(mpsc::Sender<StatusSnapshot>),
    Shutdown,
}

/// Events emitted by the engine thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Started { program: String },
    StartFailed(String),
    Reloaded { version: String },
    ReloadFailed(String),
    Stopped,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe handle for sending commands to the engine thread.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCmd>,
}

impl PlayerHandle {
    pub fn media_playing(&self, item: ItemRef) {
        let _ = self.tx.send(PlayerCmd::MediaPlaying(item));
    }

    pub fn media_ended(&self, item: ItemRef) {
        let _ = self.tx.send(PlayerCmd::MediaEnded(item));
    }

    pub fn media_error(&self, item: ItemRef, message: impl Into<String>) {
        let _ = self.tx.send(PlayerCmd::MediaError(item, message.into()));
    }

    pub fn reload(&self, doc: ScheduleDocument) {
        let _ = self.tx.send(PlayerCmd::Reload(Box::new(doc)));
    }

    /// Current status, or None if the thread is gone.
    pub fn snapshot(&self, timeout: Duration) -> Option<StatusSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.tx.send(PlayerCmd::Snapshot(tx)).ok()?;
        rx.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PlayerCmd::Shutdown);
    }
}

/// What the thread needs besides the program: where time comes from and how
/// to rebuild on reload.
pub struct RuntimeContext {
    pub clock: Box<dyn Clock>,
    pub config: PlayerConfig,
    pub local: Box<dyn LocalContentSource + Send>,
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Spawn the engine on a dedicated thread.
///
/// `build` runs on the new thread with the clock's current time and returns
/// the program to play. `on_event` is called from the engine thread.
pub fn spawn_player_runtime<B, F>(ctx: RuntimeContext, build: B, on_event: F) -> Result<PlayerHandle>
where
    B: FnOnce(NaiveDateTime) -> Result<Program> + Send + 'static,
    F: Fn(RuntimeEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<PlayerCmd>();

    std::thread::Builder::new()
        .name("player-runtime".into())
        .spawn(move || {
            let program = match build(ctx.clock.now()) {
                Ok(p) => p,
                Err(e) => {
                    error!("cannot build program: {}", e);
                    on_event(RuntimeEvent::StartFailed(e.to_string()));
                    return;
                }
            };
            player_thread_loop(rx, ctx, program, on_event);
        })?;

    Ok(PlayerHandle { tx })
}

/// Main loop for the engine thread. Owns the Program.
fn player_thread_loop<F>(rx: mpsc::Receiver<PlayerCmd>, ctx: RuntimeContext, mut program: Program, on_event: F)
where
    F: Fn(RuntimeEvent),
{
    program.start();
    info!(program = %program.name(), "player runtime started");
    on_event(RuntimeEvent::Started {
        program: program.name().to_string(),
    });

    loop {
        let now = ctx.clock.now();
        program.run_until(now);
        let wait = program
            .next_due()
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(cmd) => {
                program.run_until(ctx.clock.now());
                match cmd {
                    PlayerCmd::MediaPlaying(item) => program.media_playing(item),
                    PlayerCmd::MediaEnded(item) => program.media_ended(item),
                    PlayerCmd::MediaError(item, message) => program.media_error(item, &message),
                    PlayerCmd::Reload(doc) => {
                        match program.reload(&doc, &ctx.config, ctx.local.as_ref()) {
                            Ok(true) => on_event(RuntimeEvent::Reloaded {
                                version: doc.version.clone(),
                            }),
                            Ok(false) => debug!(version = %doc.version, "reload skipped"),
                            Err(e) => {
                                error!("reload failed: {}", e);
                                on_event(RuntimeEvent::ReloadFailed(e.to_string()));
                            }
                        }
                    }
                    PlayerCmd::Snapshot(reply) => {
                        let _ = reply.send(program.snapshot());
                    }
                    PlayerCmd::Shutdown => break,
                }
            }

            Err(mpsc::RecvTimeoutError::Timeout) => {}

            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // All senders dropped
                break;
            }
        }
    }

    program.shutdown();
    info!("player runtime stopped");
    on_event(RuntimeEvent::Stopped);
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content::{ContentItem, ContentKind};
    use crate::local_content::MemoryLocalContent;
    use crate::playlist::{Playlist, PlaylistId};
    use crate::render::RecordingRenderer;
    use crate::schedule::BuiltProgram;
    use crate::status::MemorySink;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn context(clock: &ManualClock) -> RuntimeContext {
        RuntimeContext {
            clock: Box::new(clock.clone()),
            config: PlayerConfig::default(),
            local: Box::new(MemoryLocalContent::new()),
        }
    }

    fn spawn(
        clock: &ManualClock,
        renderer: &RecordingRenderer,
    ) -> (PlayerHandle, Arc<Mutex<Vec<RuntimeEvent>>>) {
        let events: Arc<Mutex<Vec<RuntimeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let renderer = renderer.clone();
        let handle = spawn_player_runtime(
            context(clock),
            move |now| {
                let items = vec![
                    ContentItem::new("a", "a.png", ContentKind::Still),
                    ContentItem::new("b", "b.png", ContentKind::Still),
                ];
                let built = BuiltProgram {
                    name: "lobby".into(),
                    playlists: vec![Playlist::new(PlaylistId(0), "main", items)],
                    problems: Vec::new(),
                };
                Ok(Program::new(
                    built,
                    &PlayerConfig::default(),
                    Box::new(renderer),
                    Box::new(MemorySink::new()),
                    now,
                ))
            },
            move |evt| events_clone.lock().unwrap().push(evt),
        )
        .unwrap();
        (handle, events)
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PlayerHandle>();
    }

    #[test]
    fn shutdown_stops_thread() {
        let clock = ManualClock::new(noon());
        let renderer = RecordingRenderer::new();
        let (handle, events) = spawn(&clock, &renderer);
        handle.shutdown();
        assert!(wait_for(|| events.lock().unwrap().contains(&RuntimeEvent::Stopped)));
    }

    #[test]
    fn media_ended_advances_playlist() {
        let clock = ManualClock::new(noon());
        let renderer = RecordingRenderer::new();
        let (handle, _events) = spawn(&clock, &renderer);
        assert!(wait_for(|| renderer.started_files() == vec!["a.png"]));
        handle.media_ended(ItemRef::new(PlaylistId(0), 0));
        assert!(wait_for(|| renderer.started_files() == vec!["a.png", "b.png"]));
        handle.shutdown();
    }

    #[test]
    fn snapshot_round_trips_through_thread() {
        let clock = ManualClock::new(noon());
        let renderer = RecordingRenderer::new();
        let (handle, _events) = spawn(&clock, &renderer);
        assert!(wait_for(|| !renderer.started_files().is_empty()));
        let snap = handle.snapshot(Duration::from_secs(1)).unwrap();
        assert_eq!(snap.program, "lobby");
        assert_eq!(snap.currently_playing.get("main").map(String::as_str), Some("a.png"));
        handle.shutdown();
    }

    #[test]
    fn failed_build_reports_and_exits() {
        let clock = ManualClock::new(noon());
        let events: Arc<Mutex<Vec<RuntimeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handle = spawn_player_runtime(
            context(&clock),
            |_| Err(crate::error::Error::NotFound("program".into())),
            move |evt| events_clone.lock().unwrap().push(evt),
        )
        .unwrap();
        assert!(wait_for(|| events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, RuntimeEvent::StartFailed(_)))));
        handle.shutdown();
    }
}
