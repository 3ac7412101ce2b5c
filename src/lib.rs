//! signage_player: playback scheduling engine for digital signage screens.
//!
//! Playlists, time-windowed schedules, the full-screen claim and the timer
//! queue that drives them live here. Rendering and status delivery sit behind
//! traits; the `signage` CLI and `runtime` thread consume this crate.

pub mod clock;
pub mod config;
pub mod content;
pub mod error;
pub mod fullscreen;
pub mod local_content;
pub mod playlist;
pub mod program;
pub mod region;
pub mod render;
pub mod runtime;
pub mod schedule;
pub mod smart;
pub mod status;
pub mod timer;
pub mod transition;
