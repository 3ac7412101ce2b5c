//! Region hand-off timing. The visual effect belongs to the renderer; the
//! engine only needs to know when the outgoing region may be cleaned up.

use crate::region::RegionId;
use std::fmt;
use std::time::Duration;

/// Pause between placing the incoming content and starting the effect.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// Effects a renderer is expected to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Dissolve,
    SlideLeft,
    SlideRight,
    SlideUp,
    SlideDown,
    ZoomIn,
    ZoomOut,
    ScaleOut,
    Pop,
    Drop,
    Spin,
    BatSpin,
    Rolodex,
    Fall,
    Door,
}

impl Effect {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "dissolve" => Some(Effect::Dissolve),
            "slideleft" => Some(Effect::SlideLeft),
            "slideright" => Some(Effect::SlideRight),
            "slideup" => Some(Effect::SlideUp),
            "slidedown" => Some(Effect::SlideDown),
            "zoomin" => Some(Effect::ZoomIn),
            "zoomout" => Some(Effect::ZoomOut),
            "scaleout" => Some(Effect::ScaleOut),
            "pop" => Some(Effect::Pop),
            "drop" => Some(Effect::Drop),
            "spin" => Some(Effect::Spin),
            "batspin" => Some(Effect::BatSpin),
            "rolodex" => Some(Effect::Rolodex),
            "fall" => Some(Effect::Fall),
            "door" => Some(Effect::Door),
            _ => None,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Effect::Dissolve => "dissolve",
            Effect::SlideLeft => "slideleft",
            Effect::SlideRight => "slideright",
            Effect::SlideUp => "slideup",
            Effect::SlideDown => "slidedown",
            Effect::ZoomIn => "zoomin",
            Effect::ZoomOut => "zoomout",
            Effect::ScaleOut => "scaleout",
            Effect::Pop => "pop",
            Effect::Drop => "drop",
            Effect::Spin => "spin",
            Effect::BatSpin => "batspin",
            Effect::Rolodex => "rolodex",
            Effect::Fall => "fall",
            Effect::Door => "door",
        };
        write!(f, "{}", name)
    }
}

/// A region hand-off. `begin` returns how long until `transitionEnd` is due
/// for the outgoing region; zero means immediately.
pub trait Transition: fmt::Debug + Send {
    fn begin(&mut self, outgoing: RegionId, incoming: RegionId) -> Duration;

    /// Effect used by the most recent `begin`, if any.
    fn effect(&self) -> Option<Effect> {
        None
    }
}

/// Instant swap.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransition;

impl Transition for NullTransition {
    fn begin(&mut self, _outgoing: RegionId, _incoming: RegionId) -> Duration {
        Duration::ZERO
    }
}

/// Cycles through a list of effects, one per hand-off.
#[derive(Debug, Clone)]
pub struct RotatingTransition {
    effects: Vec<Effect>,
    next: usize,
    current: Option<Effect>,
    duration: Duration,
}

impl RotatingTransition {
    pub fn new(effects: Vec<Effect>, duration: Duration) -> Self {
        RotatingTransition {
            effects,
            next: 0,
            current: None,
            duration,
        }
    }
}

impl Transition for RotatingTransition {
    fn begin(&mut self, _outgoing: RegionId, _incoming: RegionId) -> Duration {
        if self.effects.is_empty() {
            return Duration::ZERO;
        }
        self.current = Some(self.effects[self.next]);
        self.next = (self.next + 1) % self.effects.len();
        SETTLE_DELAY + self.duration
    }

    fn effect(&self) -> Option<Effect> {
        self.current
    }
}

/// Build the transition for a playlist from a list such as
/// `"dissolve, slideleft"`. Unknown names are dropped; nothing usable gives
/// an instant swap.
pub fn from_names(names: &str, duration: Option<Duration>) -> Box<dyn Transition> {
    let effects: Vec<Effect> = names
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(Effect::from_str_loose)
        .collect();
    if effects.is_empty() {
        Box::new(NullTransition)
    } else {
        Box::new(RotatingTransition::new(
            effects,
            duration.unwrap_or(DEFAULT_DURATION),
        ))
    }
}
