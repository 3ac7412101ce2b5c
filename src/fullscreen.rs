use crate::playlist::PlaylistId;
use crate::region::RegionId;
use tracing::debug;

/// The single program-wide full-screen claim and the two regions full-screen
/// items alternate between.
#[derive(Debug, Clone)]
pub struct FullScreenArbiter {
    owner: Option<PlaylistId>,
    regions: (RegionId, RegionId),
    waiting: Vec<PlaylistId>,
}

impl FullScreenArbiter {
    pub fn new(a: RegionId, b: RegionId) -> Self {
        FullScreenArbiter {
            owner: None,
            regions: (a, b),
            waiting: Vec::new(),
        }
    }

    pub fn owner(&self) -> Option<PlaylistId> {
        self.owner
    }

    pub fn regions(&self) -> (RegionId, RegionId) {
        self.regions
    }

    /// The full-screen region to use after `last`.
    pub fn next_region(&self, last: Option<RegionId>) -> RegionId {
        if last == Some(self.regions.0) {
            self.regions.1
        } else {
            self.regions.0
        }
    }

    /// Take the claim. Returns false when another playlist holds it.
    pub fn acquire(&mut self, id: PlaylistId) -> bool {
        match self.owner {
            Some(owner) if owner != id => false,
            _ => {
                self.owner = Some(id);
                self.waiting.retain(|w| *w != id);
                debug!(playlist = id.0, "full-screen acquired");
                true
            }
        }
    }

    /// Take the claim from a holder that no longer controls its regions.
    /// Returns the previous owner. Waiters stay queued.
    pub fn take_over(&mut self, id: PlaylistId) -> Option<PlaylistId> {
        let previous = self.owner.replace(id);
        self.waiting.retain(|w| *w != id);
        debug!(playlist = id.0, previous = ?previous.map(|p| p.0), "full-screen acquired");
        previous
    }

    /// Drop the claim if `id` holds it. Returns the playlists that were
    /// waiting for it, in arrival order.
    pub fn release(&mut self, id: PlaylistId) -> Vec<PlaylistId> {
        if self.owner != Some(id) {
            return Vec::new();
        }
        self.owner = None;
        debug!(playlist = id.0, "full-screen released");
        std::mem::take(&mut self.waiting)
    }

    /// Move a held claim to another playlist.
    pub fn transfer(&mut self, from: PlaylistId, to: PlaylistId) -> bool {
        if self.owner == Some(from) {
            self.owner = Some(to);
            true
        } else {
            false
        }
    }

    /// Queue `id` to be retried when the claim is released.
    pub fn wait(&mut self, id: PlaylistId) {
        if !self.waiting.contains(&id) {
            self.waiting.push(id);
        }
    }

    pub fn waiting(&self) -> &[PlaylistId] {
        &self.waiting
    }

    pub fn clear(&mut self) {
        self.owner = None;
        self.waiting.clear();
    }
}
