use crate::playlist::ItemRef;

/// Opaque display slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub usize);

/// The two alternating buffers of a playlist region. `current` may point at a
/// full-screen region while a full-screen item plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPair {
    pub a: RegionId,
    pub b: RegionId,
    pub current: RegionId,
    pub last: RegionId,
}

impl BufferPair {
    pub fn new(a: RegionId, b: RegionId) -> Self {
        BufferPair {
            a,
            b,
            current: a,
            last: b,
        }
    }

    /// Hand the current buffer over to `last` and pick the other buffer.
    /// Anything other than `a` (including a full-screen region) is followed by `a`.
    pub fn swap(&mut self) {
        self.last = self.current;
        self.current = if self.current == self.a { self.b } else { self.a };
    }
}

#[derive(Debug, Clone)]
struct RegionSlot {
    name: String,
    occupant: Option<ItemRef>,
}

/// Every region the program knows about, with the item last started in it.
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    slots: Vec<RegionSlot>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>) -> RegionId {
        self.slots.push(RegionSlot {
            name: name.into(),
            occupant: None,
        });
        RegionId(self.slots.len() - 1)
    }

    /// Allocate the A/B pair for a playlist named `name`.
    pub fn add_pair(&mut self, name: &str) -> BufferPair {
        let a = self.add(format!("{}/A", name));
        let b = self.add(format!("{}/B", name));
        BufferPair::new(a, b)
    }

    pub fn name(&self, id: RegionId) -> Option<&str> {
        self.slots.get(id.0).map(|s| s.name.as_str())
    }

    pub fn occupant(&self, id: RegionId) -> Option<ItemRef> {
        self.slots.get(id.0).and_then(|s| s.occupant)
    }

    /// Record `item` as the content of `id`. Returns the previous occupant.
    pub fn occupy(&mut self, id: RegionId, item: ItemRef) -> Option<ItemRef> {
        self.slots
            .get_mut(id.0)
            .and_then(|s| s.occupant.replace(item))
    }

    pub fn vacate(&mut self, id: RegionId) -> Option<ItemRef> {
        self.slots.get_mut(id.0).and_then(|s| s.occupant.take())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::PlaylistId;

    #[test]
    fn swap_alternates() {
        let mut pair = BufferPair::new(RegionId(0), RegionId(1));
        assert_eq!(pair.current, RegionId(0));
        pair.swap();
        assert_eq!((pair.current, pair.last), (RegionId(1), RegionId(0)));
        pair.swap();
        assert_eq!((pair.current, pair.last), (RegionId(0), RegionId(1)));
    }

    #[test]
    fn swap_from_full_screen_returns_to_a() {
        let mut pair = BufferPair::new(RegionId(2), RegionId(3));
        pair.current = RegionId(0);
        pair.swap();
        assert_eq!(pair.last, RegionId(0));
        assert_eq!(pair.current, RegionId(2));
    }

    #[test]
    fn occupancy_tracks_previous() {
        let mut table = RegionTable::new();
        let pair = table.add_pair("main");
        assert_eq!(table.name(pair.b), Some("main/B"));
        let first = ItemRef::new(PlaylistId(0), 0);
        let second = ItemRef::new(PlaylistId(0), 1);
        assert_eq!(table.occupy(pair.a, first), None);
        assert_eq!(table.occupy(pair.a, second), Some(first));
        assert_eq!(table.vacate(pair.a), Some(second));
        assert_eq!(table.occupant(pair.a), None);
    }
}
