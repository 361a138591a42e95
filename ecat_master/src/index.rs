//! Entry ordering index.
//!
//! Maps `(position, object index, sub-index)` to a slot of the cyclic table
//! so that by-key reads and writes resolve in O(1). Built once after domain
//! registration and read-only afterwards.

use std::collections::HashMap;
use tracing::warn;

/// Composite address `position << 24 | index << 8 | subindex`.
///
/// The three fields occupy disjoint bit ranges (sub-index bits 0..8, index
/// bits 8..24, position bits 24..40), so the composition is injective for
/// every `u16` position, `u16` index and `u8` sub-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(u64);

impl EntryKey {
    /// Compose a key.
    pub const fn new(position: u16, index: u16, subindex: u8) -> Self {
        Self(((position as u64) << 24) | ((index as u64) << 8) | subindex as u64)
    }

    /// Raw composite value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Split back into `(position, index, subindex)`.
    pub const fn parts(&self) -> (u16, u16, u8) {
        ((self.0 >> 24) as u16, (self.0 >> 8) as u16, self.0 as u8)
    }
}

/// Key → slot lookup.
#[derive(Debug, Default)]
pub struct EntryIndex {
    slots: HashMap<EntryKey, usize>,
}

impl EntryIndex {
    /// Build from `(key, slot)` pairs. A repeated key keeps its first slot.
    pub fn build<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (EntryKey, usize)>,
    {
        let pairs = pairs.into_iter();
        let mut slots = HashMap::with_capacity(pairs.size_hint().0);
        for (key, slot) in pairs {
            if let Some(first) = slots.get(&key) {
                let (position, index, subindex) = key.parts();
                warn!(
                    "Duplicate cyclic entry {position}:0x{index:04x}:{subindex:02x} \
                     (slot {slot}), keeping slot {first}"
                );
                continue;
            }
            slots.insert(key, slot);
        }
        Self { slots }
    }

    /// Slot of `key`, if registered.
    pub fn lookup(&self, key: EntryKey) -> Option<usize> {
        self.slots.get(&key).copied()
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
    use std::collections::HashSet;

    #[test]
    fn key_layout() {
        assert_eq!(EntryKey::new(1, 0x7000, 0x02).raw(), 0x0170_0002);
        assert_eq!(EntryKey::new(0x0102, 0, 0).raw(), 0x01_0200_0000);
        assert_eq!(EntryKey::new(0, 0, 0).raw(), 0);
    }

    #[test]
    fn key_parts_round_trip_at_boundaries() {
        for position in [0u16, 1, 255, 256, u16::MAX] {
            for index in [0u16, 1, 0x6000, 0xFFFF] {
                for subindex in [0u8, 1, 0x80, 0xFF] {
                    let key = EntryKey::new(position, index, subindex);
                    assert_eq!(key.parts(), (position, index, subindex));
                }
            }
        }
    }

    #[test]
    fn keys_do_not_collide_across_fields() {
        // Neighbouring triples that a narrower packing would merge.
        let triples = [
            (0u16, 0x0100u16, 0u8),
            (1, 0x0000, 0),
            (0, 0x0001, 0),
            (0, 0x0000, 1),
            (0, 0xFFFF, 0xFF),
            (0, 0x0100, 0xFF),
            (255, 0xFFFF, 0xFF),
            (256, 0x0000, 0x00),
        ];
        let keys: HashSet<_> = triples.iter().map(|&(p, i, s)| EntryKey::new(p, i, s)).collect();
        assert_eq!(keys.len(), triples.len());
    }

    #[test]
    fn keys_injective_over_position_and_subindex_grid() {
        let mut seen = HashSet::new();
        for position in 0u16..256 {
            for subindex in 0u8..=255 {
                assert!(seen.insert(EntryKey::new(position, 0x6000, subindex)));
            }
        }
        assert_eq!(seen.len(), 256 * 256);
    }

    #[test]
    fn lookup_hits_and_misses() {
        let index = EntryIndex::build([
            (EntryKey::new(0, 0x7000, 1), 0),
            (EntryKey::new(0, 0x6000, 1), 1),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup(EntryKey::new(0, 0x6000, 1)), Some(1));
        assert_eq!(index.lookup(EntryKey::new(1, 0x6000, 1)), None);
    }

    #[test]
    fn duplicate_key_keeps_first_slot() {
        let key = EntryKey::new(2, 0x6000, 1);
        let index = EntryIndex::build([(key, 4), (key, 9)]);
        assert_eq!(index.lookup(key), Some(4));
        assert_eq!(index.len(), 1);
    }
}
