//! Deduplicating k-way merge of several pack indices into one sorted stream,
//! the construction engine behind the multi-pack index.
//!
//! Pack order is significant: on duplicate object ids across packs, the
//! earliest pack in the order wins. The iterators expose a single mutable
//! entry that is overwritten on each advance — the merge touches every
//! object in every pack, and per-entry heap allocation is not acceptable at
//! that scale. Callers must copy an entry if they retain it.

use crate::{hash::ObjectHash, internal::pack::index::PackIndex};

/// The current entry of a merge iterator. Overwritten in place on every
/// advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergedEntry {
    pub hash: ObjectHash,
    pub pack_id: u32,
    pub offset: u64,
    pub crc32: u32,
}

impl Default for MergedEntry {
    fn default() -> Self {
        MergedEntry {
            hash: ObjectHash::default(),
            pack_id: 0,
            offset: 0,
            crc32: 0,
        }
    }
}

/// Deduplicating merger over an ordered set of pack indices.
///
/// Statistics are collected in a single pass at construction: unique object
/// count, per-pack selected counts, whether any offset exceeds 2^32-1
/// (forcing the large-offset chunk), and how many offsets exceed 2^31-1
/// (those migrate into the large-offset table).
pub struct PackIndexMerger<'a> {
    packs: Vec<(String, &'a PackIndex)>,
    unique_count: usize,
    needs_large_offsets_chunk: bool,
    offsets_over_31_bit_count: usize,
    selected_counts: Vec<usize>,
}

impl<'a> PackIndexMerger<'a> {
    pub fn new(packs: Vec<(String, &'a PackIndex)>) -> PackIndexMerger<'a> {
        let mut unique_count = 0;
        let mut needs_large_offsets_chunk = false;
        let mut offsets_over_31_bit_count = 0;
        let mut selected_counts = vec![0; packs.len()];
        {
            let mut iter = DedupMergeIter {
                raw: RawMergeIter {
                    packs: &packs,
                    positions: vec![0; packs.len()],
                    entry: MergedEntry::default(),
                },
                last: None,
            };
            while let Some(entry) = iter.next() {
                unique_count += 1;
                selected_counts[entry.pack_id as usize] += 1;
                if entry.offset > u32::MAX as u64 {
                    needs_large_offsets_chunk = true;
                }
                if entry.offset > 0x7FFF_FFFF {
                    offsets_over_31_bit_count += 1;
                }
            }
        }
        PackIndexMerger {
            packs,
            unique_count,
            needs_large_offsets_chunk,
            offsets_over_31_bit_count,
            selected_counts,
        }
    }

    /// Number of distinct object ids across all packs.
    pub fn unique_count(&self) -> usize {
        self.unique_count
    }

    /// True if any selected offset exceeds 2^32-1.
    pub fn needs_large_offsets_chunk(&self) -> bool {
        self.needs_large_offsets_chunk
    }

    /// Count of selected offsets above 2^31-1.
    pub fn offsets_over_31_bit_count(&self) -> usize {
        self.offsets_over_31_bit_count
    }

    /// Objects selected (won dedup) per pack, in pack order.
    pub fn selected_counts(&self) -> &[usize] {
        &self.selected_counts
    }

    /// Pack names in merge order; position = pack id.
    pub fn pack_names(&self) -> Vec<&str> {
        self.packs.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Merge stream including duplicates, in (id, pack order) order.
    pub fn raw_iter(&self) -> RawMergeIter<'_> {
        RawMergeIter {
            packs: &self.packs,
            positions: vec![0; self.packs.len()],
            entry: MergedEntry::default(),
        }
    }

    /// Merge stream yielding each id exactly once; first pack wins. The
    /// dedup layer remembers only the last-emitted id.
    pub fn by_id_iter(&self) -> DedupMergeIter<'_> {
        DedupMergeIter {
            raw: self.raw_iter(),
            last: None,
        }
    }
}

/// Raw merge iterator: yields every entry of every pack in sorted id order,
/// ties broken by lowest pack id. Lending: the returned reference points at
/// an entry reused on the next advance.
pub struct RawMergeIter<'a> {
    packs: &'a [(String, &'a PackIndex)],
    positions: Vec<usize>,
    entry: MergedEntry,
}

impl RawMergeIter<'_> {
    /// Advance to the next entry, overwriting and returning the shared one.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&MergedEntry> {
        let mut min_pack: Option<usize> = None;
        for (pack_id, (_, idx)) in self.packs.iter().enumerate() {
            let pos = self.positions[pack_id];
            if pos >= idx.object_count() {
                continue;
            }
            let candidate = idx.object_at(pos);
            let better = match min_pack {
                None => true,
                // Strict less-than keeps ties on the lowest pack id.
                Some(best) => candidate < self.packs[best].1.object_at(self.positions[best]),
            };
            if better {
                min_pack = Some(pack_id);
            }
        }
        let pack_id = min_pack?;
        let idx = self.packs[pack_id].1;
        let pos = self.positions[pack_id];
        self.positions[pack_id] += 1;
        self.entry = MergedEntry {
            hash: idx.object_at(pos),
            pack_id: pack_id as u32,
            offset: idx.offset_at(pos),
            crc32: idx.crc32_at(pos),
        };
        Some(&self.entry)
    }
}

/// Dedup layer over the raw merge: entries with the same id as the
/// previously emitted one are skipped.
pub struct DedupMergeIter<'a> {
    raw: RawMergeIter<'a>,
    last: Option<ObjectHash>,
}

impl DedupMergeIter<'_> {
    /// Advance to the next distinct id, overwriting and returning the
    /// shared entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&MergedEntry> {
        loop {
            let hash = self.raw.next()?.hash;
            if self.last != Some(hash) {
                self.last = Some(hash);
                return Some(&self.raw.entry);
            }
        }
    }
}
