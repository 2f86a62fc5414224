//! Pack index (`.idx` version 2) reader and writer.
//!
//! The index is the sorted map from object id to byte offset within one
//! pack: a 256-entry fan-out over the first id byte, the id table at hash
//! stride, per-entry CRC32, 31-bit offsets with an overflow table for
//! larger packs, and trailing pack/index hashes. Follows the
//! [pack-format spec](https://git-scm.com/docs/pack-format).

use std::io::{Cursor, Write};

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::{ObjectHash, get_hash_kind},
    utils::{HashAlgorithm, read_bytes, read_sha, read_u32_be, read_u64_be},
};

const IDX_MAGIC: [u8; 4] = [0xFF, 0x74, 0x4F, 0x63];
const IDX_VERSION: u32 = 2;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// One `(id, crc32, offset)` triple of a pack index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: ObjectHash,
    pub crc32: u32,
    pub offset: u64, // 64-bit because offsets may exceed 32-bit
}

/// Parsed pack index. Immutable after open; the index never owns the pack
/// file it describes.
pub struct PackIndex {
    fanout: [u32; 256],
    names: Vec<u8>,
    crc32: Vec<u32>,
    offsets: Vec<u32>,
    large_offsets: Vec<u64>,
    pack_hash: ObjectHash,
    index_hash: ObjectHash,
    hash_len: usize,
}

impl PackIndex {
    /// Parse a v2 `.idx` byte buffer.
    pub fn from_bytes(data: &[u8]) -> Result<PackIndex, GitError> {
        let hash_len = get_hash_kind().size();
        let mut cur = Cursor::new(data);

        let magic = read_bytes(&mut cur, 4)?;
        if magic != IDX_MAGIC {
            return Err(GitError::InvalidIdxFile(format!(
                "bad magic {:02x?}",
                magic
            )));
        }
        let version = read_u32_be(&mut cur)?;
        if version != IDX_VERSION {
            return Err(GitError::InvalidIdxFile(format!(
                "unsupported version {version}"
            )));
        }

        let mut fanout = [0u32; 256];
        let mut prev = 0u32;
        for (i, slot) in fanout.iter_mut().enumerate() {
            let v = read_u32_be(&mut cur)?;
            if i > 0 && v < prev {
                return Err(GitError::InvalidIdxFile(format!(
                    "fanout not monotone at bucket {i}"
                )));
            }
            prev = v;
            *slot = v;
        }
        let count = fanout[255] as usize;

        let names = read_bytes(&mut cur, count * hash_len)?;
        let mut crc32 = Vec::with_capacity(count);
        for _ in 0..count {
            crc32.push(read_u32_be(&mut cur)?);
        }
        let mut offsets = Vec::with_capacity(count);
        let mut large_count = 0usize;
        for _ in 0..count {
            let raw = read_u32_be(&mut cur)?;
            if raw & LARGE_OFFSET_FLAG != 0 {
                large_count += 1;
            }
            offsets.push(raw);
        }
        let mut large_offsets = Vec::with_capacity(large_count);
        for _ in 0..large_count {
            large_offsets.push(read_u64_be(&mut cur)?);
        }
        for raw in &offsets {
            if raw & LARGE_OFFSET_FLAG != 0 {
                let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
                if slot >= large_offsets.len() {
                    return Err(GitError::InvalidIdxFile(format!(
                        "large offset slot {slot} out of range"
                    )));
                }
            }
        }

        let pack_hash = read_sha(&mut cur)?;
        let index_hash = read_sha(&mut cur)?;

        Ok(PackIndex {
            fanout,
            names,
            crc32,
            offsets,
            large_offsets,
            pack_hash,
            index_hash,
            hash_len,
        })
    }

    /// Number of objects covered, `fanout[255]`.
    pub fn object_count(&self) -> usize {
        self.fanout[255] as usize
    }

    /// Trailing hash of the pack this index describes.
    pub fn pack_hash(&self) -> ObjectHash {
        self.pack_hash
    }

    /// Trailing hash of the index file itself.
    pub fn index_hash(&self) -> ObjectHash {
        self.index_hash
    }

    /// Dense position of `id` in the sorted table, or `None`.
    ///
    /// Fan-out narrows the search to one first-byte bucket; a binary search
    /// at hash stride finishes in O(log bucket).
    pub fn find_position(&self, id: &ObjectHash) -> Option<usize> {
        let bucket = id.first_byte() as usize;
        let mut lo = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let mut hi = self.fanout[bucket] as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match id.cmp_bytes_at(&self.names, mid * self.hash_len) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
            }
        }
        None
    }

    /// Pack byte offset of `id`, or `None` if the pack lacks it.
    pub fn find_offset(&self, id: &ObjectHash) -> Option<u64> {
        self.find_position(id).map(|pos| self.offset_at(pos))
    }

    /// Version 2 indices always carry per-entry CRC32.
    pub fn has_crc32(&self) -> bool {
        true
    }

    /// Stored CRC32 of `id`'s pack entry; an absent id is an error in a
    /// CRC-bearing index.
    pub fn find_crc32(&self, id: &ObjectHash) -> Result<u32, GitError> {
        self.find_position(id)
            .map(|pos| self.crc32[pos])
            .ok_or_else(|| GitError::NotFoundHashValue(id.to_string()))
    }

    /// Materialize the id stored at a dense position.
    pub fn object_at(&self, pos: usize) -> ObjectHash {
        let start = pos * self.hash_len;
        ObjectHash::from_bytes(&self.names[start..start + self.hash_len])
            .expect("name table slot width matches the configured hash")
    }

    /// Offset stored at a dense position, resolving large-offset slots.
    pub fn offset_at(&self, pos: usize) -> u64 {
        let raw = self.offsets[pos];
        if raw & LARGE_OFFSET_FLAG != 0 {
            self.large_offsets[(raw & !LARGE_OFFSET_FLAG) as usize]
        } else {
            raw as u64
        }
    }

    /// CRC32 stored at a dense position.
    pub fn crc32_at(&self, pos: usize) -> u32 {
        self.crc32[pos]
    }

    /// Sorted traversal in id order.
    pub fn iter(&self) -> Entries<'_> {
        Entries { idx: self, pos: 0 }
    }
}

/// Iterator over index entries in sorted id order.
pub struct Entries<'a> {
    idx: &'a PackIndex,
    pos: usize,
}

impl Iterator for Entries<'_> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        if self.pos >= self.idx.object_count() {
            return None;
        }
        let pos = self.pos;
        self.pos += 1;
        Some(IndexEntry {
            hash: self.idx.object_at(pos),
            crc32: self.idx.crc32_at(pos),
            offset: self.idx.offset_at(pos),
        })
    }
}

/// Writer emitting the v2 `.idx` byte format: header, fan-out, names, CRCs,
/// offsets with overflow markers, large-offset table, then pack hash and a
/// trailing hash of the whole file.
pub struct PackIndexWriter;

impl PackIndexWriter {
    /// Write `entries` (any order) as a v2 index for the pack identified by
    /// `pack_hash`. Returns the trailing index hash.
    pub fn write(
        mut entries: Vec<IndexEntry>,
        pack_hash: ObjectHash,
        out: &mut impl Write,
    ) -> Result<ObjectHash, GitError> {
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));

        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&IDX_MAGIC);
        buf.write_u32::<BigEndian>(IDX_VERSION)?;

        let mut fanout = [0u32; 256];
        for entry in &entries {
            fanout[entry.hash.first_byte() as usize] += 1;
        }
        for i in 1..fanout.len() {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            buf.write_u32::<BigEndian>(count)?;
        }

        for entry in &entries {
            buf.extend_from_slice(entry.hash.as_ref());
        }
        for entry in &entries {
            buf.write_u32::<BigEndian>(entry.crc32)?;
        }

        let mut large: Vec<u64> = Vec::new();
        for entry in &entries {
            if entry.offset <= 0x7FFF_FFFF {
                buf.write_u32::<BigEndian>(entry.offset as u32)?;
            } else {
                buf.write_u32::<BigEndian>(LARGE_OFFSET_FLAG | large.len() as u32)?;
                large.push(entry.offset);
            }
        }
        for offset in large {
            buf.write_u64::<BigEndian>(offset)?;
        }

        buf.extend_from_slice(pack_hash.as_ref());

        let mut hasher = HashAlgorithm::new();
        hasher.update(&buf);
        let index_hash = hasher.clone_finalize();
        buf.extend_from_slice(index_hash.as_ref());

        out.write_all(&buf)?;
        Ok(index_hash)
    }
}
