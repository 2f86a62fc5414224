//! Multi-pack index (MIDX): one ordered keyspace over many packs.
//!
//! The file is a fixed header, a chunk lookup table, the chunks themselves
//! (`PNAM` pack names, `OIDF` fan-out, `OIDL` id table, `OOFF` pack-id +
//! offset pairs, `LOFF` large offsets, `RIDX` reverse index, `BTMP` per-pack
//! bitmap ranges), and a trailing content hash. Construction is a
//! deduplicating k-way merge over the member pack indices; the earliest
//! pack wins duplicate ids.

use std::collections::HashMap;
use std::io::{Cursor, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    errors::GitError,
    hash::{HashKind, IdPrefix, ObjectHash, get_hash_kind},
    internal::pack::{index::PackIndex, merger::PackIndexMerger},
    utils::{HashAlgorithm, read_bytes},
};

const MIDX_MAGIC: [u8; 4] = *b"MIDX";
const MIDX_VERSION: u8 = 1;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

const CHUNK_PNAM: u32 = u32::from_be_bytes(*b"PNAM");
const CHUNK_OIDF: u32 = u32::from_be_bytes(*b"OIDF");
const CHUNK_OIDL: u32 = u32::from_be_bytes(*b"OIDL");
const CHUNK_OOFF: u32 = u32::from_be_bytes(*b"OOFF");
const CHUNK_LOFF: u32 = u32::from_be_bytes(*b"LOFF");
const CHUNK_RIDX: u32 = u32::from_be_bytes(*b"RIDX");
const CHUNK_BTMP: u32 = u32::from_be_bytes(*b"BTMP");

fn oid_version(kind: HashKind) -> u8 {
    match kind {
        HashKind::Sha1 => 1,
        HashKind::Sha256 => 2,
    }
}

/// Location of an object across the indexed packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObjectPosition {
    pub pack_id: u32,
    pub offset: u64,
}

/// Writer building MIDX bytes from an ordered set of pack indices.
pub struct MultiPackIndexWriter;

impl MultiPackIndexWriter {
    /// Merge `packs` (order significant, first pack wins duplicates) and
    /// emit the chunked MIDX format. Returns the trailing content hash.
    pub fn write(
        packs: Vec<(String, &PackIndex)>,
        out: &mut impl Write,
    ) -> Result<ObjectHash, GitError> {
        let merger = PackIndexMerger::new(packs);
        if merger.unique_count() > u32::MAX as usize {
            return Err(GitError::MultiPackIndexFormat(format!(
                "{} objects exceed the fan-out domain",
                merger.unique_count()
            )));
        }
        let hash_len = get_hash_kind().size();
        let count = merger.unique_count();

        // One dedup pass collects the sorted tables.
        let mut names: Vec<u8> = Vec::with_capacity(count * hash_len);
        let mut positions: Vec<(u32, u64)> = Vec::with_capacity(count);
        let mut fanout = [0u32; 256];
        {
            let mut iter = merger.by_id_iter();
            while let Some(entry) = iter.next() {
                names.extend_from_slice(entry.hash.as_ref());
                positions.push((entry.pack_id, entry.offset));
                fanout[entry.hash.first_byte() as usize] += 1;
            }
        }
        for i in 1..fanout.len() {
            fanout[i] += fanout[i - 1];
        }

        // Offsets above 31 bits migrate to the large-offset table.
        let mut ooff: Vec<(u32, u32)> = Vec::with_capacity(count);
        let mut loff: Vec<u64> = Vec::new();
        for (pack_id, offset) in &positions {
            if *offset <= 0x7FFF_FFFF {
                ooff.push((*pack_id, *offset as u32));
            } else {
                ooff.push((*pack_id, LARGE_OFFSET_FLAG | loff.len() as u32));
                loff.push(*offset);
            }
        }

        // Reverse index: midx positions grouped by pack, offset-sorted.
        let pack_count = merger.pack_names().len();
        let mut ridx: Vec<u32> = (0..count as u32).collect();
        ridx.sort_by_key(|pos| {
            let (pack_id, offset) = positions[*pos as usize];
            (pack_id, offset)
        });
        let mut btmp: Vec<(u32, u32)> = Vec::with_capacity(pack_count);
        let mut cursor = 0u32;
        for pack_id in 0..pack_count as u32 {
            let bits = merger.selected_counts()[pack_id as usize] as u32;
            btmp.push((cursor, bits));
            cursor += bits;
        }

        let mut pnam: Vec<u8> = Vec::new();
        for name in merger.pack_names() {
            pnam.extend_from_slice(name.as_bytes());
            pnam.push(0);
        }

        // Chunk payloads in file order.
        let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
        chunks.push((CHUNK_PNAM, pnam));
        let mut oidf = Vec::with_capacity(256 * 4);
        for v in fanout {
            oidf.write_u32::<BigEndian>(v)?;
        }
        chunks.push((CHUNK_OIDF, oidf));
        chunks.push((CHUNK_OIDL, names));
        let mut ooff_bytes = Vec::with_capacity(count * 8);
        for (pack_id, slot) in &ooff {
            ooff_bytes.write_u32::<BigEndian>(*pack_id)?;
            ooff_bytes.write_u32::<BigEndian>(*slot)?;
        }
        chunks.push((CHUNK_OOFF, ooff_bytes));
        if !loff.is_empty() {
            let mut loff_bytes = Vec::with_capacity(loff.len() * 8);
            for v in &loff {
                loff_bytes.write_u64::<BigEndian>(*v)?;
            }
            chunks.push((CHUNK_LOFF, loff_bytes));
        }
        let mut ridx_bytes = Vec::with_capacity(count * 4);
        for pos in &ridx {
            ridx_bytes.write_u32::<BigEndian>(*pos)?;
        }
        chunks.push((CHUNK_RIDX, ridx_bytes));
        let mut btmp_bytes = Vec::with_capacity(pack_count * 8);
        for (first, bits) in &btmp {
            btmp_bytes.write_u32::<BigEndian>(*first)?;
            btmp_bytes.write_u32::<BigEndian>(*bits)?;
        }
        chunks.push((CHUNK_BTMP, btmp_bytes));

        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&MIDX_MAGIC);
        buf.push(MIDX_VERSION);
        buf.push(oid_version(get_hash_kind()));
        buf.push(chunks.len() as u8);
        buf.push(0); // base midx count, no chaining
        buf.write_u32::<BigEndian>(pack_count as u32)?;

        let mut offset = (buf.len() + (chunks.len() + 1) * 12) as u64;
        for (id, payload) in &chunks {
            buf.write_u32::<BigEndian>(*id)?;
            buf.write_u64::<BigEndian>(offset)?;
            offset += payload.len() as u64;
        }
        buf.write_u32::<BigEndian>(0)?;
        buf.write_u64::<BigEndian>(offset)?;
        for (_, payload) in &chunks {
            buf.extend_from_slice(payload);
        }

        let mut hasher = HashAlgorithm::new();
        hasher.update(&buf);
        let checksum = hasher.clone_finalize();
        buf.extend_from_slice(checksum.as_ref());

        out.write_all(&buf)?;
        Ok(checksum)
    }
}

/// Parsed multi-pack index. Immutable after open.
pub struct MultiPackIndex {
    pack_names: Vec<String>,
    fanout: [u32; 256],
    names: Vec<u8>,
    offsets: Vec<(u32, u32)>,
    large_offsets: Vec<u64>,
    ridx: Vec<u32>,
    btmp: Vec<(u32, u32)>,
    checksum: ObjectHash,
    hash_len: usize,
}

impl MultiPackIndex {
    /// Parse MIDX bytes, validating the header, chunk table, and the
    /// strictly-increasing id table invariant.
    pub fn from_bytes(data: &[u8]) -> Result<MultiPackIndex, GitError> {
        let hash_len = get_hash_kind().size();
        let mut cur = Cursor::new(data);

        let magic = read_bytes(&mut cur, 4)?;
        if magic != MIDX_MAGIC {
            return Err(GitError::MultiPackIndexFormat(format!(
                "bad magic {:02x?}",
                magic
            )));
        }
        let version = cur.read_u8()?;
        if version != MIDX_VERSION {
            return Err(GitError::MultiPackIndexFormat(format!(
                "unsupported version {version}"
            )));
        }
        let oid = cur.read_u8()?;
        if oid != oid_version(get_hash_kind()) {
            return Err(GitError::MultiPackIndexFormat(format!(
                "object-id version {oid} does not match the repository hash"
            )));
        }
        let chunk_count = cur.read_u8()? as usize;
        let base_count = cur.read_u8()?;
        if base_count != 0 {
            return Err(GitError::MultiPackIndexFormat(
                "chained multi-pack indexes are not supported".to_string(),
            ));
        }
        let pack_count = cur.read_u32::<BigEndian>()? as usize;

        // Chunk lookup table, terminated by id 0 at end-of-chunks.
        let mut table: Vec<(u32, u64)> = Vec::with_capacity(chunk_count + 1);
        for _ in 0..=chunk_count {
            let id = cur.read_u32::<BigEndian>()?;
            let offset = cur.read_u64::<BigEndian>()?;
            table.push((id, offset));
        }
        if table.last().map(|(id, _)| *id) != Some(0) {
            return Err(GitError::MultiPackIndexFormat(
                "chunk table missing terminator".to_string(),
            ));
        }
        let mut chunk_spans: HashMap<u32, (usize, usize)> = HashMap::new();
        for pair in table.windows(2) {
            let (id, start) = pair[0];
            let (_, end) = pair[1];
            if end < start || end as usize > data.len() {
                return Err(GitError::MultiPackIndexFormat(format!(
                    "chunk {id:#x} spans [{start}, {end}) outside the file"
                )));
            }
            chunk_spans.insert(id, (start as usize, end as usize));
        }
        fn chunk_of<'a>(
            data: &'a [u8],
            spans: &HashMap<u32, (usize, usize)>,
            id: u32,
        ) -> Result<&'a [u8], GitError> {
            let (start, end) = spans.get(&id).ok_or_else(|| {
                GitError::MultiPackIndexFormat(format!("required chunk {id:#x} missing"))
            })?;
            Ok(&data[*start..*end])
        }
        let chunk = |id: u32| chunk_of(data, &chunk_spans, id);

        let mut fanout = [0u32; 256];
        {
            let mut oidf = Cursor::new(chunk(CHUNK_OIDF)?);
            let mut prev = 0u32;
            for (i, slot) in fanout.iter_mut().enumerate() {
                let v = oidf.read_u32::<BigEndian>()?;
                if i > 0 && v < prev {
                    return Err(GitError::MultiPackIndexFormat(format!(
                        "fanout not monotone at bucket {i}"
                    )));
                }
                prev = v;
                *slot = v;
            }
        }
        let count = fanout[255] as usize;

        let names = chunk(CHUNK_OIDL)?.to_vec();
        if names.len() != count * hash_len {
            return Err(GitError::MultiPackIndexFormat(format!(
                "id table holds {} bytes, fanout promises {count} ids",
                names.len()
            )));
        }
        for i in 1..count {
            let prev = &names[(i - 1) * hash_len..i * hash_len];
            let this = &names[i * hash_len..(i + 1) * hash_len];
            if prev >= this {
                return Err(GitError::MultiPackIndexFormat(format!(
                    "id table not strictly increasing at position {i}"
                )));
            }
        }

        let ooff_bytes = chunk(CHUNK_OOFF)?;
        if ooff_bytes.len() != count * 8 {
            return Err(GitError::MultiPackIndexFormat(
                "offset table length mismatch".to_string(),
            ));
        }
        let mut offsets = Vec::with_capacity(count);
        {
            let mut r = Cursor::new(ooff_bytes);
            for _ in 0..count {
                let pack_id = r.read_u32::<BigEndian>()?;
                let slot = r.read_u32::<BigEndian>()?;
                offsets.push((pack_id, slot));
            }
        }

        let large_offsets = match chunk_spans.get(&CHUNK_LOFF) {
            Some((start, end)) => {
                let mut r = Cursor::new(&data[*start..*end]);
                let n = (end - start) / 8;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(r.read_u64::<BigEndian>()?);
                }
                v
            }
            None => Vec::new(),
        };

        let pnam = chunk(CHUNK_PNAM)?;
        let mut pack_names = Vec::with_capacity(pack_count);
        let mut rest = pnam;
        while let Some(nul) = memchr::memchr(0, rest) {
            pack_names.push(
                std::str::from_utf8(&rest[..nul])
                    .map_err(|_| {
                        GitError::MultiPackIndexFormat("pack name is not utf-8".to_string())
                    })?
                    .to_string(),
            );
            rest = &rest[nul + 1..];
        }
        if pack_names.len() != pack_count {
            return Err(GitError::MultiPackIndexFormat(format!(
                "{} pack names, header promises {pack_count}",
                pack_names.len()
            )));
        }

        let ridx_bytes = chunk(CHUNK_RIDX)?;
        let mut ridx = Vec::with_capacity(count);
        {
            let mut r = Cursor::new(ridx_bytes);
            for _ in 0..count {
                ridx.push(r.read_u32::<BigEndian>()?);
            }
        }
        let btmp_bytes = chunk(CHUNK_BTMP)?;
        let mut btmp = Vec::with_capacity(pack_count);
        {
            let mut r = Cursor::new(btmp_bytes);
            for _ in 0..pack_count {
                let first = r.read_u32::<BigEndian>()?;
                let bits = r.read_u32::<BigEndian>()?;
                btmp.push((first, bits));
            }
        }

        let trailer_start = data.len().saturating_sub(hash_len);
        let checksum = ObjectHash::from_bytes(&data[trailer_start..])?;

        Ok(MultiPackIndex {
            pack_names,
            fanout,
            names,
            offsets,
            large_offsets,
            ridx,
            btmp,
            checksum,
            hash_len,
        })
    }

    /// Total distinct objects, `fanout[255]`.
    pub fn object_count(&self) -> usize {
        self.fanout[255] as usize
    }

    /// Member pack names; position = pack id.
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }

    /// True if any offset lives in the large-offset chunk.
    pub fn needs_large_offsets(&self) -> bool {
        !self.large_offsets.is_empty()
    }

    /// Trailing content hash.
    pub fn checksum(&self) -> ObjectHash {
        self.checksum
    }

    /// Dense position of `id` in the union table, or `None`.
    pub fn find_position(&self, id: &ObjectHash) -> Option<usize> {
        if self.object_count() == 0 {
            return None;
        }
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

    /// Locate `id` as a (pack id, offset) pair.
    pub fn find(&self, id: &ObjectHash) -> Option<PackedObjectPosition> {
        self.find_position(id).map(|pos| self.position_at(pos))
    }

    /// (pack id, offset) stored at a dense position.
    pub fn position_at(&self, pos: usize) -> PackedObjectPosition {
        let (pack_id, slot) = self.offsets[pos];
        let offset = if slot & LARGE_OFFSET_FLAG != 0 {
            self.large_offsets[(slot & !LARGE_OFFSET_FLAG) as usize]
        } else {
            slot as u64
        };
        PackedObjectPosition { pack_id, offset }
    }

    /// Materialize the id at a dense position.
    pub fn object_at(&self, pos: usize) -> ObjectHash {
        let start = pos * self.hash_len;
        ObjectHash::from_bytes(&self.names[start..start + self.hash_len])
            .expect("id table slot width matches the configured hash")
    }

    /// Bitmap-order position of a (pack id, offset) pair: binary search in
    /// the pack's `[first, first+bits)` reverse-index range.
    pub fn find_bitmap_position(&self, at: PackedObjectPosition) -> Result<usize, GitError> {
        let (first, bits) = *self
            .btmp
            .get(at.pack_id as usize)
            .ok_or_else(|| GitError::MissingObject(format!("pack id {}", at.pack_id)))?;
        let mut lo = first as usize;
        let mut hi = (first + bits) as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = self.position_at(self.ridx[mid] as usize);
            match (candidate.pack_id, candidate.offset).cmp(&(at.pack_id, at.offset)) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(GitError::MissingObject(format!(
            "pack {} offset {}",
            at.pack_id, at.offset
        )))
    }

    /// Id stored at a bitmap-order position.
    pub fn object_at_bitmap_position(&self, bitmap_pos: usize) -> ObjectHash {
        self.object_at(self.ridx[bitmap_pos] as usize)
    }

    /// Prefix search: binary-search to the first candidate, then scan
    /// forward while the prefix still matches, up to `limit` results.
    pub fn resolve(&self, prefix: &IdPrefix, limit: usize, out: &mut Vec<ObjectHash>) {
        if self.object_count() == 0 || limit == 0 {
            return;
        }
        let bucket = prefix.first_byte() as usize;
        let mut lo = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let mut hi = self.fanout[bucket] as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let slot = &self.names[mid * self.hash_len..(mid + 1) * self.hash_len];
            if prefix.cmp_bytes(slot) == std::cmp::Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut pos = lo;
        while pos < self.object_count() && out.len() < limit {
            let slot = &self.names[pos * self.hash_len..(pos + 1) * self.hash_len];
            if !prefix.matches_bytes(slot) {
                break;
            }
            out.push(self.object_at(pos));
            pos += 1;
        }
    }
}
