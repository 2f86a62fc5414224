//! Streaming pack validator: re-reads a pack through a block channel,
//! recomputes each entry's CRC32 over its header + compressed payload,
//! structurally checks every inflated object, resolves deltas to recover
//! object ids, and cross-checks the result against an existing pack index.
//!
//! One corrupt object never aborts the scan — findings accumulate and the
//! parse continues. The pack trailer hash is not verified here; that is the
//! transport's job.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use bstr::ByteSlice;
use tracing::debug;

use crate::{
    errors::{CorruptObjectKind, CorruptPackIndexKind, GitError},
    hash::{ObjectHash, get_hash_kind},
    internal::{
        object::{signature::Signature, tree::TreeItemMode, types::ObjectType},
        pack::{
            block::{BlockCache, BlockChannel, ChannelReader},
            index::PackIndex,
            wrapper::CrcWrapper,
        },
        zlib::stream::inflate::ReadBoxed,
    },
};

const PACK_MAGIC: [u8; 4] = *b"PACK";

/// One object recovered from the pack stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObjectEntry {
    pub id: ObjectHash,
    pub obj_type: ObjectType,
    pub offset: u64,
    pub crc32: u32,
}

/// A structurally invalid object found during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorruptObject {
    pub id: ObjectHash,
    pub obj_type: ObjectType,
    pub kind: CorruptObjectKind,
}

enum DeltaBase {
    Offset(u64),
    Id(ObjectHash),
}

struct PendingDelta {
    base: DeltaBase,
    data: Vec<u8>,
    offset: u64,
    crc32: u32,
}

/// Streaming validator of a pack against its index.
pub struct FsckPackParser<'a> {
    channel: &'a dyn BlockChannel,
    cache: Option<Arc<BlockCache>>,
    expected_object_count: Option<u32>,
    entries: Vec<PackedObjectEntry>,
    corrupt_objects: HashSet<CorruptObject>,
}

impl<'a> FsckPackParser<'a> {
    pub fn new(channel: &'a dyn BlockChannel) -> FsckPackParser<'a> {
        FsckPackParser {
            channel,
            cache: None,
            expected_object_count: None,
            entries: Vec::new(),
            corrupt_objects: HashSet::new(),
        }
    }

    /// Route block reads through a shared cache.
    pub fn with_cache(mut self, cache: Arc<BlockCache>) -> FsckPackParser<'a> {
        self.cache = Some(cache);
        self
    }

    /// Override the object count announced in the pack header. Some
    /// streaming pack producers write an incorrect count.
    pub fn set_expected_object_count(&mut self, count: u32) {
        self.expected_object_count = Some(count);
    }

    /// Objects recovered by the last `parse` call.
    pub fn entries(&self) -> &[PackedObjectEntry] {
        &self.entries
    }

    /// Structural findings accumulated by the last `parse` call.
    pub fn corrupt_objects(&self) -> &HashSet<CorruptObject> {
        &self.corrupt_objects
    }

    /// Walk the whole pack, recovering every entry and its CRC32.
    pub fn parse(&mut self) -> Result<(), GitError> {
        self.entries.clear();
        self.corrupt_objects.clear();

        let reader = ChannelReader::new(self.channel, self.cache.clone());
        let mut reader = CrcWrapper::new(reader);

        let mut header = [0u8; 12];
        reader.read_exact(&mut header)?;
        if header[0..4] != PACK_MAGIC {
            return Err(GitError::InvalidPackHeader(format!(
                "bad magic {:02x?}",
                &header[0..4]
            )));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPackHeader(format!(
                "unsupported version {version}"
            )));
        }
        let announced = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let count = self.expected_object_count.unwrap_or(announced);
        debug!(announced, count, "fsck pack scan");

        // Whole objects resolved so far, addressable by offset and by id
        // so both delta flavors can find their base.
        let mut wholes: Vec<(ObjectType, Vec<u8>)> = Vec::new();
        let mut by_offset: HashMap<u64, usize> = HashMap::new();
        let mut by_id: HashMap<ObjectHash, usize> = HashMap::new();
        let mut pending: Vec<PendingDelta> = Vec::new();

        for _ in 0..count {
            let offset = reader.bytes_read();
            reader.reset_crc();
            let (type_num, size) = read_entry_header(&mut reader)?;
            match type_num {
                1..=4 => {
                    let obj_type = ObjectType::from_u8(type_num)?;
                    let mut inflater = ReadBoxed::new(&mut reader, obj_type, size);
                    let mut data = Vec::with_capacity(size);
                    inflater.read_to_end(&mut data)?;
                    let id = inflater.hash.clone_finalize();
                    drop(inflater);
                    let crc32 = reader.take_crc();

                    self.record(obj_type, id, &data, offset, crc32);
                    let slot = wholes.len();
                    wholes.push((obj_type, data));
                    by_offset.insert(offset, slot);
                    by_id.insert(id, slot);
                }
                6 => {
                    let distance = read_ofs_distance(&mut reader)?;
                    if distance > offset {
                        return Err(GitError::InvalidPackFile(format!(
                            "delta at {offset} points {distance} bytes before the pack"
                        )));
                    }
                    let data = read_delta_payload(&mut reader, size)?;
                    pending.push(PendingDelta {
                        base: DeltaBase::Offset(offset - distance),
                        data,
                        offset,
                        crc32: reader.take_crc(),
                    });
                }
                7 => {
                    let base_id = ObjectHash::from_stream(&mut reader)?;
                    let data = read_delta_payload(&mut reader, size)?;
                    pending.push(PendingDelta {
                        base: DeltaBase::Id(base_id),
                        data,
                        offset,
                        crc32: reader.take_crc(),
                    });
                }
                other => {
                    return Err(GitError::InvalidPackFile(format!(
                        "entry type {other} at offset {offset}"
                    )));
                }
            }
        }

        // Resolve deltas in passes; a valid pack always makes progress.
        while !pending.is_empty() {
            let mut unresolved = Vec::new();
            let mut progressed = false;
            for delta in pending {
                let slot = match &delta.base {
                    DeltaBase::Offset(base_offset) => by_offset.get(base_offset).copied(),
                    DeltaBase::Id(base_id) => by_id.get(base_id).copied(),
                };
                match slot {
                    Some(slot) => {
                        let (base_type, base_data) = &wholes[slot];
                        let obj_type = *base_type;
                        let data = apply_delta(base_data, &delta.data)?;
                        let id = ObjectHash::from_type_and_data(obj_type, &data);
                        self.record(obj_type, id, &data, delta.offset, delta.crc32);
                        let new_slot = wholes.len();
                        wholes.push((obj_type, data));
                        by_offset.insert(delta.offset, new_slot);
                        by_id.insert(id, new_slot);
                        progressed = true;
                    }
                    None => unresolved.push(delta),
                }
            }
            if !progressed {
                return Err(GitError::InvalidPackFile(format!(
                    "{} deltas have no base in this pack",
                    unresolved.len()
                )));
            }
            pending = unresolved;
        }

        Ok(())
    }

    fn record(
        &mut self,
        obj_type: ObjectType,
        id: ObjectHash,
        data: &[u8],
        offset: u64,
        crc32: u32,
    ) {
        if let Err(kind) = check_object(obj_type, data) {
            debug!(%id, %kind, "corrupt object");
            self.corrupt_objects.insert(CorruptObject { id, obj_type, kind });
        }
        self.entries.push(PackedObjectEntry {
            id,
            obj_type,
            offset,
            crc32,
        });
    }

    /// Cross-check the recovered entries against `idx`.
    pub fn verify_index(&self, idx: &PackIndex) -> Result<(), GitError> {
        verify_index(&self.entries, idx)
    }
}

/// Cross-check pack entries against an index: every pack object must be in
/// the index at the same offset with the same CRC32, and the index must not
/// list objects the pack lacks.
pub fn verify_index(entries: &[PackedObjectEntry], idx: &PackIndex) -> Result<(), GitError> {
    for entry in entries {
        let pos = idx.find_position(&entry.id).ok_or_else(|| {
            GitError::corrupt_index(
                CorruptPackIndexKind::MissingObj,
                format!("{} not in index", entry.id),
            )
        })?;
        let stored_offset = idx.offset_at(pos);
        if stored_offset != entry.offset {
            return Err(GitError::corrupt_index(
                CorruptPackIndexKind::MismatchOffset,
                format!(
                    "{} at {} in pack, {} in index",
                    entry.id, entry.offset, stored_offset
                ),
            ));
        }
        if idx.has_crc32() {
            match idx.find_crc32(&entry.id) {
                Ok(stored) if stored != entry.crc32 => {
                    return Err(GitError::corrupt_index(
                        CorruptPackIndexKind::MismatchCrc,
                        format!(
                            "{} crc {:08x} in pack, {stored:08x} in index",
                            entry.id, entry.crc32
                        ),
                    ));
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(GitError::corrupt_index(
                        CorruptPackIndexKind::MissingCrc,
                        format!("{} has no crc in index", entry.id),
                    ));
                }
            }
        }
    }

    let in_pack: HashSet<ObjectHash> = entries.iter().map(|e| e.id).collect();
    for pos in 0..idx.object_count() {
        let id = idx.object_at(pos);
        if !in_pack.contains(&id) {
            return Err(GitError::corrupt_index(
                CorruptPackIndexKind::UnknownObj,
                format!("{id} in index but not in pack"),
            ));
        }
    }
    Ok(())
}

fn read_entry_header(reader: &mut impl Read) -> Result<(u8, usize), GitError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    let type_num = (byte[0] >> 4) & 0x07;
    let mut size = (byte[0] & 0x0F) as usize;
    let mut shift = 4;
    while byte[0] & 0x80 != 0 {
        reader.read_exact(&mut byte)?;
        size |= ((byte[0] & 0x7F) as usize) << shift;
        shift += 7;
    }
    Ok((type_num, size))
}

fn read_ofs_distance(reader: &mut impl Read) -> Result<u64, GitError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    let mut distance = (byte[0] & 0x7F) as u64;
    while byte[0] & 0x80 != 0 {
        reader.read_exact(&mut byte)?;
        distance = ((distance + 1) << 7) | (byte[0] & 0x7F) as u64;
    }
    Ok(distance)
}

fn read_delta_payload<R: std::io::BufRead>(
    reader: &mut R,
    size_hint: usize,
) -> Result<Vec<u8>, GitError> {
    let mut inflater = ReadBoxed::new_for_delta(reader);
    let mut data = Vec::with_capacity(size_hint);
    inflater.read_to_end(&mut data)?;
    Ok(data)
}

fn read_delta_varint(data: &[u8], pos: &mut usize) -> Result<usize, GitError> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| GitError::DeltaObjectError("truncated size header".to_string()))?;
        *pos += 1;
        value |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Apply a git delta to its base, producing the reconstructed object bytes.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, GitError> {
    let mut pos = 0;
    let base_size = read_delta_varint(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(GitError::DeltaObjectError(format!(
            "base is {} bytes, delta expects {base_size}",
            base.len()
        )));
    }
    let result_size = read_delta_varint(delta, &mut pos)?;
    let mut result = Vec::with_capacity(result_size);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            // Copy from base: offset/size bytes selected by the flag bits.
            let mut offset = 0usize;
            for bit in 0..4 {
                if cmd & (1 << bit) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| {
                        GitError::DeltaObjectError("truncated copy offset".to_string())
                    })?;
                    pos += 1;
                    offset |= (byte as usize) << (8 * bit);
                }
            }
            let mut size = 0usize;
            for bit in 0..3 {
                if cmd & (1 << (4 + bit)) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| {
                        GitError::DeltaObjectError("truncated copy size".to_string())
                    })?;
                    pos += 1;
                    size |= (byte as usize) << (8 * bit);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| GitError::DeltaObjectError("copy past base end".to_string()))?;
            result.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            if end > delta.len() {
                return Err(GitError::DeltaObjectError(
                    "truncated insert payload".to_string(),
                ));
            }
            result.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(GitError::DeltaObjectError(
                "opcode 0 is reserved".to_string(),
            ));
        }
    }

    if result.len() != result_size {
        return Err(GitError::DeltaObjectError(format!(
            "reconstructed {} bytes, delta promises {result_size}",
            result.len()
        )));
    }
    Ok(result)
}

/// Structural object check. Returns the first violated rule.
pub fn check_object(obj_type: ObjectType, data: &[u8]) -> Result<(), CorruptObjectKind> {
    match obj_type {
        ObjectType::Blob => Ok(()),
        ObjectType::Commit => check_commit(data),
        ObjectType::Tree => check_tree(data),
        ObjectType::Tag => check_tag(data),
        _ => Ok(()),
    }
}

fn parse_id_line(line: &[u8]) -> Option<ObjectHash> {
    let hex = line.to_str().ok()?;
    if hex.len() != get_hash_kind().hex_len() {
        return None;
    }
    ObjectHash::from_str(hex).ok()
}

fn check_commit(data: &[u8]) -> Result<(), CorruptObjectKind> {
    let mut lines = data.split(|b| *b == 0x0a);
    let tree_line = lines.next().unwrap_or(b"");
    let tree_ok = tree_line
        .strip_prefix(b"tree ")
        .and_then(parse_id_line)
        .is_some();
    if !tree_ok {
        return Err(CorruptObjectKind::MissingTree);
    }

    let mut line = lines.next().unwrap_or(b"");
    while let Some(parent) = line.strip_prefix(b"parent ") {
        if parse_id_line(parent).is_none() {
            return Err(CorruptObjectKind::BadObjectId);
        }
        line = lines.next().unwrap_or(b"");
    }

    if !line.starts_with(b"author ") {
        return Err(CorruptObjectKind::MissingAuthor);
    }
    if Signature::from_data(line.to_vec()).is_err() {
        return Err(CorruptObjectKind::BadDate);
    }

    let committer = lines.next().unwrap_or(b"");
    if !committer.starts_with(b"committer ") {
        return Err(CorruptObjectKind::MissingCommitter);
    }
    if Signature::from_data(committer.to_vec()).is_err() {
        return Err(CorruptObjectKind::BadDate);
    }
    Ok(())
}

fn check_tree(data: &[u8]) -> Result<(), CorruptObjectKind> {
    let hash_len = get_hash_kind().size();
    let mut rest = data;
    let mut prev_key: Option<Vec<u8>> = None;

    while !rest.is_empty() {
        let mode_end = rest
            .find_byte(b' ')
            .ok_or(CorruptObjectKind::InvalidMode)?;
        let mode =
            TreeItemMode::from_bytes(&rest[..mode_end]).map_err(|_| CorruptObjectKind::InvalidMode)?;
        rest = &rest[mode_end + 1..];

        let name_end = rest.find_byte(0x00).ok_or(CorruptObjectKind::EmptyName)?;
        let name = &rest[..name_end];
        if name.is_empty() {
            return Err(CorruptObjectKind::EmptyName);
        }
        if name.contains(&b'/') {
            return Err(CorruptObjectKind::FullPathName);
        }
        rest = &rest[name_end + 1..];

        if rest.len() < hash_len {
            return Err(CorruptObjectKind::BadObjectId);
        }
        let id = &rest[..hash_len];
        if id.iter().all(|b| *b == 0) {
            return Err(CorruptObjectKind::BadObjectId);
        }
        rest = &rest[hash_len..];

        let mut key = name.to_vec();
        if mode.is_tree() {
            key.push(b'/');
        }
        if let Some(prev) = &prev_key {
            if *prev == key {
                return Err(CorruptObjectKind::DuplicateEntry);
            }
            if *prev > key {
                return Err(CorruptObjectKind::TreeNotSorted);
            }
        }
        prev_key = Some(key);
    }
    Ok(())
}

fn check_tag(data: &[u8]) -> Result<(), CorruptObjectKind> {
    let mut lines = data.split(|b| *b == 0x0a);
    let object = lines.next().unwrap_or(b"");
    match object.strip_prefix(b"object ") {
        None => return Err(CorruptObjectKind::MissingObjectField),
        Some(id) if parse_id_line(id).is_none() => return Err(CorruptObjectKind::BadObjectId),
        Some(_) => {}
    }
    let type_line = lines.next().unwrap_or(b"");
    if !type_line.starts_with(b"type ") {
        return Err(CorruptObjectKind::MissingTypeEntry);
    }
    let tag_line = lines.next().unwrap_or(b"");
    if !tag_line.starts_with(b"tag ") {
        return Err(CorruptObjectKind::MissingTagEntry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::ZlibEncoder};

    use super::*;
    use crate::{
        hash::{HashKind, set_hash_kind_for_test},
        internal::{
            object::{ObjectTrait, blob::Blob},
            pack::{
                block::BytesChannel,
                index::{IndexEntry, PackIndexWriter},
            },
        },
        utils::HashAlgorithm,
    };

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn entry_header(type_num: u8, mut size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = (type_num << 4) | (size & 0x0F) as u8;
        size >>= 4;
        while size > 0 {
            out.push(byte | 0x80);
            byte = (size & 0x7F) as u8;
            size >>= 7;
        }
        out.push(byte);
        out
    }

    /// Build pack bytes from (type, payload) whole objects, returning the
    /// bytes and each object's offset.
    fn build_pack(objects: &[(ObjectType, Vec<u8>)]) -> (Vec<u8>, Vec<u64>) {
        let mut pack = Vec::new();
        pack.extend_from_slice(b"PACK");
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&(objects.len() as u32).to_be_bytes());

        let mut offsets = Vec::new();
        for (obj_type, data) in objects {
            offsets.push(pack.len() as u64);
            pack.extend(entry_header(obj_type.to_u8(), data.len()));
            pack.extend(zlib(data));
        }
        let mut hasher = HashAlgorithm::new();
        hasher.update(&pack);
        let trailer = hasher.clone_finalize();
        pack.extend_from_slice(trailer.as_ref());
        (pack, offsets)
    }

    fn parse_pack(pack: &[u8]) -> FsckPackParser<'_> {
        // Leaked channel keeps the borrow simple inside tests.
        let channel = Box::leak(Box::new(BytesChannel::new(pack.to_vec(), 512)));
        let mut parser = FsckPackParser::new(channel);
        parser.parse().unwrap();
        parser
    }

    fn index_for(parser: &FsckPackParser<'_>) -> Vec<IndexEntry> {
        parser
            .entries()
            .iter()
            .map(|e| IndexEntry {
                hash: e.id,
                crc32: e.crc32,
                offset: e.offset,
            })
            .collect()
    }

    fn idx_from(entries: Vec<IndexEntry>) -> PackIndex {
        let mut bytes = Vec::new();
        PackIndexWriter::write(entries, ObjectHash::Sha1([0xAA; 20]), &mut bytes).unwrap();
        PackIndex::from_bytes(&bytes).unwrap()
    }

    /// A pack and the index built from its own scan verify silently.
    #[test]
    fn test_verify_agreeing_index() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (pack, offsets) = build_pack(&[
            (ObjectType::Blob, b"alpha".to_vec()),
            (ObjectType::Blob, b"beta".to_vec()),
        ]);
        let parser = parse_pack(&pack);
        assert_eq!(parser.entries().len(), 2);
        assert_eq!(parser.entries()[0].offset, offsets[0]);
        assert!(parser.corrupt_objects().is_empty());

        let blob_id = Blob::from_content_bytes(b"alpha".to_vec()).id;
        assert!(parser.entries().iter().any(|e| e.id == blob_id));

        parser.verify_index(&idx_from(index_for(&parser))).unwrap();
    }

    fn expect_kind(err: GitError, want: CorruptPackIndexKind) {
        match err {
            GitError::CorruptPackIndex { kind, .. } => assert_eq!(kind, want),
            other => panic!("expected CorruptPackIndex, got {other}"),
        }
    }

    /// Flipping an offset, a CRC, or the entry set yields the exact kind.
    #[test]
    fn test_verify_detects_each_kind() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (pack, _) = build_pack(&[
            (ObjectType::Blob, b"alpha".to_vec()),
            (ObjectType::Blob, b"beta".to_vec()),
        ]);
        let parser = parse_pack(&pack);
        let good = index_for(&parser);

        // Offset off by one.
        let mut bad = good.clone();
        bad[0].offset += 1;
        expect_kind(
            parser.verify_index(&idx_from(bad)).unwrap_err(),
            CorruptPackIndexKind::MismatchOffset,
        );

        // CRC flipped.
        let mut bad = good.clone();
        bad[1].crc32 ^= 0xFFFF_FFFF;
        expect_kind(
            parser.verify_index(&idx_from(bad)).unwrap_err(),
            CorruptPackIndexKind::MismatchCrc,
        );

        // Entry dropped from the index.
        let mut bad = good.clone();
        bad.pop();
        expect_kind(
            parser.verify_index(&idx_from(bad)).unwrap_err(),
            CorruptPackIndexKind::MissingObj,
        );

        // Extra entry the pack lacks.
        let mut bad = good.clone();
        bad.push(IndexEntry {
            hash: ObjectHash::Sha1([0xEE; 20]),
            crc32: 0,
            offset: 9999,
        });
        expect_kind(
            parser.verify_index(&idx_from(bad)).unwrap_err(),
            CorruptPackIndexKind::UnknownObj,
        );
    }

    /// An OFS delta reconstructs against its base and gets a real id.
    #[test]
    fn test_ofs_delta_resolution() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let base = b"hello base object".to_vec();

        // Delta: copy the whole base, then insert " plus".
        let mut delta = Vec::new();
        delta.push(base.len() as u8); // base size varint
        delta.push((base.len() + 5) as u8); // result size varint
        delta.push(0x90); // copy, size1 flag
        delta.push(base.len() as u8);
        delta.push(5); // insert 5 bytes
        delta.extend_from_slice(b" plus");

        let mut pack = Vec::new();
        pack.extend_from_slice(b"PACK");
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&2u32.to_be_bytes());
        let base_offset = pack.len() as u64;
        pack.extend(entry_header(ObjectType::Blob.to_u8(), base.len()));
        pack.extend(zlib(&base));
        let delta_offset = pack.len() as u64;
        pack.extend(entry_header(6, delta.len()));
        // OFS distance back to the base entry.
        let distance = delta_offset - base_offset;
        assert!(distance < 0x80);
        pack.push(distance as u8);
        pack.extend(zlib(&delta));
        let mut hasher = HashAlgorithm::new();
        hasher.update(&pack);
        let trailer = hasher.clone_finalize();
        pack.extend_from_slice(trailer.as_ref());

        let parser = parse_pack(&pack);
        assert_eq!(parser.entries().len(), 2);
        let expected = Blob::from_content_bytes(b"hello base object plus".to_vec());
        let resolved = parser
            .entries()
            .iter()
            .find(|e| e.offset == delta_offset)
            .unwrap();
        assert_eq!(resolved.id, expected.id);
        assert_eq!(resolved.obj_type, ObjectType::Blob);

        parser.verify_index(&idx_from(index_for(&parser))).unwrap();
    }

    /// A structurally bad commit is recorded and the scan continues.
    #[test]
    fn test_corrupt_object_collected() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (pack, _) = build_pack(&[
            (ObjectType::Commit, b"not a commit at all".to_vec()),
            (ObjectType::Blob, b"fine".to_vec()),
        ]);
        let parser = parse_pack(&pack);
        assert_eq!(parser.entries().len(), 2);
        assert_eq!(parser.corrupt_objects().len(), 1);
        let finding = parser.corrupt_objects().iter().next().unwrap();
        assert_eq!(finding.kind, CorruptObjectKind::MissingTree);
        assert_eq!(finding.obj_type, ObjectType::Commit);
    }

    /// The header count override lets the parser ignore a lying header.
    #[test]
    fn test_expected_count_override() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (mut pack, _) = build_pack(&[
            (ObjectType::Blob, b"one".to_vec()),
            (ObjectType::Blob, b"two".to_vec()),
        ]);
        // Corrupt the announced count.
        pack[8..12].copy_from_slice(&9u32.to_be_bytes());
        let channel = BytesChannel::new(pack, 512);
        let mut parser = FsckPackParser::new(&channel);
        parser.set_expected_object_count(2);
        parser.parse().unwrap();
        assert_eq!(parser.entries().len(), 2);
    }

    /// The object checker's taxonomy on trees.
    #[test]
    fn test_tree_checker() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let good = b"100644 a\x00\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01";
        assert!(check_tree(good).is_ok());

        let bad_mode = b"999999 a\x00\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01";
        assert_eq!(check_tree(bad_mode), Err(CorruptObjectKind::InvalidMode));

        let zero_id = b"100644 a\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
        assert_eq!(check_tree(zero_id), Err(CorruptObjectKind::BadObjectId));

        let mut unsorted = Vec::new();
        unsorted.extend_from_slice(b"100644 b\x00");
        unsorted.extend_from_slice(&[1u8; 20]);
        unsorted.extend_from_slice(b"100644 a\x00");
        unsorted.extend_from_slice(&[2u8; 20]);
        assert_eq!(check_tree(&unsorted), Err(CorruptObjectKind::TreeNotSorted));

        let mut duplicate = Vec::new();
        duplicate.extend_from_slice(b"100644 a\x00");
        duplicate.extend_from_slice(&[1u8; 20]);
        duplicate.extend_from_slice(b"100644 a\x00");
        duplicate.extend_from_slice(&[2u8; 20]);
        assert_eq!(check_tree(&duplicate), Err(CorruptObjectKind::DuplicateEntry));
    }
}
