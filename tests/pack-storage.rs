//! Integration tests for pack storage: build synthetic packs and indices,
//! unify them under a multi-pack index, and cross-check a pack against its
//! index with the fsck parser, including the large-offset and corruption
//! scenarios.

use std::io::Write;

use flate2::{Compression, write::ZlibEncoder};

use git_ketch::{
    errors::{CorruptPackIndexKind, GitError},
    hash::{HashKind, ObjectHash, set_hash_kind_for_test},
    internal::{
        object::{blob::Blob, types::ObjectType},
        pack::{
            block::BytesChannel,
            fsck::FsckPackParser,
            index::{IndexEntry, PackIndex, PackIndexWriter},
            midx::{MultiPackIndex, MultiPackIndexWriter},
        },
    },
    utils::HashAlgorithm,
};

fn fake_sha1(n: u8) -> ObjectHash {
    ObjectHash::Sha1([n; 20])
}

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

fn build_pack(blobs: &[&[u8]]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(blobs.len() as u32).to_be_bytes());
    for data in blobs {
        pack.extend(entry_header(ObjectType::Blob.to_u8(), data.len()));
        pack.extend(zlib(data));
    }
    let mut hasher = HashAlgorithm::new();
    hasher.update(&pack);
    let trailer = hasher.clone_finalize();
    pack.extend_from_slice(trailer.as_ref());
    pack
}

fn index_of(entries: Vec<IndexEntry>) -> PackIndex {
    let mut bytes = Vec::new();
    PackIndexWriter::write(entries, fake_sha1(0xAA), &mut bytes).unwrap();
    PackIndex::from_bytes(&bytes).unwrap()
}

/// Scan a pack with fsck, derive its index, and verify both directions.
#[test]
fn fsck_agrees_with_derived_index() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let pack = build_pack(&[b"first blob", b"second blob", b"third blob"]);
    let channel = BytesChannel::new(pack, 128);
    let mut parser = FsckPackParser::new(&channel);
    parser.parse().unwrap();
    assert_eq!(parser.entries().len(), 3);
    assert!(parser.corrupt_objects().is_empty());

    // Ids match the blob model's content addresses.
    let expected = Blob::from_content_bytes(b"first blob".to_vec()).id;
    assert!(parser.entries().iter().any(|e| e.id == expected));

    let entries: Vec<IndexEntry> = parser
        .entries()
        .iter()
        .map(|e| IndexEntry {
            hash: e.id,
            crc32: e.crc32,
            offset: e.offset,
        })
        .collect();
    parser.verify_index(&index_of(entries)).unwrap();
}

/// An index whose offset is off by one names the object and the exact
/// failure kind.
#[test]
fn fsck_detects_offset_mismatch() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let pack = build_pack(&[b"alpha", b"beta"]);
    let channel = BytesChannel::new(pack, 512);
    let mut parser = FsckPackParser::new(&channel);
    parser.parse().unwrap();

    let victim = parser.entries()[0];
    let entries: Vec<IndexEntry> = parser
        .entries()
        .iter()
        .map(|e| IndexEntry {
            hash: e.id,
            crc32: e.crc32,
            offset: if e.id == victim.id { e.offset + 1 } else { e.offset },
        })
        .collect();

    match parser.verify_index(&index_of(entries)).unwrap_err() {
        GitError::CorruptPackIndex { kind, message } => {
            assert_eq!(kind, CorruptPackIndexKind::MismatchOffset);
            assert!(message.contains(&victim.id.to_string()));
        }
        other => panic!("expected CorruptPackIndex, got {other}"),
    }
}

/// Two pack indices with an overlap unify into a MIDX that keeps one
/// entry per id, earliest pack winning, with a working reverse index.
#[test]
fn midx_unifies_two_packs() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let p1 = index_of(vec![
        IndexEntry {
            hash: fake_sha1(0x10),
            crc32: 1,
            offset: 100,
        },
        IndexEntry {
            hash: fake_sha1(0x30),
            crc32: 3,
            offset: 300,
        },
    ]);
    let p2 = index_of(vec![
        IndexEntry {
            hash: fake_sha1(0x20),
            crc32: 2,
            offset: 200,
        },
        IndexEntry {
            hash: fake_sha1(0x30),
            crc32: 9,
            offset: 999,
        },
    ]);

    let mut bytes = Vec::new();
    MultiPackIndexWriter::write(
        vec![("p1.pack".to_string(), &p1), ("p2.pack".to_string(), &p2)],
        &mut bytes,
    )
    .unwrap();
    let midx = MultiPackIndex::from_bytes(&bytes).unwrap();

    assert_eq!(midx.object_count(), 3);
    let dup = midx.find(&fake_sha1(0x30)).unwrap();
    assert_eq!((dup.pack_id, dup.offset), (0, 300));

    for pos in 0..midx.object_count() {
        let id = midx.object_at(pos);
        let at = midx.find(&id).unwrap();
        let bitmap = midx.find_bitmap_position(at).unwrap();
        assert_eq!(midx.object_at_bitmap_position(bitmap), id);
    }
}

/// An object at offset 2^33 forces the large-offset chunk and resolves
/// back exactly through the MIDX.
#[test]
fn midx_large_offsets() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let p1 = index_of(vec![IndexEntry {
        hash: fake_sha1(0x11),
        crc32: 1,
        offset: 1u64 << 33,
    }]);
    let p2 = index_of(vec![IndexEntry {
        hash: fake_sha1(0x22),
        crc32: 2,
        offset: 42,
    }]);

    let mut bytes = Vec::new();
    MultiPackIndexWriter::write(
        vec![("big.pack".to_string(), &p1), ("small.pack".to_string(), &p2)],
        &mut bytes,
    )
    .unwrap();
    let midx = MultiPackIndex::from_bytes(&bytes).unwrap();

    assert!(midx.needs_large_offsets());
    assert_eq!(midx.find(&fake_sha1(0x11)).unwrap().offset, 1u64 << 33);
    assert_eq!(midx.find(&fake_sha1(0x22)).unwrap().offset, 42);
}
