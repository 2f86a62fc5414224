//! Shared I/O utilities: streaming hash abstraction over SHA-1/SHA-256 and
//! helpers for reading fixed-width big-endian fields from index files.

use std::{io, io::Read};

use byteorder::{BigEndian, ReadBytesExt};
use sha1::{Digest, Sha1};

use crate::hash::{HashKind, ObjectHash, get_hash_kind};

pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_be(file: &mut impl Read) -> io::Result<u32> {
    file.read_u32::<BigEndian>()
}

pub fn read_u64_be(file: &mut impl Read) -> io::Result<u64> {
    file.read_u64::<BigEndian>()
}

pub fn read_sha(file: &mut impl Read) -> io::Result<ObjectHash> {
    ObjectHash::from_stream(file)
}

/// a hash abstraction to support both SHA1 and SHA256
/// which for stream hashing handle use (e.g. Sha1::new())
/// `std::io::Write` trait to update the hash state
#[derive(Clone)]
pub enum HashAlgorithm {
    Sha1(Sha1),
    Sha256(sha2::Sha256),
}

impl HashAlgorithm {
    /// Update hash with data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashAlgorithm::Sha1(hasher) => hasher.update(data),
            HashAlgorithm::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalize and get hash result
    pub fn finalize(self) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1(hasher) => hasher.finalize().to_vec(),
            HashAlgorithm::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }

    /// Finalize into an `ObjectHash` without consuming the running state.
    pub fn clone_finalize(&self) -> ObjectHash {
        let bytes = self.clone().finalize();
        match self {
            HashAlgorithm::Sha1(_) => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&bytes);
                ObjectHash::Sha1(h)
            }
            HashAlgorithm::Sha256(_) => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                ObjectHash::Sha256(h)
            }
        }
    }

    pub fn new() -> Self {
        match get_hash_kind() {
            HashKind::Sha1 => HashAlgorithm::Sha1(Sha1::new()),
            HashKind::Sha256 => HashAlgorithm::Sha256(sha2::Sha256::new()),
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::hash::set_hash_kind_for_test;

    /// Big-endian helpers read the same bytes the writers emit.
    #[test]
    fn test_read_be_helpers() {
        let mut cur = Cursor::new(vec![0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(read_u32_be(&mut cur).unwrap(), 7);
        assert_eq!(read_u64_be(&mut cur).unwrap(), 9);
    }

    /// clone_finalize yields the digest without consuming the state.
    #[test]
    fn test_clone_finalize() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut h = HashAlgorithm::new();
        h.update(b"Hello, world!");
        let first = h.clone_finalize();
        h.update(b" more");
        let second = h.clone_finalize();
        assert_eq!(
            first.to_string(),
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        );
        assert_ne!(first, second);
    }
}
