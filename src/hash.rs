//! Hash utilities for Git objects with selectable algorithms (SHA-1 and SHA-256).
//! Hash kind is stored thread-locally; set once at startup to match your repository format.
//! Defaults to SHA-1.

use std::{cell::RefCell, cmp::Ordering, fmt::Display, hash::Hash, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::{errors::GitError, internal::object::types::ObjectType};

/// Supported hash algorithms for object IDs (selector only, no data attached).
/// Used to configure which hash algorithm to use globally (thread-local).
/// Defaults to SHA-1.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    /// Byte length of the hash output.
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }
    /// Hex string length of the hash output.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }
    /// Lowercase name of the hash algorithm.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err("Invalid hash kind".to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
/// Concrete object ID value carrying the bytes for the selected algorithm (SHA-1 or SHA-256).
/// Used for Git object hashes and reference targets.
/// Supports conversion to/from hex strings, byte slices, and stream reading.
/// Ordering is lexicographic over the raw bytes, matching the sorted tables
/// of pack indices.
pub enum ObjectHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Default for ObjectHash {
    fn default() -> Self {
        ObjectHash::Sha1([0u8; 20])
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            ObjectHash::Sha1(bytes) => bytes.as_slice(),
            ObjectHash::Sha256(bytes) => bytes.as_slice(),
        }
    }
}

/// Parse hex (40 for SHA-1, 64 for SHA-256) into `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => {
                let mut h = [0u8; 20];
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                h.copy_from_slice(bytes.as_slice());
                Ok(ObjectHash::Sha1(h))
            }
            64 => {
                let mut h = [0u8; 32];
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                h.copy_from_slice(bytes.as_slice());
                Ok(ObjectHash::Sha256(h))
            }
            _ => Err("Invalid hash length".to_string()),
        }
    }
}

impl ObjectHash {
    /// All-zero id for a given hash kind, the distinguished "absent" value.
    pub fn zero(kind: HashKind) -> ObjectHash {
        match kind {
            HashKind::Sha1 => ObjectHash::Sha1([0u8; 20]),
            HashKind::Sha256 => ObjectHash::Sha256([0u8; 32]),
        }
    }

    /// True if every byte is zero, i.e. the id means "absent".
    pub fn is_zero(&self) -> bool {
        self.as_ref().iter().all(|b| *b == 0)
    }

    /// Zero-filled hex string for a given hash kind.
    pub fn zero_str(kind: HashKind) -> String {
        "0".repeat(kind.hex_len())
    }

    /// Return the hash kind for this value.
    pub fn kind(&self) -> HashKind {
        match self {
            ObjectHash::Sha1(_) => HashKind::Sha1,
            ObjectHash::Sha256(_) => HashKind::Sha256,
        }
    }

    /// Return the hash size in bytes.
    pub fn size(&self) -> usize {
        self.kind().size()
    }

    /// First byte of the id, the fan-out bucket selector.
    pub fn first_byte(&self) -> u8 {
        self.as_ref()[0]
    }

    /// Compare this id against `self.size()` bytes of `table` starting at
    /// `offset`. Pack index and MIDX lookups binary-search raw name tables
    /// with this, avoiding a copy per probe.
    pub fn cmp_bytes_at(&self, table: &[u8], offset: usize) -> Ordering {
        let len = self.size();
        self.as_ref().cmp(&table[offset..offset + len])
    }

    /// Compute hash of data using current thread-local `HashKind`.
    pub fn new(data: &[u8]) -> ObjectHash {
        match get_hash_kind() {
            HashKind::Sha1 => {
                let h = sha1::Sha1::digest(data);
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(h.as_ref());
                ObjectHash::Sha1(bytes)
            }
            HashKind::Sha256 => {
                let h = sha2::Sha256::digest(data);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(h.as_ref());
                ObjectHash::Sha256(bytes)
            }
        }
    }

    /// Create ObjectHash from object type and data, hashing the canonical
    /// `<type> <len>\0<data>` form.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut d: Vec<u8> = Vec::with_capacity(data.len() + 32);
        d.extend(object_type.to_bytes());
        d.push(b' ');
        d.extend(data.len().to_string().as_bytes());
        d.push(b'\x00');
        d.extend(data);
        ObjectHash::new(&d)
    }

    /// Create `ObjectHash` from raw bytes matching the current hash size.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, GitError> {
        let expected_len = get_hash_kind().size();
        if bytes.len() != expected_len {
            return Err(GitError::InvalidHashValue(format!(
                "byte length {} (expected {})",
                bytes.len(),
                expected_len
            )));
        }

        match get_hash_kind() {
            HashKind::Sha1 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(bytes);
                Ok(ObjectHash::Sha1(h))
            }
            HashKind::Sha256 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(bytes);
                Ok(ObjectHash::Sha256(h))
            }
        }
    }

    /// Read hash bytes from a stream according to current hash size.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        match get_hash_kind() {
            HashKind::Sha1 => {
                let mut h = [0u8; 20];
                data.read_exact(&mut h)?;
                Ok(ObjectHash::Sha1(h))
            }
            HashKind::Sha256 => {
                let mut h = [0u8; 32];
                data.read_exact(&mut h)?;
                Ok(ObjectHash::Sha256(h))
            }
        }
    }

    /// Return raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

/// An abbreviated object id: a hex prefix of 1 to `hex_len` nibbles.
///
/// Used by MIDX prefix resolution to find all ids sharing the prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdPrefix {
    bytes: Vec<u8>,
    nibbles: usize,
}

impl IdPrefix {
    /// Parse a hex prefix. Odd-length prefixes are padded with a low zero
    /// nibble internally; `matches` masks the trailing half byte.
    pub fn from_hex(s: &str) -> Result<IdPrefix, GitError> {
        let nibbles = s.len();
        if nibbles == 0 || nibbles > get_hash_kind().hex_len() {
            return Err(GitError::InvalidHashValue(s.to_string()));
        }
        let padded = if nibbles % 2 == 1 {
            format!("{s}0")
        } else {
            s.to_string()
        };
        let bytes = hex::decode(&padded).map_err(|_| GitError::InvalidHashValue(s.to_string()))?;
        Ok(IdPrefix { bytes, nibbles })
    }

    /// Number of hex digits in this prefix.
    pub fn nibbles(&self) -> usize {
        self.nibbles
    }

    /// First byte of the prefix, selecting the fan-out bucket.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// True if `id` starts with this prefix.
    pub fn matches(&self, id: &ObjectHash) -> bool {
        self.matches_bytes(id.as_ref())
    }

    /// True if the raw `id` bytes start with this prefix.
    pub fn matches_bytes(&self, id: &[u8]) -> bool {
        let full = self.nibbles / 2;
        if id[..full] != self.bytes[..full] {
            return false;
        }
        if self.nibbles % 2 == 1 {
            return id[full] & 0xF0 == self.bytes[full] & 0xF0;
        }
        true
    }

    /// Compare the prefix against raw id bytes, treating the prefix as if
    /// padded with zeros. Used to binary-search for the first candidate.
    pub fn cmp_bytes(&self, id: &[u8]) -> Ordering {
        let full = self.nibbles / 2;
        match self.bytes[..full].cmp(&id[..full]) {
            Ordering::Equal if self.nibbles % 2 == 1 => {
                (self.bytes[full] & 0xF0).cmp(&(id[full] & 0xF0))
            }
            ord => ord,
        }
    }
}

thread_local! {
    /// Thread-local variable to store the current hash kind.
    /// This allows different threads to work with different hash algorithms
    /// concurrently without interfering with each other.
    static CURRENT_HASH_KIND: RefCell<HashKind> = RefCell::new(HashKind::default());
}

/// Set the thread-local hash kind (configure once at startup to match repo format).
pub fn set_hash_kind(kind: HashKind) {
    CURRENT_HASH_KIND.with(|h| {
        *h.borrow_mut() = kind;
    });
}

/// Retrieves the hash kind for the current thread.
pub fn get_hash_kind() -> HashKind {
    CURRENT_HASH_KIND.with(|h| *h.borrow())
}

/// A guard to reset the hash kind after the test
pub struct HashKindGuard {
    prev: HashKind,
}

impl Drop for HashKindGuard {
    fn drop(&mut self) {
        set_hash_kind(self.prev);
    }
}

/// Sets the hash kind for the current thread and returns a guard to reset it later.
pub fn set_hash_kind_for_test(kind: HashKind) -> HashKindGuard {
    let prev = get_hash_kind();
    set_hash_kind(kind);
    HashKindGuard { prev }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::hash::{HashKind, IdPrefix, ObjectHash, set_hash_kind_for_test};

    /// Hashing "Hello, world!" with SHA1 should match known value.
    #[test]
    fn test_sha1_new() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let data = "Hello, world!".as_bytes();
        let sha1 = ObjectHash::new(data);
        let expected_sha1_hash = "943a702d06f34599aee1f8da8ef9f7296031d699";
        assert_eq!(sha1.to_string(), expected_sha1_hash);
    }

    /// Hashing "Hello, world!" with SHA256 should match known value.
    #[test]
    fn test_sha256_new() {
        let _guard = set_hash_kind_for_test(HashKind::Sha256);
        let data = "Hello, world!".as_bytes();
        let sha256 = ObjectHash::new(data);
        let expected_sha256_hash =
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3";
        assert_eq!(sha256.to_string(), expected_sha256_hash);
    }

    /// Construct SHA1 from raw bytes.
    #[test]
    fn test_sha1_from_bytes() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let sha1 = ObjectHash::from_bytes(&[
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ])
        .unwrap();

        assert_eq!(sha1.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
    }

    /// Read hash from stream for SHA1.
    #[test]
    fn test_from_stream() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let source = [
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ];
        let mut reader = std::io::Cursor::new(source);
        let sha1 = ObjectHash::from_stream(&mut reader).unwrap();
        assert_eq!(sha1.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
    }

    /// The zero id means "absent"; any real hash does not.
    #[test]
    fn test_zero_id() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let zero = ObjectHash::zero(HashKind::Sha1);
        assert!(zero.is_zero());
        assert_eq!(zero.to_string(), ObjectHash::zero_str(HashKind::Sha1));
        assert!(!ObjectHash::new(b"data").is_zero());
    }

    /// Ordering is lexicographic over raw bytes.
    #[test]
    fn test_byte_ordering() {
        let a = ObjectHash::Sha1([0x01; 20]);
        let b = ObjectHash::Sha1([0x02; 20]);
        assert!(a < b);
        assert_eq!(a.first_byte(), 0x01);
    }

    /// cmp_bytes_at compares against a raw table slot without copying.
    #[test]
    fn test_cmp_bytes_at() {
        let id = ObjectHash::Sha1([0x42; 20]);
        let mut table = vec![0u8; 60];
        table[20..40].copy_from_slice(id.as_ref());
        assert_eq!(id.cmp_bytes_at(&table, 20), std::cmp::Ordering::Equal);
        assert_eq!(id.cmp_bytes_at(&table, 0), std::cmp::Ordering::Greater);
    }

    /// Even and odd length prefixes match ids correctly.
    #[test]
    fn test_id_prefix() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let id = ObjectHash::from_str("8ab686eafeb1f44702738c8b0f24f2567c36da6d").unwrap();

        let even = IdPrefix::from_hex("8ab6").unwrap();
        assert!(even.matches(&id));

        let odd = IdPrefix::from_hex("8ab68").unwrap();
        assert!(odd.matches(&id));

        let miss = IdPrefix::from_hex("8ab7").unwrap();
        assert!(!miss.matches(&id));

        assert!(IdPrefix::from_hex("").is_err());
        assert!(IdPrefix::from_hex("zz").is_err());
    }
}
