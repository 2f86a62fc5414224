//! Reader wrapper that tracks how many bytes of a pack have been consumed
//! while keeping a running CRC32 over the raw entry bytes, so the fsck
//! parser can checksum each object's header + compressed payload span.

use std::io::{self, BufRead, Read};

use crc32fast::Hasher;

/// Wraps any `BufRead` and folds every byte that passes through into a
/// CRC32 accumulator. The accumulator is reset at the start of each pack
/// entry and taken at its end, giving the per-entry checksum the pack
/// index stores.
pub struct CrcWrapper<R> {
    inner: R,
    crc: Hasher,
    bytes_read: u64,
}

impl<R> CrcWrapper<R>
where
    R: BufRead,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            crc: Hasher::new(),
            bytes_read: 0,
        }
    }

    /// Returns the number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Start a fresh CRC span at the current position.
    pub fn reset_crc(&mut self) {
        self.crc = Hasher::new();
    }

    /// Finish the current CRC span, returning its value and resetting.
    pub fn take_crc(&mut self) -> u32 {
        std::mem::replace(&mut self.crc, Hasher::new()).finalize()
    }
}

impl<R> BufRead for CrcWrapper<R>
where
    R: BufRead,
{
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        let buffer = self.inner.fill_buf().expect("Failed to fill buffer");
        self.crc.update(&buffer[..amt]);
        self.inner.consume(amt);
        self.bytes_read += amt as u64;
    }
}

impl<R> Read for CrcWrapper<R>
where
    R: BufRead,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let o = self.inner.read(buf)?;
        self.crc.update(&buf[..o]);
        self.bytes_read += o as u64;
        Ok(o)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::*;

    /// CRC spans cover exactly the bytes between reset and take.
    #[test]
    fn test_crc_spans() {
        let data = b"first-span|second-span";
        let mut wrapper = CrcWrapper::new(BufReader::new(Cursor::new(data.as_ref())));

        let mut head = [0u8; 11];
        wrapper.read_exact(&mut head).unwrap();
        let first = wrapper.take_crc();
        assert_eq!(first, crc32fast::hash(b"first-span|"));

        let mut tail = Vec::new();
        wrapper.read_to_end(&mut tail).unwrap();
        assert_eq!(wrapper.take_crc(), crc32fast::hash(b"second-span"));
        assert_eq!(wrapper.bytes_read(), data.len() as u64);
    }

    /// Consumed buffered bytes are folded into the CRC too.
    #[test]
    fn test_consume_counts() {
        let data = b"abcdef";
        let mut wrapper = CrcWrapper::new(BufReader::new(Cursor::new(data.as_ref())));
        let available = wrapper.fill_buf().unwrap().len();
        assert_eq!(available, 6);
        wrapper.consume(3);
        assert_eq!(wrapper.take_crc(), crc32fast::hash(b"abc"));
        assert_eq!(wrapper.bytes_read(), 3);
    }
}
