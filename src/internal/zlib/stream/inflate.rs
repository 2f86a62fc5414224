//! Buffered inflate reader that decodes zlib-compressed object payloads
//! while accumulating the object-id digest for integrity checks. The reader
//! stops exactly at the deflate stream end so the caller can keep parsing
//! the bytes that follow in the same pack stream.

use std::{io, io::BufRead};

use flate2::{Decompress, FlushDecompress, Status};

use crate::{internal::object::types::ObjectType, utils::HashAlgorithm};

/// Inflates one object payload out of a longer DEFLATE-bearing stream
/// without consuming bytes past the compressed region.
pub struct ReadBoxed<R> {
    /// The reader from which bytes should be decompressed.
    pub inner: R,
    /// The decompressor doing all the work.
    pub decompressor: Box<Decompress>,
    /// Whether the digest is accumulated while reading.
    count_hash: bool,
    /// The running object-id digest over `<type> <size>\0` + inflated bytes.
    pub hash: HashAlgorithm,
}

impl<R> ReadBoxed<R>
where
    R: BufRead,
{
    /// Reader for a whole object: the digest is seeded with the canonical
    /// object header so finishing it yields the object id.
    pub fn new(inner: R, obj_type: ObjectType, size: usize) -> Self {
        let mut hash = HashAlgorithm::new();
        hash.update(obj_type.to_bytes());
        hash.update(b" ");
        hash.update(size.to_string().as_bytes());
        hash.update(b"\0");
        ReadBoxed {
            inner,
            hash,
            count_hash: true,
            decompressor: Box::new(Decompress::new(true)),
        }
    }

    /// Reader for a delta payload, which has no object id of its own.
    pub fn new_for_delta(inner: R) -> Self {
        ReadBoxed {
            inner,
            hash: HashAlgorithm::new(),
            count_hash: false,
            decompressor: Box::new(Decompress::new(true)),
        }
    }

    /// Total compressed bytes consumed from the inner reader so far.
    pub fn compressed_in(&self) -> u64 {
        self.decompressor.total_in()
    }
}

impl<R> io::Read for ReadBoxed<R>
where
    R: BufRead,
{
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        let o = read(&mut self.inner, &mut self.decompressor, into)?;
        if self.count_hash {
            self.hash.update(&into[..o]);
        }
        Ok(o)
    }
}

/// Read bytes from `rd` and decompress them using `state` into a
/// pre-allocated fitting buffer `dst`, returning the amount of bytes written.
fn read(rd: &mut impl BufRead, state: &mut Decompress, mut dst: &mut [u8]) -> io::Result<usize> {
    let mut total_written = 0;
    loop {
        let (written, consumed, ret, eof);
        {
            let input = rd.fill_buf()?;
            eof = input.is_empty();
            let before_out = state.total_out();
            let before_in = state.total_in();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            ret = state.decompress(input, dst, flush);
            written = (state.total_out() - before_out) as usize;
            total_written += written;
            dst = &mut dst[written..];
            consumed = (state.total_in() - before_in) as usize;
        }
        rd.consume(consumed);

        match ret {
            // The stream has officially ended, nothing more to do here.
            Ok(Status::StreamEnd) => return Ok(total_written),
            // Either input or output are depleted even though the stream is not depleted yet.
            Ok(Status::Ok | Status::BufError) if eof || dst.is_empty() => return Ok(total_written),
            // Some progress was made in both the input and the output, it must continue to reach the end.
            Ok(Status::Ok | Status::BufError) if consumed != 0 || written != 0 => continue,
            // A strange state, where zlib makes no progress but isn't done either.
            Ok(Status::Ok | Status::BufError) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "deflate stream stalled without progress",
                ));
            }
            Err(..) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "corrupt deflate stream",
                ));
            }
        }
    }
}
