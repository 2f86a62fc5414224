//! Block-addressable pack byte sources and the bounded block cache.
//!
//! The fsck parser never touches files directly: it reads through a
//! [`BlockChannel`], which serves positioned reads in `block_size` pages.
//! A shared [`BlockCache`] bounded by `core.dfs.blockLimit` keeps hot
//! blocks, with `core.dfs.streamRatio` capping how much of the cache one
//! stream may occupy during reuse.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use bytes::Bytes;
use lru_mem::{HeapSize, LruCache};

use crate::{config::BlockCacheConfig, errors::GitError};

/// A positioned, paged byte source for pack data.
///
/// Semantics: a read at a position past the end returns 0 bytes (EOF); a
/// read crossing the end returns the bytes available. `close` is
/// idempotent.
pub trait BlockChannel: Send + Sync {
    /// Read up to `dst.len()` bytes starting at `position`.
    fn read(&self, position: u64, dst: &mut [u8]) -> Result<usize, GitError>;

    /// Total size of the source in bytes.
    fn size(&self) -> Result<u64, GitError>;

    /// Page size for aligned reads; a power of two.
    fn block_size(&self) -> usize;

    /// Release the underlying resource. Idempotent.
    fn close(&self);
}

/// File-backed channel.
pub struct FileChannel {
    file: Mutex<File>,
    block_size: usize,
    closed: AtomicBool,
}

impl FileChannel {
    pub fn new(file: File, block_size: usize) -> FileChannel {
        FileChannel {
            file: Mutex::new(file),
            block_size,
            closed: AtomicBool::new(false),
        }
    }
}

impl BlockChannel for FileChannel {
    fn read(&self, position: u64, dst: &mut [u8]) -> Result<usize, GitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GitError::IOError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel closed",
            )));
        }
        let mut file = self.file.lock().expect("file channel lock poisoned");
        file.seek(SeekFrom::Start(position))?;
        let mut total = 0;
        while total < dst.len() {
            let n = file.read(&mut dst[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn size(&self) -> Result<u64, GitError> {
        let file = self.file.lock().expect("file channel lock poisoned");
        Ok(file.metadata()?.len())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory channel over a byte buffer.
pub struct BytesChannel {
    data: Bytes,
    block_size: usize,
}

impl BytesChannel {
    pub fn new(data: impl Into<Bytes>, block_size: usize) -> BytesChannel {
        BytesChannel {
            data: data.into(),
            block_size,
        }
    }
}

impl BlockChannel for BytesChannel {
    fn read(&self, position: u64, dst: &mut [u8]) -> Result<usize, GitError> {
        let len = self.data.len() as u64;
        if position >= len {
            return Ok(0);
        }
        let start = position as usize;
        let n = dst.len().min(self.data.len() - start);
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> Result<u64, GitError> {
        Ok(self.data.len() as u64)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn close(&self) {}
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct BlockKey {
    stream: u64,
    block: u64,
}

impl HeapSize for BlockKey {
    fn heap_size(&self) -> usize {
        0
    }
}

#[derive(Clone)]
struct Block(Bytes);

impl HeapSize for Block {
    fn heap_size(&self) -> usize {
        self.0.len()
    }
}

struct StreamUse {
    bytes: usize,
    blocks: VecDeque<(u64, usize)>,
}

struct CacheInner {
    lru: LruCache<BlockKey, Block>,
    streams: HashMap<u64, StreamUse>,
}

/// Shared pack block cache bounded by `core.dfs.blockLimit`.
///
/// Each stream (one open parse) gets its own id; its cached bytes are
/// capped at `stream_limit` so a long sequential scan cannot flush every
/// other reader's blocks.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    stream_limit: usize,
    next_stream: AtomicU64,
}

impl BlockCache {
    pub fn new(config: &BlockCacheConfig) -> Result<Arc<BlockCache>, GitError> {
        config.validate()?;
        Ok(Arc::new(BlockCache {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(config.block_limit),
                streams: HashMap::new(),
            }),
            stream_limit: config.stream_limit(),
            next_stream: AtomicU64::new(1),
        }))
    }

    /// Allocate an id for a new read stream.
    pub fn new_stream_id(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, stream: u64, block: u64) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("block cache lock poisoned");
        inner
            .lru
            .get(&BlockKey { stream, block })
            .map(|b| b.0.clone())
    }

    pub fn put(&self, stream: u64, block: u64, data: Bytes) {
        let mut guard = self.inner.lock().expect("block cache lock poisoned");
        let inner = &mut *guard;
        let len = data.len();
        if len > self.stream_limit {
            return;
        }
        // Trim this stream down to its share before inserting.
        inner.streams.entry(stream).or_insert(StreamUse {
            bytes: 0,
            blocks: VecDeque::new(),
        });
        loop {
            let usage = inner.streams.get_mut(&stream).expect("stream usage entry");
            if usage.bytes + len <= self.stream_limit {
                break;
            }
            let Some((old_block, old_len)) = usage.blocks.pop_front() else {
                break;
            };
            usage.bytes = usage.bytes.saturating_sub(old_len);
            inner.lru.remove(&BlockKey {
                stream,
                block: old_block,
            });
        }
        if inner
            .lru
            .insert(BlockKey { stream, block }, Block(data))
            .is_ok()
        {
            let usage = inner.streams.get_mut(&stream).expect("stream usage entry");
            usage.bytes += len;
            usage.blocks.push_back((block, len));
        }
    }

    /// Drop bookkeeping for a finished stream.
    pub fn release_stream(&self, stream: u64) {
        let mut inner = self.inner.lock().expect("block cache lock poisoned");
        if let Some(usage) = inner.streams.remove(&stream) {
            for (block, _) in usage.blocks {
                inner.lru.remove(&BlockKey { stream, block });
            }
        }
    }
}

/// Sequential `BufRead` adapter over a [`BlockChannel`].
///
/// Fetches are always block-aligned: the fetch position is
/// `floor(pos / block_size) * block_size`, and the unread head of the block
/// is skipped. A short read on the first byte of a block is end-of-stream;
/// a truncated tail block yields the bytes available.
pub struct ChannelReader<'a> {
    channel: &'a dyn BlockChannel,
    cache: Option<(Arc<BlockCache>, u64)>,
    position: u64,
    buffer: Bytes,
    buffer_pos: usize,
}

impl<'a> ChannelReader<'a> {
    pub fn new(channel: &'a dyn BlockChannel, cache: Option<Arc<BlockCache>>) -> ChannelReader<'a> {
        let cache = cache.map(|c| {
            let stream = c.new_stream_id();
            (c, stream)
        });
        ChannelReader {
            channel,
            cache,
            position: 0,
            buffer: Bytes::new(),
            buffer_pos: 0,
        }
    }

    /// Absolute position of the next byte to be returned.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn load_block(&mut self) -> io::Result<()> {
        let block_size = self.channel.block_size() as u64;
        let block = self.position / block_size;
        let block_start = block * block_size;

        if let Some((cache, stream)) = &self.cache {
            if let Some(data) = cache.get(*stream, block) {
                self.buffer = data;
                self.buffer_pos = (self.position - block_start) as usize;
                return Ok(());
            }
        }

        let mut buf = vec![0u8; block_size as usize];
        let n = self
            .channel
            .read(block_start, &mut buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        buf.truncate(n);
        let data = Bytes::from(buf);
        if let Some((cache, stream)) = &self.cache {
            cache.put(*stream, block, data.clone());
        }
        self.buffer = data;
        self.buffer_pos = (self.position - block_start) as usize;
        Ok(())
    }
}

impl Drop for ChannelReader<'_> {
    fn drop(&mut self) {
        if let Some((cache, stream)) = &self.cache {
            cache.release_stream(*stream);
        }
    }
}

impl BufRead for ChannelReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buffer_pos >= self.buffer.len() {
            self.load_block()?;
        }
        Ok(&self.buffer[self.buffer_pos.min(self.buffer.len())..])
    }

    fn consume(&mut self, amt: usize) {
        self.buffer_pos += amt;
        self.position += amt as u64;
    }
}

impl Read for ChannelReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}
