//! Streaming codecs over zlib.

pub mod inflate;
