//! Zlib stream helpers for pack payloads.

pub mod stream;
