//! Pack storage: the `.idx` index format, the multi-pack index that unifies
//! many packs under one ordered keyspace, the deduplicating index merger,
//! the block-addressable byte sources packs are read through, and the fsck
//! re-parser that validates a pack against its index. All formats follow
//! the [pack-format spec](https://git-scm.com/docs/pack-format).

pub mod block;
pub mod fsck;
pub mod index;
pub mod merger;
pub mod midx;
pub mod wrapper;

#[cfg(test)]
mod tests {
    use tracing_subscriber::util::SubscriberInitExt;

    /// Shared tracing bootstrap for pack tests; safe to call repeatedly.
    #[allow(dead_code)]
    pub(crate) fn init_logger() {
        let _ = tracing_subscriber::fmt::Subscriber::builder()
            .with_target(false)
            .without_time()
            .with_level(true)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
            .try_init();
    }
}
