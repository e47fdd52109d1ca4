use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use arca_storage::{RetryConfig, StorageBackend};
use arca_types::Sha1Digest;

use crate::repo::fark::Fark;
use crate::repo::pack_set::{PackSet, PackSetLimits};
use crate::testutil::{init_test_environment, TEST_COMPUTER};

pub const TEST_PACK_SET: &str = "bucket-1-blobs";

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        retry_delay_ms: 1,
        retry_max_delay_ms: 4,
    }
}

pub fn fark(backend: impl StorageBackend + 'static) -> Arc<Fark> {
    init_test_environment();
    Arc::new(Fark::new(Arc::new(backend), TEST_COMPUTER, fast_retry()))
}

pub fn limits() -> PackSetLimits {
    PackSetLimits {
        max_pack_size: 1024 * 1024,
        max_pack_item_size: 64 * 1024,
        consolidate_below: 512 * 1024,
    }
}

pub fn pack_set(backend: impl StorageBackend + 'static, limits: PackSetLimits) -> PackSet {
    PackSet::new(fark(backend), TEST_PACK_SET, limits)
}

/// Deterministic object: `(sha1, bytes)` of `len` copies of `byte`.
pub fn object(byte: u8, len: usize) -> (Sha1Digest, Vec<u8>) {
    let data = vec![byte; len];
    (Sha1Digest::compute(&data), data)
}

/// Millisecond-precision timestamp, as stored in commits.
pub fn date(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}
