use arca_types::CompressionType;

pub(super) fn default_max_pack_size_mb() -> u32 {
    10
}

pub(super) fn default_max_pack_item_size_bytes() -> u64 {
    256 * 1024 // 256 KiB
}

pub(super) fn default_encryption_version() -> u32 {
    2
}

pub(super) fn default_kdf_time_cost() -> u32 {
    3
}

pub(super) fn default_kdf_memory_cost() -> u32 {
    64 * 1024 // 64 MiB, in KiB
}

pub(super) fn default_kdf_parallelism() -> u32 {
    4
}

pub(super) fn default_use_cache() -> bool {
    true
}

pub(super) fn default_compression() -> CompressionType {
    CompressionType::Lz4
}
