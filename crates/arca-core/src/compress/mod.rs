use std::io::{Read, Write};

use arca_types::error::{ArcaError, Result};
use arca_types::CompressionType;

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;
const TAG_GZIP: u8 = 0x03;

const ZSTD_LEVEL: i32 = 3;

/// Maximum decompressed output size.
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 256 * 1024 * 1024;

/// Compress data and prepend a 1-byte tag identifying the codec.
///
/// The tag, not the caller's `BlobKey`, decides how the bytes are decoded:
/// a deduplicated object keeps whatever codec it was first stored with.
pub fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        CompressionType::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        CompressionType::Zstd => {
            let compressed = zstd::bulk::compress(data, ZSTD_LEVEL)
                .map_err(|e| ArcaError::Other(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        CompressionType::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            let compressed = encoder.finish()?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_GZIP);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(ArcaError::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(ArcaError::Decompression("lz4: payload too short".into()));
            }
            let mut size_prefix = [0u8; 4];
            size_prefix.copy_from_slice(&payload[..4]);
            let uncompressed_size = u32::from_le_bytes(size_prefix) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(ArcaError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| ArcaError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| ArcaError::Decompression(format!("zstd init: {e}")))?;
            read_bounded(decoder, "zstd")
        }
        TAG_GZIP => read_bounded(flate2::read::GzDecoder::new(payload), "gzip"),
        _ => Err(ArcaError::UnknownCompressionTag(tag)),
    }
}

fn read_bounded(reader: impl Read, codec: &str) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    reader
        .take(MAX_DECOMPRESS_SIZE + 1)
        .read_to_end(&mut output)
        .map_err(|e| ArcaError::Decompression(format!("{codec}: {e}")))?;
    if output.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(ArcaError::Decompression(format!(
            "{codec}: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(output)
}
