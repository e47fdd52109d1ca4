pub mod blob_key;
pub mod error;
pub mod pack_id;
pub mod sha1_digest;

pub use blob_key::{BlobKey, CompressionType, StorageType};
pub use error::{ArcaError, Result};
pub use pack_id::PackId;
pub use sha1_digest::Sha1Digest;
