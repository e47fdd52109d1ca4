pub mod aes_gcm;
pub mod key;
pub mod object;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;
