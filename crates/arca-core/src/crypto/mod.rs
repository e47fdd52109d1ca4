pub mod object_encryptor;

pub use object_encryptor::{EncryptionParams, ObjectEncryptor};
