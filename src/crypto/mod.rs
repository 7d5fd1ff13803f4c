//! Cryptography module for biocrypt
//!
//! Provides AES-256-GCM cipher operations bound to vault keys.
//! Every encryption draws a fresh 96-bit IV; the IV travels next to the
//! ciphertext in an [`Envelope`].

mod encryption;
mod keys;

pub use encryption::{
    decrypt, encrypt, CipherMode, CipherOperation, Envelope, IvSource, RandomIv,
};
pub use keys::{KeyHandle, KeyMaterial, KeySpec};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM IV in bytes
pub const IV_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;
