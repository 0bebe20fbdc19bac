pub mod crypto;
pub mod kdf;

pub use crypto::{decrypt, encrypt, fingerprint, CipherError};
pub use kdf::{derive_password_hash, Argon2Params, MasterKey};
