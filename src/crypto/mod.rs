/// Symmetric primitives, hashing, key derivation and seed material.
///
/// Post-quantum primitives live in [`crate::pq`]; everything here is
/// classical and has no fallback path.
pub mod aead;
pub mod entropy;
pub mod hash;
pub mod kdf;
pub mod sensitive;
