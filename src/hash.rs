//! The hash primitive behind signatures and authentication tags.
//!
//! The primitive is a trusted black box. [`HashPrimitive`] is the seam the
//! builder, verifier and stack instrument call through, so tests can count
//! invocations and bring-up builds can swap implementations.

use sha2::{Digest as _, Sha512};

use crate::consts::HASH_BYTES;

/// A digest produced by the hash primitive.
pub type Digest = [u8; HASH_BYTES];

/// A cryptographic hash over the concatenation of byte slices.
pub trait HashPrimitive {
    /// Hashes `parts` as if they were one contiguous message.
    fn hash(&mut self, parts: &[&[u8]]) -> Digest;
}

impl<H: HashPrimitive + ?Sized> HashPrimitive for &mut H {
    fn hash(&mut self, parts: &[&[u8]]) -> Digest {
        (**self).hash(parts)
    }
}

/// SHA-512, the primitive the backend signs with.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha512Hash;

impl HashPrimitive for Sha512Hash {
    fn hash(&mut self, parts: &[&[u8]]) -> Digest {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        let mut digest = [0u8; HASH_BYTES];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }
}
