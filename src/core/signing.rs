// Signing capabilities supplied by the wallet

use crate::core::Hash256;
use crate::error::Result;

/// Holds one private key and signs digests with it
pub trait Signer {
    /// Serialized public key that goes into the input's `pub_key`
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, digest: &Hash256) -> Result<Vec<u8>>;
}

/// Checks a signature over a digest against a serialized public key
pub trait Verifier {
    fn verify(&self, digest: &Hash256, signature: &[u8], public_key: &[u8]) -> bool;
}
