// Hashing utilities

use sha2::{Sha256, Digest};
use crate::core::Hash256;

/// SHA256 double hash
/// hash256 = SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let first_hash = Sha256::digest(data);
    let second_hash = Sha256::digest(first_hash);
    let mut result = [0u8; 32];
    result.copy_from_slice(&second_hash);
    Hash256::new(result)
}

/// RIPEMD160(SHA256(data)) - used for address generation
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::{Ripemd160, Digest as RipemdDigest};
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut result = [0u8; 20];
    result.copy_from_slice(&ripemd);
    result
}

/// Hash that locks an output to the owner of `public_key`
pub fn pubkey_hash(public_key: &[u8]) -> Vec<u8> {
    hash160(public_key).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256() {
        let data = b"hello world";
        let hash = hash256(data);

        // Same data should produce same hash
        let hash2 = hash256(data);
        assert_eq!(hash, hash2);
        assert_ne!(hash, hash256(b"hello world!"));
    }

    #[test]
    fn test_hash256_empty() {
        // Known vector: SHA256d("")
        let hash = hash256(b"");
        assert_eq!(
            hash.to_hex(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_pubkey_hash() {
        let hash = pubkey_hash(b"test data");
        assert_eq!(hash.len(), 20);
        assert_eq!(hash, hash160(b"test data").to_vec());
    }
}
