// Key management

use crate::core::{Hash256, Signer, Verifier, hash256, pubkey_hash};
use crate::error::{LedgerError, Result};
use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, VerifyOnly};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Version byte prefixed to the public key hash
const ADDRESS_VERSION: u8 = 0x00;

/// Length of the Base58Check checksum
const CHECKSUM_LEN: usize = 4;

/// Length of a public key hash (RIPEMD160)
const PUBKEY_HASH_LEN: usize = 20;

/// Base58Check address: version || pubkey hash || checksum
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create address from public key hash
    pub fn from_pubkey_hash(hash: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + hash.len() + CHECKSUM_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(hash);
        let checksum = checksum(&payload);
        payload.extend_from_slice(&checksum);
        Self(bs58::encode(payload).into_string())
    }

    /// Get address string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to the public key hash, checking version and checksum
    pub fn to_pubkey_hash(&self) -> Result<Vec<u8>> {
        let invalid = || LedgerError::InvalidAddress(self.0.clone());

        let bytes = bs58::decode(&self.0).into_vec().map_err(|_| invalid())?;
        if bytes.len() != 1 + PUBKEY_HASH_LEN + CHECKSUM_LEN {
            return Err(invalid());
        }

        let (payload, actual) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if payload[0] != ADDRESS_VERSION || checksum(payload)[..] != *actual {
            return Err(invalid());
        }

        Ok(payload[1..].to_vec())
    }

    pub fn validate(address: &str) -> bool {
        Address(address.to_string()).to_pubkey_hash().is_ok()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = hash256(payload);
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    checksum
}

/// Serializable key pair (for storage)
#[derive(Serialize, Deserialize)]
struct SerializableKeyPair {
    secret_key: String,
    address: Address,
}

/// Key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::signing_only();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(&secp);

        Self {
            secret_key,
            public_key,
        }
    }

    /// Create from secret key bytes
    fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secp = Secp256k1::signing_only();
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| LedgerError::Wallet(format!("invalid secret key: {}", e)))?;
        let public_key = secret_key.public_key(&secp);

        Ok(Self {
            secret_key,
            public_key,
        })
    }

    fn to_serializable(&self) -> SerializableKeyPair {
        SerializableKeyPair {
            secret_key: hex::encode(self.secret_key.secret_bytes()),
            address: self.address(),
        }
    }

    /// Compressed public key (33 bytes)
    pub fn pubkey_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    pub fn pubkey_hash(&self) -> Vec<u8> {
        pubkey_hash(&self.pubkey_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_pubkey_hash(&self.pubkey_hash())
    }
}

impl Signer for KeyPair {
    fn public_key(&self) -> Vec<u8> {
        self.pubkey_bytes()
    }

    /// ECDSA over the digest, 64-byte compact encoding
    fn sign(&self, digest: &Hash256) -> Result<Vec<u8>> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*digest.as_bytes());
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }
}

/// secp256k1 ECDSA verifier for compact signatures
pub struct Secp256k1Verifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Secp256k1Verifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }
}

impl Default for Secp256k1Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier for Secp256k1Verifier {
    fn verify(&self, digest: &Hash256, signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(signature) = Signature::from_compact(signature) else {
            return false;
        };
        let Ok(public_key) = PublicKey::from_slice(public_key) else {
            return false;
        };
        let message = Message::from_digest(*digest.as_bytes());
        self.secp.verify_ecdsa(&message, &signature, &public_key).is_ok()
    }
}

/// Keystore - manages multiple key pairs
pub struct Keystore {
    keys: HashMap<Address, KeyPair>,
    default_address: Option<Address>,
}

#[derive(Serialize, Deserialize)]
struct SerializableKeystore {
    keys: Vec<SerializableKeyPair>,
    default_address: Option<Address>,
}

impl Keystore {
    /// Create a new keystore
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            default_address: None,
        }
    }

    /// Generate a new address
    pub fn new_address(&mut self) -> Address {
        let keypair = KeyPair::generate();
        let address = keypair.address();

        // Set as default if first address
        if self.default_address.is_none() {
            self.default_address = Some(address.clone());
        }

        self.keys.insert(address.clone(), keypair);
        address
    }

    /// Get key pair for address
    pub fn get_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    /// All addresses, sorted
    pub fn list_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.keys.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Get default address
    pub fn default_address(&self) -> Option<&Address> {
        self.default_address.as_ref()
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Save keystore to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut keys: Vec<SerializableKeyPair> =
            self.keys.values().map(KeyPair::to_serializable).collect();
        keys.sort_by(|a, b| a.address.cmp(&b.address));

        let data = SerializableKeystore {
            keys,
            default_address: self.default_address.clone(),
        };

        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| LedgerError::Wallet(format!("failed to serialize keystore: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load keystore from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let data: SerializableKeystore = serde_json::from_str(&json)
            .map_err(|e| LedgerError::Wallet(format!("failed to deserialize keystore: {}", e)))?;

        let mut keys = HashMap::new();
        for stored in data.keys {
            let bytes = hex::decode(&stored.secret_key)
                .map_err(|e| LedgerError::Wallet(format!("invalid secret key encoding: {}", e)))?;
            let keypair = KeyPair::from_secret_bytes(&bytes)?;
            if keypair.address() != stored.address {
                return Err(LedgerError::Wallet(format!(
                    "key does not match address {}",
                    stored.address
                )));
            }
            keys.insert(stored.address, keypair);
        }

        Ok(Self {
            keys,
            default_address: data.default_address,
        })
    }

    /// Load from `path` if it exists, otherwise start empty
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            log::info!("Loading keystore from {}", path.as_ref().display());
            Self::load(path)
        } else {
            log::info!("Creating new keystore");
            Ok(Self::new())
        }
    }
}

impl Default for Keystore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();

        assert_eq!(kp.pubkey_bytes().len(), 33); // Compressed pubkey
        assert_eq!(kp.pubkey_hash().len(), 20);
    }

    #[test]
    fn test_address_conversion() {
        let hash = [0x12; 20];
        let addr = Address::from_pubkey_hash(&hash);

        assert!(addr.as_str().starts_with('1'));
        assert_eq!(addr.to_pubkey_hash().unwrap(), hash.to_vec());
        assert!(Address::validate(addr.as_str()));
    }

    #[test]
    fn test_address_checksum_mismatch() {
        let addr = Address::from_pubkey_hash(&[0x34; 20]);
        let mut bytes = bs58::decode(addr.as_str()).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = Address(bs58::encode(bytes).into_string());

        assert!(matches!(tampered.to_pubkey_hash(), Err(LedgerError::InvalidAddress(_))));
        assert!(!Address::validate("not-an-address"));
        assert!(!Address::validate("1111"));
    }

    #[test]
    fn test_sign_and_verify_digest() {
        let kp = KeyPair::generate();
        let verifier = Secp256k1Verifier::new();
        let digest = hash256(b"digest");

        let signature = kp.sign(&digest).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verifier.verify(&digest, &signature, &kp.pubkey_bytes()));

        assert!(!verifier.verify(&hash256(b"other"), &signature, &kp.pubkey_bytes()));
        let other = KeyPair::generate();
        assert!(!verifier.verify(&digest, &signature, &other.pubkey_bytes()));
        assert!(!verifier.verify(&digest, &signature[..10], &kp.pubkey_bytes()));
        assert!(!verifier.verify(&digest, &signature, b"garbage"));
    }

    #[test]
    fn test_keystore() {
        let mut ks = Keystore::new();

        assert_eq!(ks.count(), 0);
        assert!(ks.default_address().is_none());

        let addr1 = ks.new_address();
        assert_eq!(ks.count(), 1);
        assert_eq!(ks.default_address(), Some(&addr1));

        let addr2 = ks.new_address();
        assert_eq!(ks.count(), 2);

        assert!(ks.get_keypair(&addr1).is_some());
        assert!(ks.get_keypair(&addr2).is_some());

        let addresses = ks.list_addresses();
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn test_keystore_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let mut ks = Keystore::new();
        let addr = ks.new_address();
        ks.new_address();
        ks.save(&path).unwrap();

        let loaded = Keystore::open(&path).unwrap();
        assert_eq!(loaded.list_addresses(), ks.list_addresses());
        assert_eq!(loaded.default_address(), Some(&addr));
        assert_eq!(
            loaded.get_keypair(&addr).unwrap().pubkey_bytes(),
            ks.get_keypair(&addr).unwrap().pubkey_bytes()
        );
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(ks.count(), 0);
    }
}
