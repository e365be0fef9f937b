// Wallet and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{Address, KeyPair, Keystore, Secp256k1Verifier};
pub use tx_builder::TransactionBuilder;
