//! Wallet collaborator: resolves a submitter DID to its signing key.

use std::collections::HashMap;

use ledger_crypto::{keypair_from_seed, SigningKey};
use ledger_types::{Did, Verkey};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("no signing key stored for {0}")]
    KeyNotFound(Did),
}

/// Key storage boundary. Implementations may be backed by secure storage;
/// the client only ever asks for the key of one DID at a time.
pub trait KeyStore {
    fn signing_key(&self, did: &Did) -> Result<SigningKey, WalletError>;
}

#[derive(Debug, Clone)]
struct StoredKey {
    signing_key: SigningKey,
    verkey: Verkey,
}

/// Volatile key store. DIDs are created from 32-byte seeds.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWallet {
    keys: HashMap<Did, StoredKey>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives and stores the key pair for `seed`, returning its DID and verkey.
    pub fn create_did(&mut self, seed: [u8; 32]) -> (Did, Verkey) {
        let (signing_key, verkey, did) = keypair_from_seed(seed);
        self.keys.insert(
            did.clone(),
            StoredKey {
                signing_key,
                verkey,
            },
        );
        (did, verkey)
    }

    pub fn verkey(&self, did: &Did) -> Option<Verkey> {
        self.keys.get(did).map(|stored| stored.verkey)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for InMemoryWallet {
    fn signing_key(&self, did: &Did) -> Result<SigningKey, WalletError> {
        self.keys
            .get(did)
            .map(|stored| stored.signing_key.clone())
            .ok_or_else(|| WalletError::KeyNotFound(did.clone()))
    }
}
