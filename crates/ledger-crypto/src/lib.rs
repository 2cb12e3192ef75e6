//! Crypto for the ledger client: canonical serialization, digests, and ed25519
//! signatures over requests and node replies.

pub mod canonical;
pub mod ed25519;

pub use canonical::{
    canonical_bytes, canonical_request_bytes, payload_digest, request_signing_input,
    serialize_for_signing, strip_paths, to_canonical_json,
};
pub use ed25519::{
    keypair_from_seed, sign_request, verify_request, verkey_of, Ed25519NodeSigner,
    Ed25519ReplyVerifier,
};
pub use ed25519_dalek::SigningKey;
