use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey};
use ledger_types::{
    CryptoError, Did, NodeName, NodeSigner, ReplyFrame, ReplyVerifier, ReqId, Request,
    ValidationError, VerificationContext, Verkey,
};
use serde_json::Value;

use crate::canonical::{request_signing_input, to_canonical_json};

pub fn verkey_of(signing_key: &SigningKey) -> Verkey {
    Verkey::new(signing_key.verifying_key().to_bytes())
}

/// Deterministic keypair and DID from a 32-byte seed.
pub fn keypair_from_seed(seed: [u8; 32]) -> (SigningKey, Verkey, Did) {
    let signing_key = SigningKey::from_bytes(&seed);
    let verkey = verkey_of(&signing_key);
    let did = Did::from_verkey(&verkey);
    (signing_key, verkey, did)
}

/// Signs the request's ledger signing input and returns the signed copy.
pub fn sign_request(request: &Request, signing_key: &SigningKey) -> Result<Request, ValidationError> {
    let input = request_signing_input(request)?;
    let signature = signing_key.sign(&input);
    let mut signed = request.clone();
    signed.signature = Some(bs58::encode(signature.to_bytes()).into_string());
    Ok(signed)
}

pub fn verify_request(request: &Request, verkey: &Verkey) -> Result<(), CryptoError> {
    let encoded = request
        .signature
        .as_deref()
        .ok_or(CryptoError::InvalidSignature)?;
    let input =
        request_signing_input(request).map_err(|err| CryptoError::Message(err.to_string()))?;
    verify_detached(verkey, &input, encoded)
}

fn verify_detached(verkey: &Verkey, message: &[u8], encoded_signature: &str) -> Result<(), CryptoError> {
    let verify_key = VerifyingKey::from_bytes(verkey.as_bytes())
        .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
    let raw = bs58::decode(encoded_signature)
        .into_vec()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let raw: [u8; 64] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidLength {
            kind: "signature",
            expected: 64,
            actual: raw.len(),
        })?;
    verify_key
        .verify(message, &Signature::from_bytes(&raw))
        .map_err(|_| CryptoError::InvalidSignature)
}

#[derive(Debug, Clone)]
pub struct Ed25519NodeSigner {
    name: NodeName,
    signing_key: SigningKey,
}

impl Ed25519NodeSigner {
    pub fn new(name: NodeName, signing_key: SigningKey) -> Self {
        Self { name, signing_key }
    }

    pub fn from_seed(name: impl Into<NodeName>, seed: [u8; 32]) -> Self {
        Self::new(name.into(), SigningKey::from_bytes(&seed))
    }

    /// Same key, different claimed node name.
    pub fn with_name(&self, name: NodeName) -> Self {
        Self::new(name, self.signing_key.clone())
    }
}

impl NodeSigner for Ed25519NodeSigner {
    fn node_name(&self) -> &NodeName {
        &self.name
    }

    fn verkey(&self) -> Verkey {
        verkey_of(&self.signing_key)
    }

    fn sign_reply(&self, req_id: ReqId, reply: Value) -> Result<ReplyFrame, CryptoError> {
        let body = ReplyFrame::signed_body(&self.name, req_id, &reply);
        let signature = self.signing_key.sign(to_canonical_json(&body).as_bytes());
        Ok(ReplyFrame {
            node: self.name.clone(),
            req_id,
            reply,
            signature: bs58::encode(signature.to_bytes()).into_string(),
        })
    }
}

/// Checks reply frames against the verification keys of the known pool.
#[derive(Debug, Clone)]
pub struct Ed25519ReplyVerifier {
    context: VerificationContext,
}

impl Ed25519ReplyVerifier {
    pub fn new(context: VerificationContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &VerificationContext {
        &self.context
    }
}

impl ReplyVerifier for Ed25519ReplyVerifier {
    fn verify_frame(&self, frame: &ReplyFrame) -> Result<(), CryptoError> {
        let verkey = self.context.verkey(&frame.node)?;
        let body = to_canonical_json(&frame.body());
        verify_detached(verkey, body.as_bytes(), &frame.signature)
    }
}
