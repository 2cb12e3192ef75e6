//! Trait definitions for reply signing and verification.

use std::collections::HashMap;

use serde_json::Value;

use crate::{
    error::CryptoError,
    ids::{NodeIdentity, NodeName, ReqId, Verkey},
    reply::ReplyFrame,
};

/// Verification keys of the nodes the client currently trusts.
#[derive(Debug, Clone, Default)]
pub struct VerificationContext {
    pub nodes: HashMap<NodeName, Verkey>,
}

impl VerificationContext {
    pub fn from_identities<'a>(identities: impl IntoIterator<Item = &'a NodeIdentity>) -> Self {
        Self {
            nodes: identities
                .into_iter()
                .map(|node| (node.name.clone(), node.verkey))
                .collect(),
        }
    }

    pub fn verkey(&self, node: &NodeName) -> Result<&Verkey, CryptoError> {
        self.nodes
            .get(node)
            .ok_or_else(|| CryptoError::UnknownNode(node.clone()))
    }
}

pub trait NodeSigner {
    fn node_name(&self) -> &NodeName;

    fn verkey(&self) -> Verkey;

    fn sign_reply(&self, req_id: ReqId, reply: Value) -> Result<ReplyFrame, CryptoError>;
}

pub trait ReplyVerifier {
    fn verify_frame(&self, frame: &ReplyFrame) -> Result<(), CryptoError>;
}
