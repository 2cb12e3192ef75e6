//! MockNode: a simulated validator that answers ledger requests with signed
//! reply frames, optionally misbehaving.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ledger_crypto::{Ed25519NodeSigner, SigningKey};
use ledger_types::{
    reply::{ack, reject, reply},
    CryptoError, NodeIdentity, NodeName, NodeSigner, RejectKind, ReplyFrame, ReqId, Request,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::ledger::{DomainLedger, Refusal};

/// How a simulated node deviates from the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBehavior {
    Honest,
    /// Processes requests but never answers.
    Silent,
    /// Tampers with the terminal payload after signing it.
    CorruptPayload,
    /// Signs with a key that is not its registered verkey.
    BadSignature,
    /// Signs with its own key while claiming another node's name.
    Impersonate(NodeName),
    /// Returns a validly signed but different terminal payload. Nodes sharing
    /// a seed agree with each other.
    Divergent(u64),
    /// Sends a stale terminal payload followed by the honest one.
    Resend,
    /// Refuses every exchange.
    Unavailable,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} is unavailable")]
    Unavailable(NodeName),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone)]
pub struct MockNode {
    signer: Ed25519NodeSigner,
    address: String,
    ledger: DomainLedger,
    behavior: NodeBehavior,
    /// Terminal outcomes of writes already processed, keyed by submitter and reqId.
    processed_writes: HashMap<(String, ReqId), Vec<Value>>,
}

impl MockNode {
    pub fn new(signer: Ed25519NodeSigner, address: impl Into<String>, ledger: DomainLedger) -> Self {
        Self {
            signer,
            address: address.into(),
            ledger,
            behavior: NodeBehavior::Honest,
            processed_writes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &NodeName {
        self.signer.node_name()
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            name: self.name().clone(),
            address: self.address.clone(),
            verkey: self.signer.verkey(),
        }
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn behavior(&self) -> &NodeBehavior {
        &self.behavior
    }

    pub fn set_behavior(&mut self, behavior: NodeBehavior) {
        self.behavior = behavior;
    }

    pub fn ledger(&self) -> &DomainLedger {
        &self.ledger
    }

    /// Handles one serialized request and returns the frames to send back, in
    /// order. Writes answer with a REQACK before the terminal frame.
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Vec<ReplyFrame>, NodeError> {
        if self.behavior == NodeBehavior::Unavailable {
            return Err(NodeError::Unavailable(self.name().clone()));
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| NodeError::MalformedRequest(err.to_string()))?;
        let req_id = value
            .get("reqId")
            .and_then(Value::as_u64)
            .map(ReqId)
            .ok_or_else(|| NodeError::MalformedRequest("missing reqId".to_string()))?;
        let identifier = value
            .get("identifier")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut payloads = match Request::from_value(value) {
            Ok(request) => self.process(&request),
            Err(err) => vec![reject(
                RejectKind::ReqNack,
                req_id,
                &identifier,
                &format!("invalid request: {err}"),
            )],
        };
        let served_at = unix_millis();
        for payload in payloads.iter_mut() {
            if payload.get("result").is_some() {
                payload["servedAt"] = json!(served_at);
            }
        }
        debug!(
            node = %self.name(),
            req_id = %req_id,
            frames = payloads.len(),
            behavior = ?self.behavior,
            "handled request"
        );
        self.seal(req_id, payloads)
    }

    fn process(&mut self, request: &Request) -> Vec<Value> {
        let identifier = request.identifier.as_str();
        if request.kind().is_read() {
            return match self.ledger.answer_read(request) {
                Ok(result) => vec![reply(result)],
                Err(refusal) => vec![refusal_payload(request.req_id, identifier, &refusal)],
            };
        }
        let key = (identifier.to_string(), request.req_id);
        if let Some(previous) = self.processed_writes.get(&key) {
            return previous.clone();
        }
        let payloads = match self.ledger.apply_write(request) {
            Ok(result) => vec![ack(request.req_id, identifier), reply(result)],
            // Static rejections are not ordered, so a corrected resend is judged afresh.
            Err(refusal) if refusal.kind == RejectKind::ReqNack => {
                return vec![refusal_payload(request.req_id, identifier, &refusal)];
            }
            Err(refusal) => vec![
                ack(request.req_id, identifier),
                refusal_payload(request.req_id, identifier, &refusal),
            ],
        };
        self.processed_writes.insert(key, payloads.clone());
        payloads
    }

    /// Signs payloads into frames, applying the configured misbehaviour.
    fn seal(&self, req_id: ReqId, mut payloads: Vec<Value>) -> Result<Vec<ReplyFrame>, NodeError> {
        match &self.behavior {
            NodeBehavior::Honest | NodeBehavior::Unavailable => {
                self.sign_all(&self.signer, req_id, payloads)
            }
            NodeBehavior::Silent => Ok(Vec::new()),
            NodeBehavior::CorruptPayload => {
                let mut frames = self.sign_all(&self.signer, req_id, payloads)?;
                if let Some(last) = frames.last_mut() {
                    forge(&mut last.reply, u64::MAX);
                }
                Ok(frames)
            }
            NodeBehavior::BadSignature => {
                let rogue = Ed25519NodeSigner::new(
                    self.name().clone(),
                    SigningKey::from_bytes(&[0xba; 32]),
                );
                self.sign_all(&rogue, req_id, payloads)
            }
            NodeBehavior::Impersonate(name) => {
                let impostor = self.signer.with_name(name.clone());
                self.sign_all(&impostor, req_id, payloads)
            }
            NodeBehavior::Divergent(seed) => {
                if let Some(last) = payloads.last_mut() {
                    forge(last, *seed);
                }
                self.sign_all(&self.signer, req_id, payloads)
            }
            NodeBehavior::Resend => {
                if let Some(last) = payloads.last().cloned() {
                    let mut stale = last;
                    forge(&mut stale, 0);
                    let at = payloads.len() - 1;
                    payloads.insert(at, stale);
                }
                self.sign_all(&self.signer, req_id, payloads)
            }
        }
    }

    fn sign_all(
        &self,
        signer: &Ed25519NodeSigner,
        req_id: ReqId,
        payloads: Vec<Value>,
    ) -> Result<Vec<ReplyFrame>, NodeError> {
        payloads
            .into_iter()
            .map(|payload| signer.sign_reply(req_id, payload).map_err(NodeError::from))
            .collect()
    }
}

fn refusal_payload(req_id: ReqId, identifier: &str, refusal: &Refusal) -> Value {
    reject(refusal.kind, req_id, identifier, &refusal.reason)
}

fn forge(payload: &mut Value, seed: u64) {
    match payload.get_mut("result") {
        Some(result) if result.is_object() => result["forged"] = json!(seed),
        _ => payload["reason"] = json!(format!("forged reason {seed}")),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use ledger_crypto::{keypair_from_seed, sign_request, Ed25519NodeSigner, Ed25519ReplyVerifier};
    use ledger_types::{
        NodeName, NodeReply, Operation, RejectKind, ReplyFrame, ReplyVerifier, ReqId, Request,
        VerificationContext,
    };
    use serde_json::Value;

    use super::{MockNode, NodeBehavior, NodeError};
    use crate::ledger::DomainLedger;

    const TRUSTEE_SEED: [u8; 32] = *b"000000000000000000000000Trustee1";

    fn node() -> MockNode {
        let (_, verkey, did) = keypair_from_seed(TRUSTEE_SEED);
        MockNode::new(
            Ed25519NodeSigner::from_seed("Node1", [0x01; 32]),
            "127.0.0.1:9702",
            DomainLedger::with_trustee(1_000, did, verkey),
        )
    }

    fn verifier(node: &MockNode) -> Ed25519ReplyVerifier {
        Ed25519ReplyVerifier::new(VerificationContext::from_identities(&[node.identity()]))
    }

    fn schema_request() -> Vec<u8> {
        let (key, _, did) = keypair_from_seed(TRUSTEE_SEED);
        let request = Request {
            req_id: ReqId(10),
            identifier: did,
            operation: Operation::Schema {
                data: r#"{"keys":["name"],"name":"gvt","version":"1.0"}"#.to_string(),
            },
            signature: None,
        };
        serde_json::to_vec(&sign_request(&request, &key).unwrap()).unwrap()
    }

    fn get_txn(seq_no: u64) -> Vec<u8> {
        let (_, _, did) = keypair_from_seed(TRUSTEE_SEED);
        let request = Request {
            req_id: ReqId(11),
            identifier: did,
            operation: Operation::GetTxn { data: seq_no },
            signature: None,
        };
        serde_json::to_vec(&request).unwrap()
    }

    fn terminal(frames: &[ReplyFrame]) -> NodeReply {
        NodeReply::from_payload(&frames.last().unwrap().reply).unwrap()
    }

    #[test]
    fn honest_write_acks_then_replies_with_signed_frames() {
        let mut node = node();
        let frames = node.handle(&schema_request()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].reply["op"], "REQACK");
        assert_eq!(frames[1].reply["op"], "REPLY");
        assert_eq!(frames[1].reply["result"]["seqNo"], 2);
        assert!(frames[1].reply["servedAt"].is_u64());
        let verifier = verifier(&node);
        for frame in &frames {
            verifier.verify_frame(frame).expect("honest frames verify");
        }
    }

    #[test]
    fn unsigned_write_is_nacked_without_ack() {
        let mut node = node();
        let mut request: Value = serde_json::from_slice(&schema_request()).unwrap();
        request.as_object_mut().unwrap().remove("signature");
        let frames = node.handle(&serde_json::to_vec(&request).unwrap()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            terminal(&frames),
            NodeReply::Rejected { kind: RejectKind::ReqNack, .. }
        ));
    }

    #[test]
    fn malformed_operation_is_nacked_and_missing_req_id_errors() {
        let mut node = node();
        let frames = node
            .handle(br#"{"reqId":3,"identifier":"x","operation":{"type":"999"}}"#)
            .unwrap();
        assert!(matches!(
            terminal(&frames),
            NodeReply::Rejected { kind: RejectKind::ReqNack, .. }
        ));
        assert!(matches!(
            node.handle(br#"{"identifier":"x"}"#),
            Err(NodeError::MalformedRequest(_))
        ));
    }

    #[test]
    fn misbehaving_nodes_fail_verification() {
        let honest = node();
        let verifier = verifier(&honest);
        for behavior in [
            NodeBehavior::CorruptPayload,
            NodeBehavior::BadSignature,
            NodeBehavior::Impersonate(NodeName::new("Node2")),
        ] {
            let mut node = honest.clone();
            node.set_behavior(behavior.clone());
            let frames = node.handle(&get_txn(1)).unwrap();
            assert!(
                verifier.verify_frame(frames.last().unwrap()).is_err(),
                "{behavior:?} must not verify"
            );
        }
    }

    #[test]
    fn divergent_nodes_sign_matching_forgeries() {
        let mut a = node();
        let mut b = node();
        a.set_behavior(NodeBehavior::Divergent(7));
        b.set_behavior(NodeBehavior::Divergent(7));
        let fa = a.handle(&get_txn(1)).unwrap();
        let fb = b.handle(&get_txn(1)).unwrap();
        verifier(&a).verify_frame(&fa[0]).unwrap();
        assert_eq!(fa[0].reply["result"]["forged"], 7);
        assert_eq!(fa[0].reply["result"], fb[0].reply["result"]);
    }

    #[test]
    fn silent_resend_and_unavailable() {
        let mut silent = node();
        silent.set_behavior(NodeBehavior::Silent);
        assert!(silent.handle(&schema_request()).unwrap().is_empty());
        assert_eq!(silent.ledger().len(), 2, "silent nodes still apply writes");
        silent.set_behavior(NodeBehavior::Honest);
        let replayed = silent.handle(&schema_request()).unwrap();
        assert_eq!(replayed[1].reply["op"], "REPLY", "a resent write is answered from cache");
        assert_eq!(silent.ledger().len(), 2);

        let mut resend = node();
        resend.set_behavior(NodeBehavior::Resend);
        let frames = resend.handle(&get_txn(1)).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].reply["result"].get("forged").is_some());
        assert!(frames[1].reply["result"].get("forged").is_none());

        let mut down = node();
        down.set_behavior(NodeBehavior::Unavailable);
        assert!(matches!(
            down.handle(&get_txn(1)),
            Err(NodeError::Unavailable(_))
        ));
    }
}
