//! Node reply wire types.
//!
//! Each node answers with a signed frame `{"node","reqId","reply","signature"}`.
//! `reply` is the ledger-defined payload, one of:
//! - `{"op":"REPLY","result":{..}}`
//! - `{"op":"REJECT"|"REQNACK","reqId":..,"identifier":..,"reason":..}`
//! - `{"op":"REQACK","reqId":..,"identifier":..}` (non-terminal)

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::ValidationError,
    ids::{NodeName, ReqId},
};

pub const OP_REPLY: &str = "REPLY";
pub const OP_REJECT: &str = "REJECT";
pub const OP_REQNACK: &str = "REQNACK";
pub const OP_REQACK: &str = "REQACK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    pub node: NodeName,
    pub req_id: ReqId,
    pub reply: Value,
    pub signature: String,
}

impl ReplyFrame {
    /// The value a node signs: every frame field except the signature.
    pub fn signed_body(node: &NodeName, req_id: ReqId, reply: &Value) -> Value {
        json!({
            "node": node,
            "reqId": req_id,
            "reply": reply,
        })
    }

    pub fn body(&self) -> Value {
        Self::signed_body(&self.node, self.req_id, &self.reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    /// Static validation failed before ordering.
    ReqNack,
    /// Ordered but refused, e.g. for lack of privilege.
    Reject,
}

/// Typed view of a reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeReply {
    Reply { result: Value },
    Rejected { kind: RejectKind, reason: String },
    Ack,
}

impl NodeReply {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        let op = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("op"))?;
        match op {
            OP_REPLY => {
                let result = payload
                    .get("result")
                    .filter(|result| result.is_object())
                    .ok_or(ValidationError::MissingField("result"))?;
                Ok(Self::Reply {
                    result: result.clone(),
                })
            }
            OP_REJECT | OP_REQNACK => {
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let kind = if op == OP_REJECT {
                    RejectKind::Reject
                } else {
                    RejectKind::ReqNack
                };
                Ok(Self::Rejected { kind, reason })
            }
            OP_REQACK => Ok(Self::Ack),
            other => Err(ValidationError::Message(format!("unknown reply op `{other}`"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ack)
    }

    /// `reqId` echoed inside the payload, when the node included one.
    pub fn echoed_req_id(payload: &Value) -> Option<u64> {
        payload
            .get("result")
            .and_then(|result| result.get("reqId"))
            .or_else(|| payload.get("reqId"))
            .and_then(Value::as_u64)
    }
}

pub fn reply(result: Value) -> Value {
    json!({ "op": OP_REPLY, "result": result })
}

pub fn reject(kind: RejectKind, req_id: ReqId, identifier: &str, reason: &str) -> Value {
    let op = match kind {
        RejectKind::Reject => OP_REJECT,
        RejectKind::ReqNack => OP_REQNACK,
    };
    json!({
        "op": op,
        "reqId": req_id,
        "identifier": identifier,
        "reason": reason,
    })
}

pub fn ack(req_id: ReqId, identifier: &str) -> Value {
    json!({ "op": OP_REQACK, "reqId": req_id, "identifier": identifier })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{reject, NodeReply, RejectKind};
    use crate::ReqId;

    #[test]
    fn classifies_reply_ops() {
        let ok = NodeReply::from_payload(&json!({"op": "REPLY", "result": {"seqNo": 5}})).unwrap();
        assert!(matches!(ok, NodeReply::Reply { .. }));

        let nack = NodeReply::from_payload(&reject(RejectKind::ReqNack, ReqId(1), "did", "bad"))
            .unwrap();
        assert_eq!(
            nack,
            NodeReply::Rejected {
                kind: RejectKind::ReqNack,
                reason: "bad".to_string()
            }
        );

        let ack = NodeReply::from_payload(&json!({"op": "REQACK", "reqId": 1})).unwrap();
        assert!(!ack.is_terminal());
    }

    #[test]
    fn reply_without_result_object_is_invalid() {
        assert!(NodeReply::from_payload(&json!({"op": "REPLY"})).is_err());
        assert!(NodeReply::from_payload(&json!({"op": "REPLY", "result": "x"})).is_err());
        assert!(NodeReply::from_payload(&json!({"result": {}})).is_err());
        assert!(NodeReply::from_payload(&json!({"op": "PING"})).is_err());
    }

    #[test]
    fn reads_echoed_req_id() {
        assert_eq!(
            NodeReply::echoed_req_id(&json!({"op": "REPLY", "result": {"reqId": 9}})),
            Some(9)
        );
        assert_eq!(
            NodeReply::echoed_req_id(&json!({"op": "REJECT", "reqId": 3})),
            Some(3)
        );
        assert_eq!(NodeReply::echoed_req_id(&json!({"op": "REPLY", "result": {}})), None);
    }
}
