//! Typed views of an agreed reply payload.

use ledger_types::{
    Did, NodeReply, OperationKind, RejectKind, ReqId, Role, SchemaData, SeqNo,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::reconciler::CanonicalResult;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("unexpected reply shape: {0}")]
    Shape(String),
    #[error("ledger refused the request ({kind:?}): {reason}")]
    Rejected { kind: RejectKind, reason: String },
}

fn shape(reason: impl Into<String>) -> ProjectionError {
    ProjectionError::Shape(reason.into())
}

/// A committed transaction as returned by `GET_TXN`.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTxn {
    pub seq_no: SeqNo,
    pub txn_type: String,
    pub txn_time: Option<u64>,
    pub identifier: Option<String>,
    /// The transaction's `data`, decoded when the ledger stored it as a JSON string.
    pub data: Option<Value>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GetTxnResult {
    Found(LedgerTxn),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub seq_no: SeqNo,
    pub txn_time: u64,
    pub txn_type: OperationKind,
    pub identifier: Did,
    pub req_id: ReqId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NymInfo {
    pub dest: Did,
    #[serde(default)]
    pub verkey: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    /// DID that created the NYM; absent for genesis entries.
    #[serde(default, rename = "identifier")]
    pub creator: Option<Did>,
    #[serde(skip)]
    pub seq_no: SeqNo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttribInfo {
    pub dest: Did,
    pub name: String,
    pub value: Value,
    pub seq_no: SeqNo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub issuer: Did,
    pub data: SchemaData,
    pub seq_no: SeqNo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedResult {
    Txn(GetTxnResult),
    Write(WriteReceipt),
    Nym(Option<NymInfo>),
    Attrib(Option<AttribInfo>),
    Schema(Option<SchemaInfo>),
}

impl TypedResult {
    pub fn into_txn(self) -> Option<GetTxnResult> {
        match self {
            Self::Txn(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_receipt(self) -> Option<WriteReceipt> {
        match self {
            Self::Write(receipt) => Some(receipt),
            _ => None,
        }
    }
}

pub fn project(kind: OperationKind, canonical: &CanonicalResult) -> Result<TypedResult, ProjectionError> {
    let result = match NodeReply::from_payload(&canonical.payload) {
        Ok(NodeReply::Reply { result }) => result,
        Ok(NodeReply::Rejected { kind, reason }) => {
            return Err(ProjectionError::Rejected { kind, reason })
        }
        Ok(NodeReply::Ack) => return Err(shape("acknowledgement is not a result")),
        Err(err) => return Err(shape(err.to_string())),
    };
    if let Some(code) = result.get("type").and_then(Value::as_str) {
        if code != kind.type_code() {
            return Err(shape(format!("{kind} answered with txn type {code}")));
        }
    }
    match kind {
        OperationKind::GetTxn => project_txn(&result).map(TypedResult::Txn),
        OperationKind::Nym | OperationKind::Attrib | OperationKind::Schema => {
            project_receipt(kind, &result).map(TypedResult::Write)
        }
        OperationKind::GetNym => project_nym(&result).map(TypedResult::Nym),
        OperationKind::GetAttrib => project_attrib(&result).map(TypedResult::Attrib),
        OperationKind::GetSchema => project_schema(&result).map(TypedResult::Schema),
    }
}

fn project_txn(result: &Value) -> Result<GetTxnResult, ProjectionError> {
    let Some(raw) = decode_data(result)? else {
        return Ok(GetTxnResult::NotFound);
    };
    if raw.as_object().is_some_and(|txn| txn.is_empty()) {
        return Ok(GetTxnResult::NotFound);
    }
    let seq_no = require_u64(&raw, "seqNo")?;
    let txn_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| shape("transaction without type"))?
        .to_string();
    let data = match raw.get("data") {
        Some(Value::String(encoded)) => Some(
            serde_json::from_str(encoded)
                .map_err(|err| shape(format!("transaction data: {err}")))?,
        ),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.clone()),
    };
    Ok(GetTxnResult::Found(LedgerTxn {
        seq_no,
        txn_type,
        txn_time: raw.get("txnTime").and_then(Value::as_u64),
        identifier: raw.get("identifier").and_then(Value::as_str).map(str::to_string),
        data,
        raw,
    }))
}

fn project_receipt(kind: OperationKind, result: &Value) -> Result<WriteReceipt, ProjectionError> {
    let identifier = result
        .get("identifier")
        .and_then(Value::as_str)
        .ok_or_else(|| shape("write result without identifier"))?;
    Ok(WriteReceipt {
        seq_no: require_u64(result, "seqNo")?,
        txn_time: require_u64(result, "txnTime")?,
        txn_type: kind,
        identifier: Did::parse(identifier).map_err(|err| shape(err.to_string()))?,
        req_id: ReqId(require_u64(result, "reqId")?),
    })
}

fn project_nym(result: &Value) -> Result<Option<NymInfo>, ProjectionError> {
    let Some(data) = decode_data(result)? else {
        return Ok(None);
    };
    let mut info: NymInfo =
        serde_json::from_value(data).map_err(|err| shape(format!("nym data: {err}")))?;
    info.seq_no = require_u64(result, "seqNo")?;
    Ok(Some(info))
}

fn project_attrib(result: &Value) -> Result<Option<AttribInfo>, ProjectionError> {
    let Some(value) = decode_data(result)? else {
        return Ok(None);
    };
    Ok(Some(AttribInfo {
        dest: require_did(result, "dest")?,
        name: result
            .get("raw")
            .and_then(Value::as_str)
            .ok_or_else(|| shape("attribute result without raw"))?
            .to_string(),
        value,
        seq_no: require_u64(result, "seqNo")?,
    }))
}

fn project_schema(result: &Value) -> Result<Option<SchemaInfo>, ProjectionError> {
    let Some(data) = decode_data(result)? else {
        return Ok(None);
    };
    let data: SchemaData =
        serde_json::from_value(data).map_err(|err| shape(format!("schema data: {err}")))?;
    Ok(Some(SchemaInfo {
        issuer: require_did(result, "dest")?,
        data,
        seq_no: require_u64(result, "seqNo")?,
    }))
}

/// `result.data`, decoded when it is a JSON string. `None` for null or absent.
fn decode_data(result: &Value) -> Result<Option<Value>, ProjectionError> {
    match result.get("data") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(encoded)) => serde_json::from_str(encoded)
            .map(Some)
            .map_err(|err| shape(format!("result data: {err}"))),
        Some(other) => Ok(Some(other.clone())),
    }
}

fn require_u64(value: &Value, field: &str) -> Result<u64, ProjectionError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| shape(format!("missing numeric `{field}`")))
}

fn require_did(value: &Value, field: &str) -> Result<Did, ProjectionError> {
    let encoded = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| shape(format!("missing `{field}`")))?;
    Did::parse(encoded).map_err(|err| shape(err.to_string()))
}

#[cfg(test)]
mod tests {
    use ledger_crypto::{payload_digest, to_canonical_json};
    use ledger_types::{OperationKind, RejectKind, Role};
    use serde_json::{json, Value};

    use super::{project, GetTxnResult, ProjectionError, TypedResult};
    use crate::reconciler::CanonicalResult;

    const DID: &str = "Th7MpTaRZVRYnPiabds81Y";

    fn canonical(payload: Value) -> CanonicalResult {
        CanonicalResult {
            digest: payload_digest(&payload),
            payload,
            agreeing_nodes: Vec::new(),
            accepted_replies: 3,
        }
    }

    #[test]
    fn get_txn_decodes_nested_schema_data() {
        let txn = json!({
            "type": "101",
            "data": to_canonical_json(&json!({"name": "gvt2", "version": "3.0", "keys": ["name", "male"]})),
            "identifier": DID,
            "reqId": 1,
            "seqNo": 5,
            "txnTime": 1_700_000_005u64,
        });
        let payload = json!({"op": "REPLY", "result": {"type": "3", "seqNo": 5, "data": to_canonical_json(&txn)}});
        let TypedResult::Txn(GetTxnResult::Found(found)) =
            project(OperationKind::GetTxn, &canonical(payload)).unwrap()
        else {
            panic!("expected a transaction");
        };
        assert_eq!(found.seq_no, 5);
        assert_eq!(found.txn_type, "101");
        assert_eq!(
            found.data,
            Some(json!({"name": "gvt2", "version": "3.0", "keys": ["name", "male"]}))
        );
    }

    #[test]
    fn empty_or_null_txn_data_is_not_found() {
        for data in [json!("{}"), Value::Null] {
            let payload = json!({"op": "REPLY", "result": {"type": "3", "seqNo": 6, "data": data}});
            assert_eq!(
                project(OperationKind::GetTxn, &canonical(payload)).unwrap(),
                TypedResult::Txn(GetTxnResult::NotFound)
            );
        }
    }

    #[test]
    fn write_reply_projects_to_receipt() {
        let payload = json!({"op": "REPLY", "result": {
            "type": "101", "data": "{}", "identifier": DID, "reqId": 42, "seqNo": 5, "txnTime": 1_700_000_005u64,
        }});
        let receipt = project(OperationKind::Schema, &canonical(payload))
            .unwrap()
            .into_receipt()
            .unwrap();
        assert_eq!(receipt.seq_no, 5);
        assert_eq!(receipt.txn_time, 1_700_000_005);
        assert_eq!(receipt.req_id.0, 42);
        assert_eq!(receipt.identifier.as_str(), DID);
    }

    #[test]
    fn agreed_refusal_surfaces_reason() {
        let payload = json!({"op": "REJECT", "reqId": 1, "identifier": DID, "reason": "not authorized"});
        assert_eq!(
            project(OperationKind::Schema, &canonical(payload)),
            Err(ProjectionError::Rejected {
                kind: RejectKind::Reject,
                reason: "not authorized".to_string()
            })
        );
    }

    #[test]
    fn nym_attrib_and_schema_records() {
        let nym = json!({"op": "REPLY", "result": {
            "type": "105", "dest": DID, "seqNo": 1,
            "data": to_canonical_json(&json!({"dest": DID, "identifier": null, "role": "0", "verkey": "abc"})),
        }});
        let TypedResult::Nym(Some(info)) = project(OperationKind::GetNym, &canonical(nym)).unwrap() else {
            panic!("expected nym");
        };
        assert_eq!(info.role, Some(Role::Trustee));
        assert_eq!(info.creator, None);
        assert_eq!(info.seq_no, 1);

        let attrib = json!({"op": "REPLY", "result": {
            "type": "104", "dest": DID, "raw": "endpoint", "seqNo": 3,
            "data": "{\"endpoint\":{\"ha\":\"127.0.0.1:5555\"}}",
        }});
        let TypedResult::Attrib(Some(info)) = project(OperationKind::GetAttrib, &canonical(attrib)).unwrap() else {
            panic!("expected attrib");
        };
        assert_eq!(info.value["endpoint"]["ha"], "127.0.0.1:5555");

        let schema = json!({"op": "REPLY", "result": {
            "type": "107", "dest": DID, "seqNo": 2,
            "data": {"name": "gvt", "version": "1.0", "keys": ["age"]},
        }});
        let TypedResult::Schema(Some(info)) = project(OperationKind::GetSchema, &canonical(schema)).unwrap() else {
            panic!("expected schema");
        };
        assert_eq!(info.data.name, "gvt");

        let missing = json!({"op": "REPLY", "result": {"type": "107", "dest": DID, "data": null}});
        assert_eq!(
            project(OperationKind::GetSchema, &canonical(missing)).unwrap(),
            TypedResult::Schema(None)
        );
    }

    #[test]
    fn malformed_results_are_shape_errors() {
        let cases = [
            (OperationKind::GetTxn, json!({"op": "REPLY", "result": {"type": "3", "data": "not json"}})),
            (OperationKind::GetTxn, json!({"op": "REPLY", "result": {"type": "105", "data": "{}"}})),
            (OperationKind::Schema, json!({"op": "REPLY", "result": {"type": "101"}})),
            (OperationKind::GetTxn, json!({"op": "REQACK", "reqId": 1})),
            (OperationKind::GetTxn, json!({"result": {}})),
        ];
        for (kind, payload) in cases {
            assert!(
                matches!(project(kind, &canonical(payload.clone())), Err(ProjectionError::Shape(_))),
                "{payload}"
            );
        }
    }
}
