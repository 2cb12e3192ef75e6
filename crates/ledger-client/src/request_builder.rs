//! RequestBuilder: well-formed, canonical ledger requests from typed or JSON
//! parameters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ledger_crypto::to_canonical_json;
use ledger_types::{
    Did, Operation, OperationKind, ReqId, Request, Role, SchemaData, SchemaKey, SeqNo,
    ValidationError, Verkey,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed parameter `{field}`: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

fn malformed(field: &'static str, reason: impl Into<String>) -> BuildError {
    BuildError::Malformed {
        field,
        reason: reason.into(),
    }
}

/// Issues strictly increasing request ids seeded from wall-clock microseconds.
/// Ids never repeat within the process, even if the clock steps backwards.
#[derive(Debug)]
pub struct ReqIdGenerator {
    last: AtomicU64,
}

static PROCESS_REQ_IDS: ReqIdGenerator = ReqIdGenerator::new();

impl ReqIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// The generator shared by every builder in this process.
    pub fn process() -> &'static Self {
        &PROCESS_REQ_IDS
    }

    pub fn next_id(&self) -> ReqId {
        let now = unix_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        ReqId(now.max(previous.saturating_add(1)))
    }
}

impl Default for ReqIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

/// Fluent request construction for one submitter.
///
/// Without an explicit id, each request takes the next process-wide `reqId`.
/// Builders never sign; write privilege is for the nodes to judge.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    submitter: Did,
    req_id: Option<ReqId>,
}

impl RequestBuilder {
    pub fn new(submitter: Did) -> Self {
        Self {
            submitter,
            req_id: None,
        }
    }

    /// Pins the request id, for deterministic rebuilds.
    pub fn with_req_id(mut self, req_id: ReqId) -> Self {
        self.req_id = Some(req_id);
        self
    }

    pub fn get_txn(self, seq_no: SeqNo) -> Request {
        self.finish(Operation::GetTxn { data: seq_no })
    }

    pub fn get_nym(self, dest: Did) -> Request {
        self.finish(Operation::GetNym { dest })
    }

    pub fn get_attrib(self, dest: Did, name: &str) -> Result<Request, BuildError> {
        if name.is_empty() {
            return Err(malformed("raw", "attribute name must not be empty"));
        }
        Ok(self.finish(Operation::GetAttrib {
            dest,
            raw: name.to_string(),
        }))
    }

    pub fn get_schema(self, dest: Did, name: &str, version: &str) -> Result<Request, BuildError> {
        if name.is_empty() || version.is_empty() {
            return Err(malformed("data", "schema name and version must not be empty"));
        }
        Ok(self.finish(Operation::GetSchema {
            dest,
            data: SchemaKey {
                name: name.to_string(),
                version: version.to_string(),
            },
        }))
    }

    pub fn schema(self, schema: &SchemaData) -> Result<Request, BuildError> {
        schema.validate()?;
        let data = to_canonical_json(&serde_json::to_value(schema).map_err(ValidationError::from)?);
        Ok(self.finish(Operation::Schema { data }))
    }

    pub fn nym(
        self,
        dest: Did,
        verkey: Option<&str>,
        alias: Option<&str>,
        role: Option<Role>,
    ) -> Result<Request, BuildError> {
        if let Some(verkey) = verkey {
            Verkey::resolve(&dest, verkey).map_err(|err| malformed("verkey", err.to_string()))?;
        }
        Ok(self.finish(Operation::Nym {
            dest,
            verkey: verkey.map(str::to_string),
            alias: alias.map(str::to_string),
            role,
        }))
    }

    /// `raw` must be a JSON object of attribute name to value.
    pub fn attrib(self, dest: Did, raw: &Value) -> Result<Request, BuildError> {
        let raw = match raw {
            Value::Object(map) if !map.is_empty() => to_canonical_json(raw),
            _ => return Err(malformed("raw", "expected a non-empty JSON object")),
        };
        Ok(self.finish(Operation::Attrib { dest, raw }))
    }

    /// Parameter-driven construction: `params` holds the operation fields by
    /// their wire names.
    pub fn build(self, kind: OperationKind, params: &Value) -> Result<Request, BuildError> {
        let params = params
            .as_object()
            .ok_or_else(|| malformed("params", "expected a JSON object"))?;
        match kind {
            OperationKind::GetTxn => {
                let seq_no = required(params, "data")?
                    .as_u64()
                    .ok_or_else(|| malformed("data", "expected a non-negative integer"))?;
                Ok(self.get_txn(seq_no))
            }
            OperationKind::GetNym => {
                let dest = required_did(params, "dest")?;
                Ok(self.get_nym(dest))
            }
            OperationKind::GetAttrib => {
                let dest = required_did(params, "dest")?;
                let raw = required_str(params, "raw")?;
                self.get_attrib(dest, raw)
            }
            OperationKind::GetSchema => {
                let dest = required_did(params, "dest")?;
                let key: SchemaKey = serde_json::from_value(required(params, "data")?.clone())
                    .map_err(|err| malformed("data", err.to_string()))?;
                self.get_schema(dest, &key.name, &key.version)
            }
            OperationKind::Schema => {
                let data = match required(params, "data")? {
                    Value::String(encoded) => serde_json::from_str::<Value>(encoded)
                        .map_err(|err| malformed("data", err.to_string()))?,
                    other => other.clone(),
                };
                let schema: SchemaData = serde_json::from_value(data)
                    .map_err(|err| malformed("data", err.to_string()))?;
                self.schema(&schema)
            }
            OperationKind::Nym => {
                let dest = required_did(params, "dest")?;
                let verkey = optional_str(params, "verkey")?;
                let alias = optional_str(params, "alias")?;
                let role = optional_str(params, "role")?
                    .map(Role::parse)
                    .transpose()
                    .map_err(|_| malformed("role", "expected TRUSTEE, STEWARD or TRUST_ANCHOR"))?;
                self.nym(dest, verkey, alias, role)
            }
            OperationKind::Attrib => {
                let dest = required_did(params, "dest")?;
                let raw = match required(params, "raw")? {
                    Value::String(encoded) => serde_json::from_str::<Value>(encoded)
                        .map_err(|err| malformed("raw", err.to_string()))?,
                    other => other.clone(),
                };
                self.attrib(dest, &raw)
            }
        }
    }

    fn finish(self, operation: Operation) -> Request {
        Request {
            req_id: self
                .req_id
                .unwrap_or_else(|| ReqIdGenerator::process().next_id()),
            identifier: self.submitter,
            operation,
            signature: None,
        }
    }
}

/// Builds an unsigned request of `kind` for `submitter` from JSON parameters.
pub fn build_request(kind: OperationKind, submitter: &Did, params: &Value) -> Result<Request, BuildError> {
    RequestBuilder::new(submitter.clone()).build(kind, params)
}

fn required<'a>(params: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, BuildError> {
    match params.get(field) {
        None | Some(Value::Null) => Err(BuildError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn required_str<'a>(params: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, BuildError> {
    required(params, field)?
        .as_str()
        .ok_or_else(|| malformed(field, "expected a string"))
}

fn optional_str<'a>(
    params: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, BuildError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(malformed(field, "expected a string")),
    }
}

fn required_did(params: &Map<String, Value>, field: &'static str) -> Result<Did, BuildError> {
    Did::parse(required_str(params, field)?).map_err(|err| malformed(field, err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ledger_crypto::canonical_request_bytes;
    use ledger_types::{Did, Operation, OperationKind, ReqId, Role};
    use serde_json::json;

    use super::{build_request, BuildError, ReqIdGenerator, RequestBuilder};

    fn submitter() -> Did {
        Did::parse("Th7MpTaRZVRYnPiabds81Y").unwrap()
    }

    #[test]
    fn get_txn_build_is_deterministic_for_pinned_id() {
        let first = RequestBuilder::new(submitter())
            .with_req_id(ReqId(1_491_566_332_010_860))
            .get_txn(1);
        let second = RequestBuilder::new(submitter())
            .with_req_id(ReqId(1_491_566_332_010_860))
            .build(OperationKind::GetTxn, &json!({"data": 1}))
            .unwrap();
        assert_eq!(
            canonical_request_bytes(&first).unwrap(),
            canonical_request_bytes(&second).unwrap()
        );
        assert!(!first.is_signed());
        let wire = String::from_utf8(canonical_request_bytes(&first).unwrap()).unwrap();
        assert!(wire.contains(r#""identifier":"Th7MpTaRZVRYnPiabds81Y","operation":{"data":1,"type":"3"}"#));
    }

    #[test]
    fn get_txn_rejects_negative_fractional_and_missing_seq_no() {
        for params in [json!({"data": -1}), json!({"data": 1.5}), json!({"data": "1"})] {
            let err = build_request(OperationKind::GetTxn, &submitter(), &params).unwrap_err();
            assert!(matches!(err, BuildError::Malformed { field: "data", .. }), "{params}");
        }
        let err = build_request(OperationKind::GetTxn, &submitter(), &json!({})).unwrap_err();
        assert_eq!(err, BuildError::MissingField("data"));
        assert!(build_request(OperationKind::GetTxn, &submitter(), &json!([1])).is_err());
    }

    #[test]
    fn schema_data_is_canonicalized() {
        let spaced = build_request(
            OperationKind::Schema,
            &submitter(),
            &json!({"data": "{\"name\":\"gvt2\",\"version\":\"3.0\",\"keys\": [\"name\", \"male\"]}"}),
        )
        .unwrap();
        let object = RequestBuilder::new(submitter())
            .with_req_id(spaced.req_id)
            .build(
                OperationKind::Schema,
                &json!({"data": {"version": "3.0", "keys": ["name", "male"], "name": "gvt2"}}),
            )
            .unwrap();
        assert_eq!(spaced, object);
        match &spaced.operation {
            Operation::Schema { data } => {
                assert_eq!(data, r#"{"keys":["name","male"],"name":"gvt2","version":"3.0"}"#)
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn schema_shape_errors_are_malformed() {
        for data in [
            json!({"name": "gvt", "version": "1.0", "keys": []}),
            json!({"name": "gvt", "keys": ["a"]}),
            json!({"name": 1, "version": "1.0", "keys": ["a"]}),
            json!("not json"),
            json!([1, 2]),
        ] {
            let err = build_request(OperationKind::Schema, &submitter(), &json!({"data": data}));
            assert!(err.is_err(), "{data}");
        }
    }

    #[test]
    fn nym_parses_role_and_validates_dest_and_verkey() {
        let request = build_request(
            OperationKind::Nym,
            &submitter(),
            &json!({"dest": "Th7MpTaRZVRYnPiabds81Y", "role": "TRUST_ANCHOR", "alias": "acme"}),
        )
        .unwrap();
        assert!(matches!(
            request.operation,
            Operation::Nym { role: Some(Role::TrustAnchor), .. }
        ));
        assert!(build_request(
            OperationKind::Nym,
            &submitter(),
            &json!({"dest": "Th7MpTaRZVRYnPiabds81Y", "role": "ADMIN"})
        )
        .is_err());
        assert!(build_request(OperationKind::Nym, &submitter(), &json!({"dest": "0OIl"})).is_err());
        assert!(build_request(
            OperationKind::Nym,
            &submitter(),
            &json!({"dest": "Th7MpTaRZVRYnPiabds81Y", "verkey": "~abc"})
        )
        .is_err());
    }

    #[test]
    fn attrib_requires_json_object() {
        let ok = build_request(
            OperationKind::Attrib,
            &submitter(),
            &json!({"dest": "Th7MpTaRZVRYnPiabds81Y", "raw": {"endpoint": {"ha": "127.0.0.1:5555"}}}),
        )
        .unwrap();
        assert!(matches!(ok.operation, Operation::Attrib { .. }));
        for raw in [json!("[]"), json!({}), json!(5)] {
            let params = json!({"dest": "Th7MpTaRZVRYnPiabds81Y", "raw": raw});
            assert!(build_request(OperationKind::Attrib, &submitter(), &params).is_err());
        }
    }

    #[test]
    fn read_builders_cover_every_lookup() {
        let dest = submitter();
        let schema = build_request(
            OperationKind::GetSchema,
            &dest,
            &json!({"dest": dest.as_str(), "data": {"name": "gvt", "version": "1.0"}}),
        )
        .unwrap();
        assert_eq!(schema.kind(), OperationKind::GetSchema);
        let nym = build_request(OperationKind::GetNym, &dest, &json!({"dest": dest.as_str()})).unwrap();
        assert_eq!(nym.kind(), OperationKind::GetNym);
        let attr = build_request(
            OperationKind::GetAttrib,
            &dest,
            &json!({"dest": dest.as_str(), "raw": "endpoint"}),
        )
        .unwrap();
        assert_eq!(attr.kind(), OperationKind::GetAttrib);
        assert!(RequestBuilder::new(dest.clone()).get_attrib(dest, "").is_err());
    }

    #[test]
    fn req_ids_strictly_increase_and_never_repeat() {
        let generator = ReqIdGenerator::new();
        let ids: Vec<_> = (0..1_000).map(|_| generator.next_id()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let a = RequestBuilder::new(submitter()).get_txn(1);
        let b = RequestBuilder::new(submitter()).get_txn(1);
        assert!(b.req_id > a.req_id);
    }
}
