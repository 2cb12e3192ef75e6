//! DomainLedger: in-memory transaction log with NYM/ATTRIB/SCHEMA state and
//! the ledger's write-privilege rules.

use std::collections::HashMap;

use ledger_crypto::{to_canonical_json, verify_request};
use ledger_types::{
    Did, Operation, RejectKind, Request, Role, SchemaData, SchemaKey, SeqNo, Verkey,
};
use serde_json::{json, Map, Value};

/// A refusal produced while applying a request, mapped onto REQNACK or REJECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub kind: RejectKind,
    pub reason: String,
}

fn nack(reason: impl Into<String>) -> Refusal {
    Refusal {
        kind: RejectKind::ReqNack,
        reason: reason.into(),
    }
}

fn refuse(reason: impl Into<String>) -> Refusal {
    Refusal {
        kind: RejectKind::Reject,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NymRecord {
    pub verkey: Option<Verkey>,
    pub role: Option<Role>,
    pub creator: Option<Did>,
    pub seq_no: SeqNo,
}

#[derive(Debug, Clone)]
struct AttribRecord {
    value: Value,
    seq_no: SeqNo,
}

#[derive(Debug, Clone)]
struct SchemaRecord {
    data: SchemaData,
    seq_no: SeqNo,
}

#[derive(Debug, Clone)]
pub struct DomainLedger {
    txns: Vec<Value>,
    nyms: HashMap<Did, NymRecord>,
    attribs: HashMap<(Did, String), AttribRecord>,
    schemas: HashMap<(Did, String, String), SchemaRecord>,
    time_base: u64,
}

impl DomainLedger {
    /// Empty ledger. `txnTime` of a committed transaction is `time_base + seqNo`,
    /// so ledgers fed the same writes stay byte-identical.
    pub fn new(time_base: u64) -> Self {
        Self {
            txns: Vec::new(),
            nyms: HashMap::new(),
            attribs: HashMap::new(),
            schemas: HashMap::new(),
            time_base,
        }
    }

    /// Ledger whose first transaction registers `did` as a trustee.
    pub fn with_trustee(time_base: u64, did: Did, verkey: Verkey) -> Self {
        let mut ledger = Self::new(time_base);
        let seq_no = ledger.append(json!({
            "type": ledger_types::request::NYM,
            "dest": did,
            "verkey": verkey.to_string(),
            "role": Role::Trustee,
        }));
        ledger.nyms.insert(
            did,
            NymRecord {
                verkey: Some(verkey),
                role: Some(Role::Trustee),
                creator: None,
                seq_no,
            },
        );
        ledger
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn txn(&self, seq_no: SeqNo) -> Option<&Value> {
        let index = usize::try_from(seq_no).ok()?.checked_sub(1)?;
        self.txns.get(index)
    }

    pub fn nym(&self, did: &Did) -> Option<&NymRecord> {
        self.nyms.get(did)
    }

    /// Checks and applies a write, returning the REPLY `result` (the committed txn).
    pub fn apply_write(&mut self, request: &Request) -> Result<Value, Refusal> {
        let submitter = self.authenticate(request)?;
        match &request.operation {
            Operation::Nym {
                dest,
                verkey,
                role,
                ..
            } => {
                let verkey = verkey
                    .as_deref()
                    .map(|encoded| Verkey::resolve(dest, encoded))
                    .transpose()
                    .map_err(|err| nack(format!("invalid verkey: {err}")))?;
                self.check_nym_privilege(&request.identifier, &submitter, dest, *role)?;
                let seq_no = self.commit(request);
                let existing = self.nyms.get(dest).cloned();
                let record = NymRecord {
                    verkey: verkey.or_else(|| existing.as_ref().and_then(|r| r.verkey)),
                    role: role.or_else(|| existing.as_ref().and_then(|r| r.role)),
                    creator: existing
                        .and_then(|r| r.creator)
                        .or_else(|| Some(request.identifier.clone())),
                    seq_no,
                };
                self.nyms.insert(dest.clone(), record);
                Ok(self.committed(seq_no))
            }
            Operation::Attrib { dest, raw } => {
                let parsed: Map<String, Value> = serde_json::from_str(raw)
                    .map_err(|_| nack("attribute raw must be a JSON object"))?;
                if parsed.is_empty() {
                    return Err(nack("attribute raw must not be empty"));
                }
                let owner = self
                    .nyms
                    .get(dest)
                    .ok_or_else(|| refuse(format!("dest {dest} is not on the ledger")))?;
                let is_owner = request.identifier == *dest
                    || owner.creator.as_ref() == Some(&request.identifier);
                if !is_owner {
                    return Err(refuse(format!(
                        "{} is not the owner of {dest}",
                        request.identifier
                    )));
                }
                let seq_no = self.commit(request);
                for (name, value) in parsed {
                    let mut single = Map::new();
                    single.insert(name.clone(), value);
                    self.attribs.insert(
                        (dest.clone(), name),
                        AttribRecord {
                            value: Value::Object(single),
                            seq_no,
                        },
                    );
                }
                Ok(self.committed(seq_no))
            }
            Operation::Schema { data } => {
                let schema: SchemaData = serde_json::from_str(data)
                    .map_err(|err| nack(format!("invalid schema data: {err}")))?;
                schema
                    .validate()
                    .map_err(|err| nack(format!("invalid schema data: {err}")))?;
                if submitter.role.is_none() {
                    return Err(refuse(format!(
                        "{} is neither Trustee, Steward nor Trust Anchor",
                        request.identifier
                    )));
                }
                let key = (
                    request.identifier.clone(),
                    schema.name.clone(),
                    schema.version.clone(),
                );
                if self.schemas.contains_key(&key) {
                    return Err(refuse(format!(
                        "schema {}:{} already exists for {}",
                        schema.name, schema.version, request.identifier
                    )));
                }
                let seq_no = self.commit(request);
                self.schemas.insert(key, SchemaRecord { data: schema, seq_no });
                Ok(self.committed(seq_no))
            }
            _ => Err(nack(format!("{} is not a write operation", request.kind()))),
        }
    }

    /// Answers a read with the REPLY `result` object.
    pub fn answer_read(&self, request: &Request) -> Result<Value, Refusal> {
        let mut result = json!({
            "identifier": request.identifier,
            "reqId": request.req_id,
            "type": request.kind().type_code(),
        });
        match &request.operation {
            Operation::GetTxn { data } => {
                let txn = self
                    .txn(*data)
                    .map(to_canonical_json)
                    .unwrap_or_else(|| "{}".to_string());
                result["data"] = json!(txn);
                result["seqNo"] = json!(data);
            }
            Operation::GetNym { dest } => {
                result["dest"] = json!(dest);
                match self.nyms.get(dest) {
                    Some(record) => {
                        let data = json!({
                            "dest": dest,
                            "identifier": record.creator,
                            "role": record.role,
                            "verkey": record.verkey.map(|v| v.to_string()),
                        });
                        result["data"] = json!(to_canonical_json(&data));
                        result["seqNo"] = json!(record.seq_no);
                    }
                    None => result["data"] = Value::Null,
                }
            }
            Operation::GetAttrib { dest, raw } => {
                result["dest"] = json!(dest);
                result["raw"] = json!(raw);
                match self.attribs.get(&(dest.clone(), raw.clone())) {
                    Some(record) => {
                        result["data"] = json!(to_canonical_json(&record.value));
                        result["seqNo"] = json!(record.seq_no);
                    }
                    None => result["data"] = Value::Null,
                }
            }
            Operation::GetSchema {
                dest,
                data: SchemaKey { name, version },
            } => {
                result["dest"] = json!(dest);
                let key = (dest.clone(), name.clone(), version.clone());
                match self.schemas.get(&key) {
                    Some(record) => {
                        result["data"] = json!(record.data);
                        result["seqNo"] = json!(record.seq_no);
                    }
                    None => {
                        result["data"] = Value::Null;
                    }
                }
            }
            _ => return Err(nack(format!("{} is not a read operation", request.kind()))),
        }
        Ok(result)
    }

    /// Static checks every write passes before privilege rules: a signature
    /// by the verkey of a DID already on the ledger.
    fn authenticate(&self, request: &Request) -> Result<NymRecord, Refusal> {
        if request.signature.is_none() {
            return Err(nack("missing signature"));
        }
        let record = self
            .nyms
            .get(&request.identifier)
            .ok_or_else(|| nack(format!("unknown identifier {}", request.identifier)))?;
        let verkey = record
            .verkey
            .as_ref()
            .ok_or_else(|| nack(format!("{} has no verkey", request.identifier)))?;
        verify_request(request, verkey).map_err(|_| nack("insufficient signature"))?;
        Ok(record.clone())
    }

    fn check_nym_privilege(
        &self,
        identifier: &Did,
        submitter: &NymRecord,
        dest: &Did,
        role: Option<Role>,
    ) -> Result<(), Refusal> {
        let is_trustee = submitter.role == Some(Role::Trustee);
        if let Some(existing) = self.nyms.get(dest) {
            let is_owner = identifier == dest || existing.creator.as_ref() == Some(identifier);
            if role.is_some() && role != existing.role && !is_trustee {
                return Err(refuse(format!("{identifier} cannot change the role of {dest}")));
            }
            if !is_owner && !is_trustee {
                return Err(refuse(format!("{identifier} is not the owner of {dest}")));
            }
            return Ok(());
        }
        let allowed = match role {
            Some(Role::Trustee) | Some(Role::Steward) => is_trustee,
            Some(Role::TrustAnchor) => {
                matches!(submitter.role, Some(Role::Trustee) | Some(Role::Steward))
            }
            None => submitter.role.is_some(),
        };
        if allowed {
            Ok(())
        } else {
            Err(refuse(format!(
                "{identifier} is not allowed to create a NYM with role {role:?}"
            )))
        }
    }

    fn commit(&mut self, request: &Request) -> SeqNo {
        let mut txn = match serde_json::to_value(&request.operation) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        txn.insert("identifier".to_string(), json!(request.identifier));
        txn.insert("reqId".to_string(), json!(request.req_id));
        if let Some(signature) = &request.signature {
            txn.insert("signature".to_string(), json!(signature));
        }
        self.append(Value::Object(txn))
    }

    fn append(&mut self, mut txn: Value) -> SeqNo {
        let seq_no = self.txns.len() as SeqNo + 1;
        txn["seqNo"] = json!(seq_no);
        txn["txnTime"] = json!(self.time_base + seq_no);
        self.txns.push(txn);
        seq_no
    }

    fn committed(&self, seq_no: SeqNo) -> Value {
        self.txn(seq_no).cloned().unwrap_or(Value::Null)
    }
}
