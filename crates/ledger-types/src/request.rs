//! Ledger request wire types.
//!
//! A request serializes as
//! `{"reqId":<u64>,"identifier":<did>,"operation":{"type":<code>,..},"signature":<b58>?}`.
//! The operation `type` is the ledger's string transaction code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::ValidationError,
    ids::{Did, ReqId, SeqNo},
};

pub const NYM: &str = "1";
pub const GET_TXN: &str = "3";
pub const ATTRIB: &str = "100";
pub const SCHEMA: &str = "101";
pub const GET_ATTR: &str = "104";
pub const GET_NYM: &str = "105";
pub const GET_SCHEMA: &str = "107";

/// Whether a request mutates the ledger. Writes are signed and go to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestClass {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Nym,
    GetTxn,
    Attrib,
    Schema,
    GetAttrib,
    GetNym,
    GetSchema,
}

impl OperationKind {
    pub const fn type_code(self) -> &'static str {
        match self {
            Self::Nym => NYM,
            Self::GetTxn => GET_TXN,
            Self::Attrib => ATTRIB,
            Self::Schema => SCHEMA,
            Self::GetAttrib => GET_ATTR,
            Self::GetNym => GET_NYM,
            Self::GetSchema => GET_SCHEMA,
        }
    }

    pub fn from_type_code(code: &str) -> Option<Self> {
        match code {
            NYM => Some(Self::Nym),
            GET_TXN => Some(Self::GetTxn),
            ATTRIB => Some(Self::Attrib),
            SCHEMA => Some(Self::Schema),
            GET_ATTR => Some(Self::GetAttrib),
            GET_NYM => Some(Self::GetNym),
            GET_SCHEMA => Some(Self::GetSchema),
            _ => None,
        }
    }

    pub const fn class(self) -> RequestClass {
        match self {
            Self::Nym | Self::Attrib | Self::Schema => RequestClass::Write,
            Self::GetTxn | Self::GetAttrib | Self::GetNym | Self::GetSchema => RequestClass::Read,
        }
    }

    pub const fn is_read(self) -> bool {
        matches!(self.class(), RequestClass::Read)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nym => "NYM",
            Self::GetTxn => "GET_TXN",
            Self::Attrib => "ATTRIB",
            Self::Schema => "SCHEMA",
            Self::GetAttrib => "GET_ATTR",
            Self::GetNym => "GET_NYM",
            Self::GetSchema => "GET_SCHEMA",
        };
        f.write_str(name)
    }
}

/// Ledger roles, serialized with the ledger's numeric role codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "0")]
    Trustee,
    #[serde(rename = "2")]
    Steward,
    #[serde(rename = "101")]
    TrustAnchor,
}

impl Role {
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        match name {
            "TRUSTEE" => Ok(Self::Trustee),
            "STEWARD" => Ok(Self::Steward),
            "TRUST_ANCHOR" => Ok(Self::TrustAnchor),
            _ => Err(ValidationError::InvalidField("role")),
        }
    }
}

/// Schema body as registered on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaData {
    pub name: String,
    pub version: String,
    pub keys: Vec<String>,
}

impl SchemaData {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::InvalidField("name"));
        }
        if self.version.is_empty() {
            return Err(ValidationError::InvalidField("version"));
        }
        if self.keys.is_empty() || self.keys.iter().any(String::is_empty) {
            return Err(ValidationError::InvalidField("keys"));
        }
        Ok(())
    }
}

/// Lookup key of a schema: the issuer DID travels as `dest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaKey {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "1")]
    Nym {
        dest: Did,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verkey: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    #[serde(rename = "3")]
    GetTxn { data: SeqNo },
    #[serde(rename = "100")]
    Attrib { dest: Did, raw: String },
    /// `data` is the schema JSON, re-encoded canonically by the builder.
    #[serde(rename = "101")]
    Schema { data: String },
    #[serde(rename = "104")]
    GetAttrib { dest: Did, raw: String },
    #[serde(rename = "105")]
    GetNym { dest: Did },
    #[serde(rename = "107")]
    GetSchema { dest: Did, data: SchemaKey },
}

impl Operation {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Nym { .. } => OperationKind::Nym,
            Self::GetTxn { .. } => OperationKind::GetTxn,
            Self::Attrib { .. } => OperationKind::Attrib,
            Self::Schema { .. } => OperationKind::Schema,
            Self::GetAttrib { .. } => OperationKind::GetAttrib,
            Self::GetNym { .. } => OperationKind::GetNym,
            Self::GetSchema { .. } => OperationKind::GetSchema,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub req_id: ReqId,
    pub identifier: Did,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Request {
    pub const fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub const fn class(&self) -> RequestClass {
        self.operation.kind().class()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ValidationError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Operation, OperationKind, Request, RequestClass, Role};
    use crate::{Did, ReqId};

    #[test]
    fn get_txn_serializes_with_type_code() {
        let request = Request {
            req_id: ReqId(42),
            identifier: Did::parse("Th7MpTaRZVRYnPiabds81Y").unwrap(),
            operation: Operation::GetTxn { data: 1 },
            signature: None,
        };
        let value = request.to_value().unwrap();
        assert_eq!(
            value,
            json!({
                "reqId": 42,
                "identifier": "Th7MpTaRZVRYnPiabds81Y",
                "operation": {"type": "3", "data": 1}
            })
        );
    }

    #[test]
    fn nym_role_uses_numeric_code_and_roundtrips() {
        let dest = Did::parse("Th7MpTaRZVRYnPiabds81Y").unwrap();
        let op = Operation::Nym {
            dest,
            verkey: None,
            alias: None,
            role: Some(Role::TrustAnchor),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "1");
        assert_eq!(value["role"], "101");
        assert!(value.get("verkey").is_none());
        let back: Operation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn classifies_reads_and_writes() {
        assert_eq!(OperationKind::GetTxn.class(), RequestClass::Read);
        assert_eq!(OperationKind::Schema.class(), RequestClass::Write);
        assert_eq!(OperationKind::from_type_code("107"), Some(OperationKind::GetSchema));
        assert_eq!(OperationKind::from_type_code("999"), None);
    }

    #[test]
    fn rejects_unknown_role_name() {
        assert!(Role::parse("ENDORSER").is_err());
        assert_eq!(Role::parse("STEWARD").unwrap(), Role::Steward);
    }
}
