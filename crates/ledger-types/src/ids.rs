use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Raw DID bytes are either the first half of a verkey or a full verkey.
pub const DID_SHORT_LEN: usize = 16;
pub const DID_LONG_LEN: usize = 32;

fn encode_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

macro_rules! impl_fixed_bytes_id {
    ($name:ident, $len:expr, $encode:path) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
                if bytes.len() != Self::LEN {
                    return Err(ValidationError::InvalidLength {
                        kind: stringify!($name),
                        expected: Self::LEN,
                        actual: bytes.len(),
                    });
                }
                let mut out = [0u8; Self::LEN];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&$encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(value: [u8; $len]) -> Self {
                Self::new(value)
            }
        }
    };
}

impl_fixed_bytes_id!(Verkey, 32, encode_base58);
impl_fixed_bytes_id!(PayloadDigest, 32, encode_hex);

impl Verkey {
    pub fn from_base58(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|err| ValidationError::InvalidBase58(err.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Resolves a verkey as written on the ledger. The abbreviated `~` form
    /// carries only the second half; the first half is the DID itself.
    pub fn resolve(did: &Did, encoded: &str) -> Result<Self, ValidationError> {
        match encoded.strip_prefix('~') {
            Some(tail) => {
                let tail = bs58::decode(tail)
                    .into_vec()
                    .map_err(|err| ValidationError::InvalidBase58(err.to_string()))?;
                let head = did.raw_bytes();
                if head.len() != DID_SHORT_LEN || tail.len() != DID_SHORT_LEN {
                    return Err(ValidationError::InvalidField("verkey"));
                }
                let mut out = [0u8; 32];
                out[..DID_SHORT_LEN].copy_from_slice(&head);
                out[DID_SHORT_LEN..].copy_from_slice(&tail);
                Ok(Self(out))
            }
            None => Self::from_base58(encoded),
        }
    }
}

impl Serialize for Verkey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Verkey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base58(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Ledger identity of a submitter or a target record, in base58 form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn parse(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|err| ValidationError::InvalidBase58(err.to_string()))?;
        if bytes.len() != DID_SHORT_LEN && bytes.len() != DID_LONG_LEN {
            return Err(ValidationError::InvalidLength {
                kind: "Did",
                expected: DID_SHORT_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self(encoded.to_string()))
    }

    /// DID derived from a verkey: base58 of its first sixteen bytes.
    pub fn from_verkey(verkey: &Verkey) -> Self {
        Self(encode_base58(&verkey.as_bytes()[..DID_SHORT_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn raw_bytes(&self) -> Vec<u8> {
        // Validated at construction.
        bs58::decode(&self.0).into_vec().unwrap_or_default()
    }
}

impl TryFrom<String> for Did {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Did> for String {
    fn from(value: Did) -> Self {
        value.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

/// Client-assigned request identifier, unique per submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReqId(pub u64);

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a committed transaction in the domain ledger, starting at 1.
pub type SeqNo = u64;

/// Alias a validator node is known by in the pool.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({})", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A validator as the client knows it: immutable for the life of a pool connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: NodeName,
    pub address: String,
    pub verkey: Verkey,
}
