//! Ledger client core: builds and signs requests, fans them out over a pool
//! of validator nodes, and reconciles the replies into one agreed result.
//!
//! This crate exposes:
//! - request construction (`RequestBuilder`, `build_request`) and signing (`sign`),
//! - transport abstractions (`NodeTransport`, `MockTransport`, `TcpTransport`),
//! - the pool connection (`PoolConnection`) with per-node workers and reply routing,
//! - dispatch planning (`DispatchStrategy`, `QuorumRule`),
//! - quorum reconciliation (`ReconciliationState`) and typed projection (`project`),
//! - the high-level facade (`LedgerClient`) tying them together.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod pool;
pub mod projector;
pub mod reconciler;
pub mod request_builder;
pub mod signer;
pub mod transport;
pub mod wallet;

pub use client::{
    build_attrib_request, build_get_attrib_request, build_get_nym_request,
    build_get_schema_request, build_get_txn_request, build_nym_request, build_schema_request,
    kind_of, LedgerClient, LedgerError,
};
pub use config::{ConfigError, DispatchConfig, LedgerConfig, PoolConfig, ReconcilerConfig};
pub use dispatch::{DispatchError, DispatchPlan, DispatchStrategy, QuorumRule};
pub use pool::{NodeEvent, PoolConnection, PoolError, PoolGenesis, ReplyStream};
pub use projector::{
    project, AttribInfo, GetTxnResult, LedgerTxn, NymInfo, ProjectionError, SchemaInfo,
    TypedResult, WriteReceipt,
};
pub use reconciler::{
    CanonicalResult, ReconciliationState, ReconciliationStatus, ReplyGroup, ReplyRejection,
};
pub use request_builder::{build_request, BuildError, ReqIdGenerator, RequestBuilder};
pub use signer::{sign, sign_if_required, SignerError};
pub use transport::{
    exchange_with_retry, MockTransport, NodeTransport, RequestMeta, RetryPolicy, TcpTransport,
    TransportError,
};
pub use wallet::{InMemoryWallet, KeyStore, WalletError};
