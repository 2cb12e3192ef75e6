//! LedgerClient: high-level facade that plans, dispatches, reconciles, and
//! projects one request at a time against an open pool.

use std::sync::Arc;

use ledger_crypto::{canonical_request_bytes, Ed25519ReplyVerifier};
use ledger_types::{
    Did, NodeName, OperationKind, RejectKind, ReqId, Request, ReplyVerifier, Role, SchemaData,
    SeqNo,
};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, LedgerConfig, ReconcilerConfig},
    dispatch::{DispatchError, DispatchStrategy},
    pool::{PoolConnection, PoolError},
    projector::{project, ProjectionError, TypedResult},
    reconciler::{CanonicalResult, ReconciliationState, ReconciliationStatus},
    request_builder::{BuildError, RequestBuilder},
    signer::{sign_if_required, SignerError},
    wallet::{KeyStore, WalletError},
};

/// Caller-facing errors. Per-node failures never surface here; they only
/// count towards the request's outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("malformed parameters: {0}")]
    MalformedParameters(String),
    #[error("signing key unavailable: {0}")]
    SigningKeyUnavailable(WalletError),
    #[error("pool unreachable: {0}")]
    PoolUnreachable(String),
    #[error("no quorum of {required} before the deadline ({received} replies accepted)")]
    Timeout { required: usize, received: usize },
    #[error("replies conflict beyond {fault_tolerance} tolerated faults: group sizes {groups:?}")]
    Conflict {
        groups: Vec<usize>,
        fault_tolerance: usize,
    },
    #[error("unexpected reply shape: {0}")]
    UnexpectedReplyShape(String),
    #[error("ledger refused the request ({kind:?}): {reason}")]
    Rejected { kind: RejectKind, reason: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<BuildError> for LedgerError {
    fn from(err: BuildError) -> Self {
        Self::MalformedParameters(err.to_string())
    }
}

impl From<SignerError> for LedgerError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::KeyUnavailable(err) => Self::SigningKeyUnavailable(err),
            other => Self::MalformedParameters(other.to_string()),
        }
    }
}

impl From<PoolError> for LedgerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::AlreadyTracked(_) => Self::MalformedParameters(err.to_string()),
            PoolError::UnknownNode(_) => Self::PoolUnreachable(err.to_string()),
            PoolError::EmptyPool | PoolError::Genesis(_) => Self::InvalidConfig(err.to_string()),
        }
    }
}

impl From<ConfigError> for LedgerError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<DispatchError> for LedgerError {
    fn from(err: DispatchError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<ProjectionError> for LedgerError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::Rejected { kind, reason } => Self::Rejected { kind, reason },
            ProjectionError::Shape(reason) => Self::UnexpectedReplyShape(reason),
        }
    }
}

pub struct LedgerClient {
    strategy: DispatchStrategy,
    reconciler: ReconcilerConfig,
    verifier: Arc<dyn ReplyVerifier + Send + Sync>,
}

impl LedgerClient {
    /// Validates `config` against the pool and trusts exactly the pool's
    /// node keys.
    pub fn new(pool: &PoolConnection, config: &LedgerConfig) -> Result<Self, LedgerError> {
        let mut config = config.clone();
        config.pool.fault_tolerance = Some(pool.fault_tolerance());
        let fault_tolerance = config.validate(pool.nodes().len())?;
        let strategy = DispatchStrategy::new(config.dispatch, pool.nodes().len(), fault_tolerance)?;
        Ok(Self {
            strategy,
            reconciler: config.reconciler,
            verifier: Arc::new(Ed25519ReplyVerifier::new(pool.verification_context())),
        })
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ReplyVerifier + Send + Sync>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn strategy(&self) -> &DispatchStrategy {
        &self.strategy
    }

    pub async fn submit(
        &self,
        pool: &PoolConnection,
        request: &Request,
    ) -> Result<TypedResult, LedgerError> {
        self.submit_cancellable(pool, request, &CancellationToken::new())
            .await
    }

    pub async fn submit_cancellable(
        &self,
        pool: &PoolConnection,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<TypedResult, LedgerError> {
        let canonical = self.reconcile(pool, request, cancel).await?;
        Ok(project(request.kind(), &canonical)?)
    }

    /// Signs writes with the submitter's key, then submits.
    pub async fn sign_and_submit<K: KeyStore + ?Sized>(
        &self,
        pool: &PoolConnection,
        wallet: &K,
        submitter: &Did,
        request: &Request,
    ) -> Result<TypedResult, LedgerError> {
        let signed = sign_if_required(request, wallet, submitter)?;
        self.submit(pool, &signed).await
    }

    /// Runs one request to its agreed payload without projecting it.
    pub async fn reconcile(
        &self,
        pool: &PoolConnection,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<CanonicalResult, LedgerError> {
        let req_id = request.req_id;
        let bytes: Arc<[u8]> = canonical_request_bytes(request)
            .map_err(|err| LedgerError::MalformedParameters(err.to_string()))?
            .into();
        let plan = self.strategy.plan(request.kind(), pool.nodes());
        debug!(
            req_id = %req_id,
            kind = %request.kind(),
            targets = plan.targets.len(),
            reserve = plan.reserve.len(),
            quorum = plan.required_quorum,
            "dispatch plan"
        );

        let mut stream = pool.track(req_id)?;
        let mut state = ReconciliationState::new(
            req_id,
            &plan,
            self.strategy.fault_tolerance(),
            self.verifier.clone(),
            self.reconciler.ignore_fields.clone(),
        );
        let deadline = state.deadline();
        send_all(pool, &plan.targets, req_id, &bytes, deadline)?;

        let hedge_at = plan.hedge_delay.map(|delay| Instant::now() + delay);
        let mut hedged = hedge_at.is_none();
        while !state.is_decided() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(req_id = %req_id, "request cancelled");
                    return Err(LedgerError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    state.on_deadline();
                }
                _ = sleep_until(hedge_at.unwrap_or(deadline)), if !hedged => {
                    hedged = true;
                    let recruits = state.take_reserve();
                    send_all(pool, &recruits, req_id, &bytes, deadline)?;
                }
                event = stream.recv() => match event {
                    Some(event) => {
                        state.on_event(event);
                        let recruits = state.take_recruits();
                        send_all(pool, &recruits, req_id, &bytes, deadline)?;
                    }
                    None => {
                        warn!(req_id = %req_id, "reply stream closed");
                        state.on_deadline();
                    }
                },
            }
        }
        drop(stream);

        let groups: Vec<usize> = state.groups().iter().map(|group| group.nodes.len()).collect();
        let received = state.accepted_count();
        match state.into_status() {
            ReconciliationStatus::Consensus(canonical) => {
                info!(
                    req_id = %req_id,
                    agreeing = canonical.agreeing_count(),
                    accepted = canonical.accepted_replies,
                    "request reconciled"
                );
                Ok(canonical)
            }
            ReconciliationStatus::Conflict => {
                info!(req_id = %req_id, groups = ?groups, "request ended in conflict");
                Err(LedgerError::Conflict {
                    groups,
                    fault_tolerance: self.strategy.fault_tolerance(),
                })
            }
            ReconciliationStatus::Unreachable => {
                info!(req_id = %req_id, "pool unreachable");
                Err(LedgerError::PoolUnreachable(format!(
                    "no acceptable reply for request {req_id}"
                )))
            }
            ReconciliationStatus::Timeout | ReconciliationStatus::Pending => {
                info!(req_id = %req_id, received, "request timed out");
                Err(LedgerError::Timeout {
                    required: plan.required_quorum,
                    received,
                })
            }
        }
    }
}

fn send_all(
    pool: &PoolConnection,
    nodes: &[NodeName],
    req_id: ReqId,
    bytes: &Arc<[u8]>,
    deadline: Instant,
) -> Result<(), LedgerError> {
    for node in nodes {
        pool.send(node, req_id, bytes.clone(), deadline)?;
    }
    Ok(())
}

pub fn build_get_txn_request(submitter: &Did, seq_no: SeqNo) -> Request {
    RequestBuilder::new(submitter.clone()).get_txn(seq_no)
}

pub fn build_schema_request(submitter: &Did, schema: &SchemaData) -> Result<Request, LedgerError> {
    Ok(RequestBuilder::new(submitter.clone()).schema(schema)?)
}

pub fn build_nym_request(
    submitter: &Did,
    dest: &Did,
    verkey: Option<&str>,
    alias: Option<&str>,
    role: Option<Role>,
) -> Result<Request, LedgerError> {
    Ok(RequestBuilder::new(submitter.clone()).nym(dest.clone(), verkey, alias, role)?)
}

pub fn build_get_nym_request(submitter: &Did, dest: &Did) -> Request {
    RequestBuilder::new(submitter.clone()).get_nym(dest.clone())
}

pub fn build_attrib_request(submitter: &Did, dest: &Did, raw: &Value) -> Result<Request, LedgerError> {
    Ok(RequestBuilder::new(submitter.clone()).attrib(dest.clone(), raw)?)
}

pub fn build_get_attrib_request(submitter: &Did, dest: &Did, name: &str) -> Result<Request, LedgerError> {
    Ok(RequestBuilder::new(submitter.clone()).get_attrib(dest.clone(), name)?)
}

pub fn build_get_schema_request(
    submitter: &Did,
    dest: &Did,
    name: &str,
    version: &str,
) -> Result<Request, LedgerError> {
    Ok(RequestBuilder::new(submitter.clone()).get_schema(dest.clone(), name, version)?)
}

/// Operation kind a request of `type_code` would carry, for callers holding
/// wire-level type strings.
pub fn kind_of(type_code: &str) -> Result<OperationKind, LedgerError> {
    OperationKind::from_type_code(type_code)
        .ok_or_else(|| LedgerError::MalformedParameters(format!("unknown txn type `{type_code}`")))
}
