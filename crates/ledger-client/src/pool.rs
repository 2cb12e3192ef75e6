//! Pool connection: one worker task and one logical channel per node, and a
//! router that delivers each node's answer to whoever tracks the request.
//!
//! Workers run their exchanges one at a time, so a node sees requests in the
//! order they were sent to it. Answers are routed by the `reqId` of the
//! request that produced them, not by what the frames claim, so stale or
//! forged frames still reach the reconciler and fail there.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use ledger_types::{NodeIdentity, NodeName, ReplyFrame, ReqId, Verkey, VerificationContext};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::dispatch::default_fault_tolerance;
use crate::transport::{exchange_with_retry, NodeTransport, RequestMeta, RetryPolicy, TransportError};

const NODE_TXN_TYPE: &str = "0";
const VALIDATOR_SERVICE: &str = "VALIDATOR";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("request {0} is already tracked")]
    AlreadyTracked(ReqId),
    #[error("unknown node {0}")]
    UnknownNode(NodeName),
    #[error("pool has no nodes")]
    EmptyPool,
    #[error("invalid pool genesis: {0}")]
    Genesis(String),
}

/// Outcome of one exchange with one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Replied {
        node: NodeName,
        frames: Vec<ReplyFrame>,
    },
    Failed {
        node: NodeName,
        error: TransportError,
    },
}

impl NodeEvent {
    pub fn node(&self) -> &NodeName {
        match self {
            Self::Replied { node, .. } | Self::Failed { node, .. } => node,
        }
    }
}

/// The validator set a pool connection is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolGenesis {
    nodes: Vec<NodeIdentity>,
}

impl PoolGenesis {
    pub fn from_identities(nodes: Vec<NodeIdentity>) -> Result<Self, PoolError> {
        if nodes.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(&node.name) {
                return Err(PoolError::Genesis(format!("duplicate node {}", node.name)));
            }
        }
        Ok(Self { nodes })
    }

    /// Parses genesis NODE transactions, one JSON object per line. Both the
    /// bare `{"data", "dest", "type"}` shape and the `{"txn": {...}}` envelope
    /// are accepted. A later transaction for the same alias replaces the
    /// earlier one; nodes whose services omit `VALIDATOR` are left out.
    pub fn parse(text: &str) -> Result<Self, PoolError> {
        let mut order: Vec<NodeName> = Vec::new();
        let mut latest: HashMap<NodeName, Option<NodeIdentity>> = HashMap::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let txn: Value = serde_json::from_str(line)
                .map_err(|err| PoolError::Genesis(format!("line {}: {err}", line_no + 1)))?;
            let Some((name, identity)) = parse_node_txn(&txn)
                .map_err(|reason| PoolError::Genesis(format!("line {}: {reason}", line_no + 1)))?
            else {
                continue;
            };
            if !latest.contains_key(&name) {
                order.push(name.clone());
            }
            latest.insert(name, identity);
        }
        let nodes = order
            .into_iter()
            .filter_map(|name| latest.remove(&name).flatten())
            .collect();
        Self::from_identities(nodes)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| PoolError::Genesis(format!("{}: {err}", path.display())))?;
        Self::parse(&text)
    }

    /// Loads the genesis file named by `[pool] genesis_path`.
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        let path = config
            .genesis_path
            .as_deref()
            .ok_or_else(|| PoolError::Genesis("no genesis_path configured".to_string()))?;
        Self::from_file(path)
    }

    pub fn nodes(&self) -> &[NodeIdentity] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// `Ok(None)` for transactions that are not NODE transactions.
fn parse_node_txn(txn: &Value) -> Result<Option<(NodeName, Option<NodeIdentity>)>, String> {
    let (body, txn_type) = match txn.get("txn") {
        Some(envelope) => (envelope.get("data").unwrap_or(&Value::Null), envelope.get("type")),
        None => (txn, txn.get("type")),
    };
    if txn_type.and_then(Value::as_str) != Some(NODE_TXN_TYPE) {
        return Ok(None);
    }
    let data = body.get("data").ok_or("missing data")?;
    let alias = data
        .get("alias")
        .and_then(Value::as_str)
        .ok_or("missing alias")?;
    let name = NodeName::new(alias);
    if let Some(services) = data.get("services").and_then(Value::as_array) {
        if !services.iter().any(|service| service == VALIDATOR_SERVICE) {
            return Ok(Some((name, None)));
        }
    }
    let ip = data
        .get("client_ip")
        .and_then(Value::as_str)
        .ok_or("missing client_ip")?;
    let port = data
        .get("client_port")
        .and_then(Value::as_u64)
        .ok_or("missing client_port")?;
    let dest = body
        .get("dest")
        .and_then(Value::as_str)
        .ok_or("missing dest")?;
    let verkey = Verkey::from_base58(dest).map_err(|err| format!("dest: {err}"))?;
    let identity = NodeIdentity {
        name: name.clone(),
        address: format!("{ip}:{port}"),
        verkey,
    };
    Ok(Some((name, Some(identity))))
}

type Router = Arc<Mutex<HashMap<ReqId, mpsc::UnboundedSender<NodeEvent>>>>;

fn route(router: &Router, req_id: ReqId, event: NodeEvent) {
    let sender = router
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&req_id)
        .cloned();
    match sender {
        Some(sender) => {
            if sender.send(event).is_err() {
                debug!(req_id = %req_id, "reply stream already closed");
            }
        }
        None => debug!(req_id = %req_id, node = %event.node(), "ignoring answer for untracked request"),
    }
}

fn is_tracked(router: &Router, req_id: ReqId) -> bool {
    router
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&req_id)
}

/// Node answers for one tracked request. Dropping the stream stops tracking
/// the request; queued sends for it are skipped.
#[derive(Debug)]
pub struct ReplyStream {
    req_id: ReqId,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    router: Router,
}

impl ReplyStream {
    pub fn req_id(&self) -> ReqId {
        self.req_id
    }

    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.req_id);
    }
}

#[derive(Debug)]
struct Outbound {
    req_id: ReqId,
    bytes: Arc<[u8]>,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct WorkerSettings {
    node_timeout: std::time::Duration,
    retry: RetryPolicy,
}

pub struct PoolConnection {
    nodes: Vec<NodeIdentity>,
    fault_tolerance: usize,
    queues: HashMap<NodeName, mpsc::Sender<Outbound>>,
    workers: Vec<JoinHandle<()>>,
    router: Router,
}

impl PoolConnection {
    /// Spawns one worker per node. Must be called inside a tokio runtime.
    pub fn open(
        genesis: PoolGenesis,
        transport: Arc<dyn NodeTransport>,
        config: &PoolConfig,
    ) -> Result<Self, PoolError> {
        let nodes = genesis.nodes;
        if nodes.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        let fault_tolerance = config
            .fault_tolerance
            .unwrap_or_else(|| default_fault_tolerance(nodes.len()));
        let settings = WorkerSettings {
            node_timeout: config.node_timeout(),
            retry: config.retry.clone(),
        };
        let router: Router = Arc::new(Mutex::new(HashMap::new()));
        let mut queues = HashMap::with_capacity(nodes.len());
        let mut workers = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            queues.insert(node.name.clone(), tx);
            workers.push(tokio::spawn(run_worker(
                node.clone(),
                transport.clone(),
                rx,
                router.clone(),
                settings.clone(),
            )));
        }
        info!(nodes = nodes.len(), fault_tolerance, "pool connection opened");
        Ok(Self {
            nodes,
            fault_tolerance,
            queues,
            workers,
            router,
        })
    }

    pub fn nodes(&self) -> &[NodeIdentity] {
        &self.nodes
    }

    pub fn fault_tolerance(&self) -> usize {
        self.fault_tolerance
    }

    pub fn verification_context(&self) -> VerificationContext {
        VerificationContext::from_identities(&self.nodes)
    }

    /// Starts routing answers for `req_id` to the returned stream.
    pub fn track(&self, req_id: ReqId) -> Result<ReplyStream, PoolError> {
        let mut routes = self.router.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(&req_id) {
            return Err(PoolError::AlreadyTracked(req_id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(req_id, tx);
        Ok(ReplyStream {
            req_id,
            events: rx,
            router: self.router.clone(),
        })
    }

    /// Queues `bytes` for `node`. A full or closed queue is reported to the
    /// tracker as a failure of that node, never to the caller.
    pub fn send(
        &self,
        node: &NodeName,
        req_id: ReqId,
        bytes: Arc<[u8]>,
        deadline: Instant,
    ) -> Result<(), PoolError> {
        let queue = self
            .queues
            .get(node)
            .ok_or_else(|| PoolError::UnknownNode(node.clone()))?;
        let outbound = Outbound {
            req_id,
            bytes,
            deadline,
        };
        let error = match queue.try_send(outbound) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                TransportError::Unavailable(format!("send queue for {node} is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => TransportError::Closed,
        };
        warn!(req_id = %req_id, node = %node, error = %error, "send failed");
        route(
            &self.router,
            req_id,
            NodeEvent::Failed {
                node: node.clone(),
                error,
            },
        );
        Ok(())
    }

    /// Closes every queue and waits for in-flight exchanges to finish.
    pub async fn close(mut self) {
        self.queues.clear();
        for worker in std::mem::take(&mut self.workers) {
            if let Err(err) = worker.await {
                warn!(error = %err, "pool worker ended abnormally");
            }
        }
        info!(nodes = self.nodes.len(), "pool connection closed");
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        // Closed queues let workers exit after their current exchange.
        self.queues.clear();
    }
}

async fn run_worker(
    node: NodeIdentity,
    transport: Arc<dyn NodeTransport>,
    mut queue: mpsc::Receiver<Outbound>,
    router: Router,
    settings: WorkerSettings,
) {
    while let Some(outbound) = queue.recv().await {
        if !is_tracked(&router, outbound.req_id) {
            debug!(req_id = %outbound.req_id, node = %node.name, "skipping abandoned request");
            continue;
        }
        let event = if Instant::now() >= outbound.deadline {
            NodeEvent::Failed {
                node: node.name.clone(),
                error: TransportError::Timeout,
            }
        } else {
            let meta = RequestMeta {
                req_id: outbound.req_id,
                deadline: outbound.deadline,
                node_timeout: settings.node_timeout,
                retry_policy: settings.retry.clone(),
            };
            match exchange_with_retry(transport.as_ref(), &node, &outbound.bytes, &meta).await {
                Ok(frames) => NodeEvent::Replied {
                    node: node.name.clone(),
                    frames,
                },
                Err(error) => NodeEvent::Failed {
                    node: node.name.clone(),
                    error,
                },
            }
        };
        route(&router, outbound.req_id, event);
    }
    debug!(node = %node.name, "pool worker stopped");
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use ledger_node_mock::{genesis_lines, DemoPool, NodeBehavior};
    use ledger_types::{NodeName, Operation, ReqId, Request};
    use tokio::time::Instant;

    use super::{NodeEvent, PoolConnection, PoolError, PoolGenesis};
    use crate::config::PoolConfig;
    use crate::transport::{MockTransport, TransportError};

    fn get_txn(pool: &DemoPool, req_id: u64) -> Arc<[u8]> {
        let request = Request {
            req_id: ReqId(req_id),
            identifier: pool.trustee_did.clone(),
            operation: Operation::GetTxn { data: 1 },
            signature: None,
        };
        serde_json::to_vec(&request).unwrap().into()
    }

    fn fast_config() -> PoolConfig {
        let mut config = PoolConfig {
            node_timeout_ms: 50,
            ..PoolConfig::default()
        };
        config.retry.max_retries = 0;
        config
    }

    fn open(pool: &DemoPool) -> PoolConnection {
        let genesis = PoolGenesis::from_identities(pool.identities()).unwrap();
        PoolConnection::open(genesis, Arc::new(MockTransport::new(pool.nodes.clone())), &fast_config())
            .unwrap()
    }

    #[test]
    fn genesis_parses_node_txns_and_keeps_latest_per_alias() {
        let pool = DemoPool::new(3);
        let identities = pool.identities();
        let mut lines = genesis_lines(&identities);
        lines.push(String::new());
        lines.push(
            r#"{"data":{"alias":"Node1","client_ip":"10.0.0.9","client_port":9999},"dest":"DEST","type":"0"}"#
                .replace("DEST", &identities[0].verkey.to_string()),
        );
        lines.push(
            r#"{"txn":{"data":{"data":{"alias":"Node3","services":[]},"dest":"x"},"type":"0"}}"#.to_string(),
        );
        lines.push(r#"{"type":"1","dest":"ignored"}"#.to_string());

        let genesis = PoolGenesis::parse(&lines.join("\n")).unwrap();
        assert_eq!(genesis.len(), 2);
        assert_eq!(genesis.nodes()[0].address, "10.0.0.9:9999");
        assert_eq!(genesis.nodes()[1], identities[1]);
    }

    #[test]
    fn genesis_rejects_bad_input() {
        assert_eq!(PoolGenesis::parse(""), Err(PoolError::EmptyPool));
        assert!(matches!(PoolGenesis::parse("not json"), Err(PoolError::Genesis(_))));
        assert!(matches!(
            PoolGenesis::parse(r#"{"data":{"alias":"N"},"type":"0"}"#),
            Err(PoolError::Genesis(_))
        ));
        let pool = DemoPool::new(1);
        let mut twice = pool.identities();
        twice.extend(pool.identities());
        assert!(matches!(PoolGenesis::from_identities(twice), Err(PoolError::Genesis(_))));
    }

    #[tokio::test]
    async fn opens_from_the_configured_genesis_file() {
        let pool = DemoPool::new(4);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", genesis_lines(&pool.identities()).join("\n")).unwrap();

        let config = PoolConfig {
            genesis_path: Some(file.path().to_path_buf()),
            ..fast_config()
        };
        let genesis = PoolGenesis::from_config(&config).unwrap();
        assert_eq!(genesis.nodes(), pool.identities().as_slice());

        let connection =
            PoolConnection::open(genesis, Arc::new(MockTransport::new(pool.nodes.clone())), &config)
                .unwrap();
        let mut stream = connection.track(ReqId(4)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        connection.send(&NodeName::new("Node2"), ReqId(4), get_txn(&pool, 4), deadline).unwrap();
        assert!(matches!(stream.recv().await, Some(NodeEvent::Replied { .. })));
        connection.close().await;

        assert!(matches!(PoolGenesis::from_config(&fast_config()), Err(PoolError::Genesis(_))));
        let missing = PoolConfig {
            genesis_path: Some(file.path().with_extension("missing")),
            ..fast_config()
        };
        assert!(matches!(PoolGenesis::from_config(&missing), Err(PoolError::Genesis(_))));
    }

    #[tokio::test]
    async fn routes_answers_to_the_tracking_stream() {
        let pool = DemoPool::new(4);
        let connection = open(&pool);
        assert_eq!(connection.fault_tolerance(), 1);
        let mut stream = connection.track(ReqId(5)).unwrap();
        assert_eq!(connection.track(ReqId(5)).unwrap_err(), PoolError::AlreadyTracked(ReqId(5)));

        let deadline = Instant::now() + Duration::from_secs(1);
        let bytes = get_txn(&pool, 5);
        for node in connection.nodes() {
            connection.send(&node.name, ReqId(5), bytes.clone(), deadline).unwrap();
        }
        let mut replied = 0;
        for _ in 0..4 {
            if let Some(NodeEvent::Replied { frames, .. }) = stream.recv().await {
                assert_eq!(frames[0].req_id, ReqId(5));
                replied += 1;
            }
        }
        assert_eq!(replied, 4);
        connection.close().await;
    }

    #[tokio::test]
    async fn per_node_failures_are_reported_per_node() {
        let pool = DemoPool::new(4);
        pool.set_behavior(0, NodeBehavior::Unavailable);
        pool.set_behavior(1, NodeBehavior::Silent);
        let connection = open(&pool);
        let mut stream = connection.track(ReqId(6)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let bytes = get_txn(&pool, 6);
        for node in connection.nodes() {
            connection.send(&node.name, ReqId(6), bytes.clone(), deadline).unwrap();
        }
        let mut failures = Vec::new();
        let mut replies = 0;
        for _ in 0..4 {
            match stream.recv().await {
                Some(NodeEvent::Failed { node, error }) => failures.push((node, error)),
                Some(NodeEvent::Replied { .. }) => replies += 1,
                None => break,
            }
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(replies, 2);
        assert!(matches!(failures[0].1, TransportError::Unavailable(_)));
        assert_eq!(failures[1].1, TransportError::Timeout);
    }

    #[tokio::test]
    async fn unknown_node_and_dropped_stream() {
        let pool = DemoPool::new(4);
        let connection = open(&pool);
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = connection
            .send(&NodeName::new("Node9"), ReqId(7), get_txn(&pool, 7), deadline)
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownNode(NodeName::new("Node9")));

        let stream = connection.track(ReqId(7)).unwrap();
        drop(stream);
        assert!(connection.track(ReqId(7)).is_ok());
    }
}
