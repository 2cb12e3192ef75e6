use std::collections::HashMap;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use ledger_node_mock::{NodeError, SharedNode};
use ledger_types::{
    read_frame, write_frame, FrameError, NodeIdentity, NodeName, NodeReply, ReplyFrame, ReqId,
    MAX_FRAME_SIZE,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Retry behavior for a single node exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 500,
            jitter_ms: 20,
        }
    }
}

/// Per-exchange deadline control.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub req_id: ReqId,
    /// Overall request deadline; no attempt starts or sleeps past it.
    pub deadline: Instant,
    /// Upper bound of a single attempt.
    pub node_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("exchange timed out")]
    Timeout,
    #[error("node unavailable: {0}")]
    Unavailable(String),
    #[error("connection closed before a terminal reply")]
    Closed,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("internal transport error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => Self::Unavailable(io.to_string()),
            FrameError::TooLarge(len) => Self::MalformedFrame(format!("frame of {len} bytes")),
        }
    }
}

/// One request/reply exchange with one node. Implementations may be in-process
/// simulations or network transports.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Sends a serialized request and returns every frame the node answered
    /// with, in arrival order.
    async fn exchange(
        &self,
        node: &NodeIdentity,
        request: &[u8],
    ) -> Result<Vec<ReplyFrame>, TransportError>;
}

/// In-process transport backed by simulated nodes.
#[derive(Clone, Default)]
pub struct MockTransport {
    nodes: HashMap<NodeName, SharedNode>,
    delays: HashMap<NodeName, Duration>,
}

impl MockTransport {
    pub fn new(nodes: impl IntoIterator<Item = SharedNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| {
                let name = node
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .name()
                    .clone();
                (name, node)
            })
            .collect();
        Self {
            nodes,
            delays: HashMap::new(),
        }
    }

    /// Adds fixed latency before `node` answers.
    pub fn with_delay(mut self, node: impl Into<NodeName>, delay: Duration) -> Self {
        self.delays.insert(node.into(), delay);
        self
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn exchange(
        &self,
        node: &NodeIdentity,
        request: &[u8],
    ) -> Result<Vec<ReplyFrame>, TransportError> {
        let shared = self
            .nodes
            .get(&node.name)
            .ok_or_else(|| TransportError::Unavailable(format!("no route to {}", node.name)))?;
        if let Some(delay) = self.delays.get(&node.name) {
            tokio::time::sleep(*delay).await;
        }
        let handled = {
            let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
            guard.handle(request)
        };
        match handled {
            Ok(frames) if frames.is_empty() => {
                // A silent node never answers; the caller's timeout ends the exchange.
                futures::future::pending::<()>().await;
                Err(TransportError::Timeout)
            }
            Ok(frames) => Ok(frames),
            Err(NodeError::Unavailable(name)) => Err(TransportError::Unavailable(name.to_string())),
            Err(err) => Err(TransportError::MalformedFrame(err.to_string())),
        }
    }
}

/// Length-prefixed JSON frames over TCP, one exchange per connection. The node
/// writes its frames and closes; frames are read until EOF.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    max_frame_size: Option<usize>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn exchange(
        &self,
        node: &NodeIdentity,
        request: &[u8],
    ) -> Result<Vec<ReplyFrame>, TransportError> {
        let max_size = self.max_frame_size.unwrap_or(MAX_FRAME_SIZE);
        let mut stream = TcpStream::connect(node.address.as_str())
            .await
            .map_err(|err| TransportError::Unavailable(format!("{}: {err}", node.address)))?;
        write_frame(&mut stream, request).await?;

        let mut frames = Vec::new();
        while let Some(bytes) = read_frame(&mut stream, max_size).await? {
            let frame: ReplyFrame = serde_json::from_slice(&bytes)
                .map_err(|err| TransportError::MalformedFrame(err.to_string()))?;
            frames.push(frame);
        }
        let terminal = frames.iter().any(|frame| {
            NodeReply::from_payload(&frame.reply)
                .map(|reply| reply.is_terminal())
                .unwrap_or(true)
        });
        if terminal {
            Ok(frames)
        } else {
            Err(TransportError::Closed)
        }
    }
}

/// Runs one exchange with per-attempt timeout and retries transient failures
/// within the request deadline.
pub async fn exchange_with_retry<T: NodeTransport + ?Sized>(
    transport: &T,
    node: &NodeIdentity,
    request: &[u8],
    meta: &RequestMeta,
) -> Result<Vec<ReplyFrame>, TransportError> {
    retry_with_backoff(meta, || async {
        let remaining = meta.deadline.saturating_duration_since(Instant::now());
        let budget = meta.node_timeout.min(remaining);
        match tokio::time::timeout(budget, transport.exchange(node, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    })
    .await
}

pub async fn retry_with_backoff<T, F, Fut>(meta: &RequestMeta, mut op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= meta.retry_policy.max_retries {
                    return Err(err);
                }
                let now = Instant::now();
                if now >= meta.deadline {
                    return Err(TransportError::Timeout);
                }
                let delay = backoff_delay_ms(attempt, &meta.retry_policy);
                attempt += 1;
                let remaining = meta.deadline.saturating_duration_since(now).as_millis() as u64;
                if delay >= remaining {
                    return Err(err);
                }
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

fn backoff_delay_ms(attempt: u32, policy: &RetryPolicy) -> u64 {
    let exp = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    let capped = exp.min(policy.max_backoff_ms);
    let jitter = if policy.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    };
    capped.saturating_add(jitter)
}
