//! Reply reconciliation: verifies node replies for one request, groups them by
//! normalized payload, and decides when a quorum agrees.
//!
//! Each accepted reply is keyed by node; a node's newer reply replaces its
//! older one. The status is monotone: once it leaves `Pending` it never
//! changes, and later replies are kept for audit only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ledger_crypto::{payload_digest, strip_paths};
use ledger_types::{
    CryptoError, NodeName, NodeReply, PayloadDigest, ReplyFrame, ReplyVerifier, ReqId,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchPlan;
use crate::pool::NodeEvent;

/// The agreed payload and who vouched for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResult {
    /// Normalized payload the quorum agreed on.
    pub payload: Value,
    pub digest: PayloadDigest,
    pub agreeing_nodes: Vec<NodeName>,
    /// Replies accepted when the decision was made, agreeing or not.
    pub accepted_replies: usize,
}

impl CanonicalResult {
    pub fn agreeing_count(&self) -> usize {
        self.agreeing_nodes.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationStatus {
    Pending,
    Consensus(CanonicalResult),
    /// No quorum and no provable disagreement.
    Timeout,
    /// Disagreement more than F faulty nodes cannot explain.
    Conflict,
    /// No acceptable reply at all.
    Unreachable,
}

impl ReconciliationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRejection {
    NotTargeted,
    WrongChannel { claimed: NodeName },
    BadSignature(CryptoError),
    Stale { received: u64 },
    Malformed(String),
}

/// Replies sharing one normalized payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyGroup {
    pub digest: PayloadDigest,
    pub nodes: Vec<NodeName>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
struct AcceptedReply {
    node: NodeName,
    digest: PayloadDigest,
    payload: Value,
}

pub struct ReconciliationState {
    req_id: ReqId,
    required_quorum: usize,
    fault_tolerance: usize,
    deadline: Instant,
    verifier: Arc<dyn ReplyVerifier + Send + Sync>,
    ignore_fields: Vec<String>,
    received: Vec<AcceptedReply>,
    targets: HashSet<NodeName>,
    outstanding: HashSet<NodeName>,
    reserve: VecDeque<NodeName>,
    status: ReconciliationStatus,
}

impl ReconciliationState {
    pub fn new(
        req_id: ReqId,
        plan: &DispatchPlan,
        fault_tolerance: usize,
        verifier: Arc<dyn ReplyVerifier + Send + Sync>,
        ignore_fields: Vec<String>,
    ) -> Self {
        Self {
            req_id,
            required_quorum: plan.required_quorum,
            fault_tolerance,
            deadline: Instant::now() + plan.timeout,
            verifier,
            ignore_fields,
            received: Vec::new(),
            targets: plan.targets.iter().cloned().collect(),
            outstanding: plan.targets.iter().cloned().collect(),
            reserve: plan.reserve.iter().cloned().collect(),
            status: ReconciliationStatus::Pending,
        }
    }

    pub fn req_id(&self) -> ReqId {
        self.req_id
    }

    pub fn required_quorum(&self) -> usize {
        self.required_quorum
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn status(&self) -> &ReconciliationStatus {
        &self.status
    }

    pub fn into_status(self) -> ReconciliationStatus {
        self.status
    }

    pub fn is_decided(&self) -> bool {
        !self.status.is_pending()
    }

    pub fn accepted_count(&self) -> usize {
        self.received.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Accepted replies as (node, digest), in arrival order.
    pub fn received(&self) -> impl Iterator<Item = (&NodeName, &PayloadDigest)> {
        self.received.iter().map(|reply| (&reply.node, &reply.digest))
    }

    pub fn on_event(&mut self, event: NodeEvent) -> &ReconciliationStatus {
        match event {
            NodeEvent::Failed { node, error } => {
                warn!(req_id = %self.req_id, node = %node, error = %error, "node channel failed");
                self.outstanding.remove(&node);
            }
            NodeEvent::Replied { node, frames } => {
                for frame in frames {
                    if let Err(rejection) = self.accept(&node, frame) {
                        warn!(req_id = %self.req_id, node = %node, reason = ?rejection, "rejected reply");
                    }
                }
                self.outstanding.remove(&node);
            }
        }
        self.evaluate();
        &self.status
    }

    /// Nodes to recruit now because the current targets can no longer reach
    /// the quorum even if all of them agreed.
    pub fn take_recruits(&mut self) -> Vec<NodeName> {
        if !self.status.is_pending() {
            return Vec::new();
        }
        let potential = self.largest_group() + self.outstanding.len();
        let missing = self.required_quorum.saturating_sub(potential);
        self.recruit(missing)
    }

    /// Recruits every remaining reserve node.
    pub fn take_reserve(&mut self) -> Vec<NodeName> {
        if !self.status.is_pending() {
            return Vec::new();
        }
        self.recruit(self.reserve.len())
    }

    /// Decides a still-pending request at its deadline.
    pub fn on_deadline(&mut self) -> &ReconciliationStatus {
        if self.status.is_pending() {
            self.status = self.final_status();
            info!(req_id = %self.req_id, status = ?self.status, accepted = self.received.len(), "deadline reached");
        }
        &self.status
    }

    /// Reply groups, largest first; ties keep first-arrival order.
    pub fn groups(&self) -> Vec<ReplyGroup> {
        let mut index: HashMap<PayloadDigest, usize> = HashMap::new();
        let mut groups: Vec<ReplyGroup> = Vec::new();
        for reply in &self.received {
            match index.get(&reply.digest) {
                Some(&position) => groups[position].nodes.push(reply.node.clone()),
                None => {
                    index.insert(reply.digest, groups.len());
                    groups.push(ReplyGroup {
                        digest: reply.digest,
                        nodes: vec![reply.node.clone()],
                        payload: reply.payload.clone(),
                    });
                }
            }
        }
        groups.sort_by(|a, b| b.nodes.len().cmp(&a.nodes.len()));
        groups
    }

    fn recruit(&mut self, count: usize) -> Vec<NodeName> {
        let count = count.min(self.reserve.len());
        let recruits: Vec<NodeName> = self.reserve.drain(..count).collect();
        for node in &recruits {
            self.targets.insert(node.clone());
            self.outstanding.insert(node.clone());
        }
        if !recruits.is_empty() {
            debug!(req_id = %self.req_id, recruits = ?recruits, "recruiting reserve nodes");
        }
        recruits
    }

    fn accept(&mut self, channel: &NodeName, frame: ReplyFrame) -> Result<(), ReplyRejection> {
        if !self.targets.contains(channel) {
            return Err(ReplyRejection::NotTargeted);
        }
        if frame.node != *channel {
            return Err(ReplyRejection::WrongChannel {
                claimed: frame.node.clone(),
            });
        }
        self.verifier
            .verify_frame(&frame)
            .map_err(ReplyRejection::BadSignature)?;
        if frame.req_id != self.req_id {
            return Err(ReplyRejection::Stale {
                received: frame.req_id.0,
            });
        }
        if let Some(echoed) = NodeReply::echoed_req_id(&frame.reply) {
            if echoed != self.req_id.0 {
                return Err(ReplyRejection::Stale { received: echoed });
            }
        }
        let reply = NodeReply::from_payload(&frame.reply)
            .map_err(|err| ReplyRejection::Malformed(err.to_string()))?;
        if !reply.is_terminal() {
            return Ok(());
        }

        let mut payload = frame.reply;
        strip_paths(&mut payload, &self.ignore_fields);
        let digest = payload_digest(&payload);
        debug!(req_id = %self.req_id, node = %channel, digest = %digest, "accepted reply");
        self.received.retain(|reply| reply.node != *channel);
        self.received.push(AcceptedReply {
            node: channel.clone(),
            digest,
            payload,
        });
        Ok(())
    }

    fn evaluate(&mut self) {
        if !self.status.is_pending() {
            return;
        }
        let groups = self.groups();
        let largest = groups.first().map(|group| group.nodes.len()).unwrap_or(0);
        if let Some(winner) = groups.into_iter().next().filter(|_| largest >= self.required_quorum) {
            info!(
                req_id = %self.req_id,
                digest = %winner.digest,
                agreeing = winner.nodes.len(),
                accepted = self.received.len(),
                "consensus reached"
            );
            self.status = ReconciliationStatus::Consensus(CanonicalResult {
                payload: winner.payload,
                digest: winner.digest,
                agreeing_nodes: winner.nodes,
                accepted_replies: self.received.len(),
            });
            return;
        }

        let potential = largest + self.outstanding.len() + self.reserve.len();
        if potential >= self.required_quorum {
            return;
        }
        // Dissent only grows, so a conflict seen now stands.
        if self.conflicting() {
            warn!(req_id = %self.req_id, groups = ?self.group_sizes(), "conflicting replies");
            self.status = ReconciliationStatus::Conflict;
        } else if self.outstanding.is_empty() {
            self.status = self.final_status();
            info!(req_id = %self.req_id, status = ?self.status, "no quorum possible");
        }
    }

    fn final_status(&self) -> ReconciliationStatus {
        if self.received.is_empty() {
            ReconciliationStatus::Unreachable
        } else if self.conflicting() {
            ReconciliationStatus::Conflict
        } else {
            ReconciliationStatus::Timeout
        }
    }

    fn largest_group(&self) -> usize {
        self.groups().first().map(|group| group.nodes.len()).unwrap_or(0)
    }

    fn group_sizes(&self) -> Vec<usize> {
        self.groups().iter().map(|group| group.nodes.len()).collect()
    }

    /// At least two groups, and more replies outside the largest group than
    /// F faulty nodes could produce.
    fn conflicting(&self) -> bool {
        let groups = self.groups();
        let largest = groups.first().map(|group| group.nodes.len()).unwrap_or(0);
        groups.len() >= 2 && self.received.len() - largest > self.fault_tolerance
    }
}
