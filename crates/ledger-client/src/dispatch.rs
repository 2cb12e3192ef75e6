//! Dispatch planning: which nodes a request goes to and how many matching
//! replies it needs.
//!
//! With N nodes and F tolerated faults, writes go to every node and need a
//! quorum whose pairwise overlap holds at least F + 1 nodes, so two quorums
//! always share an honest node. Reads may start on a randomized subset and
//! recruit the remaining nodes, in order, when the subset cannot deliver.

use std::time::Duration;

use ledger_types::{NodeIdentity, NodeName, OperationKind, RequestClass};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DispatchConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("pool has no nodes")]
    EmptyPool,
    #[error("quorum {quorum} is outside 1..={nodes}")]
    QuorumOutOfRange { quorum: usize, nodes: usize },
    #[error(
        "write quorum {quorum} of {nodes} nodes lets two quorums overlap in fewer than {} nodes",
        .fault_tolerance + 1
    )]
    UnsafeWriteQuorum {
        quorum: usize,
        nodes: usize,
        fault_tolerance: usize,
    },
    #[error("read quorum {quorum} does not exceed half of the fault tolerance {fault_tolerance}")]
    UnsafeReadQuorum { quorum: usize, fault_tolerance: usize },
}

/// How many matching replies make a result trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumRule {
    /// N - F
    #[default]
    ByzantineMajority,
    /// F + 1: at least one honest node vouches for the result.
    HonestWitness,
    Fixed(usize),
}

impl QuorumRule {
    pub fn quorum(self, nodes: usize, fault_tolerance: usize) -> usize {
        match self {
            Self::ByzantineMajority => nodes.saturating_sub(fault_tolerance),
            Self::HonestWitness => fault_tolerance + 1,
            Self::Fixed(quorum) => quorum,
        }
    }
}

pub fn default_fault_tolerance(nodes: usize) -> usize {
    nodes.saturating_sub(1) / 3
}

/// Resolves `rule` for `class` and checks it is satisfiable. Writes need any
/// two quorums to intersect in at least F + 1 nodes (2q - N >= F + 1); reads
/// need q > F / 2.
pub fn validate_rule(
    rule: QuorumRule,
    class: RequestClass,
    nodes: usize,
    fault_tolerance: usize,
) -> Result<usize, DispatchError> {
    if nodes == 0 {
        return Err(DispatchError::EmptyPool);
    }
    let quorum = rule.quorum(nodes, fault_tolerance);
    if quorum == 0 || quorum > nodes {
        return Err(DispatchError::QuorumOutOfRange { quorum, nodes });
    }
    if class == RequestClass::Write && 2 * quorum < nodes + fault_tolerance + 1 {
        return Err(DispatchError::UnsafeWriteQuorum {
            quorum,
            nodes,
            fault_tolerance,
        });
    }
    if class == RequestClass::Read && 2 * quorum <= fault_tolerance {
        return Err(DispatchError::UnsafeReadQuorum {
            quorum,
            fault_tolerance,
        });
    }
    Ok(quorum)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub targets: Vec<NodeName>,
    /// Untargeted nodes in recruitment order.
    pub reserve: Vec<NodeName>,
    pub required_quorum: usize,
    pub timeout: Duration,
    pub hedge_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DispatchStrategy {
    config: DispatchConfig,
    fault_tolerance: usize,
}

impl DispatchStrategy {
    pub fn new(
        config: DispatchConfig,
        nodes: usize,
        fault_tolerance: usize,
    ) -> Result<Self, DispatchError> {
        validate_rule(config.write_quorum, RequestClass::Write, nodes, fault_tolerance)?;
        validate_rule(config.read_quorum, RequestClass::Read, nodes, fault_tolerance)?;
        Ok(Self {
            config,
            fault_tolerance,
        })
    }

    pub fn fault_tolerance(&self) -> usize {
        self.fault_tolerance
    }

    pub fn plan(&self, kind: OperationKind, nodes: &[NodeIdentity]) -> DispatchPlan {
        self.plan_with_rng(kind, nodes, &mut rand::thread_rng())
    }

    pub fn plan_with_rng<R: Rng + ?Sized>(
        &self,
        kind: OperationKind,
        nodes: &[NodeIdentity],
        rng: &mut R,
    ) -> DispatchPlan {
        let n = nodes.len();
        let timeout = self.config.request_timeout();
        let mut names: Vec<NodeName> = nodes.iter().map(|node| node.name.clone()).collect();
        match kind.class() {
            RequestClass::Write => DispatchPlan {
                targets: names,
                reserve: Vec::new(),
                required_quorum: self.config.write_quorum.quorum(n, self.fault_tolerance),
                timeout,
                hedge_delay: None,
            },
            RequestClass::Read => {
                let required_quorum = self.config.read_quorum.quorum(n, self.fault_tolerance);
                let fanout = self
                    .config
                    .read_fanout
                    .unwrap_or(required_quorum)
                    .clamp(required_quorum.min(n), n);
                names.shuffle(rng);
                let reserve = names.split_off(fanout);
                let hedge_delay = if reserve.is_empty() {
                    None
                } else {
                    self.config.hedge_delay()
                };
                DispatchPlan {
                    targets: names,
                    reserve,
                    required_quorum,
                    timeout,
                    hedge_delay,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ledger_types::{NodeIdentity, NodeName, OperationKind, RequestClass, Verkey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{default_fault_tolerance, validate_rule, DispatchError, DispatchStrategy, QuorumRule};
    use crate::config::DispatchConfig;

    fn nodes(n: usize) -> Vec<NodeIdentity> {
        (1..=n)
            .map(|i| NodeIdentity {
                name: NodeName::new(format!("Node{i}")),
                address: format!("127.0.0.1:{}", 9700 + 2 * i),
                verkey: Verkey::new([i as u8; 32]),
            })
            .collect()
    }

    #[test]
    fn default_fault_tolerance_follows_3f_plus_1() {
        assert_eq!(default_fault_tolerance(1), 0);
        assert_eq!(default_fault_tolerance(4), 1);
        assert_eq!(default_fault_tolerance(6), 1);
        assert_eq!(default_fault_tolerance(7), 2);
    }

    /// Every pair of 3-node quorums out of 4 shares at least F + 1 = 2 nodes,
    /// so with one faulty node they always share an honest one.
    #[test]
    fn any_two_write_quorums_share_an_honest_node() {
        let n = 4;
        let f = 1;
        let q = validate_rule(QuorumRule::ByzantineMajority, RequestClass::Write, n, f).unwrap();
        assert_eq!(q, 3);
        let subsets: Vec<u32> = (0u32..(1 << n)).filter(|s| s.count_ones() as usize == q).collect();
        assert_eq!(subsets.len(), 4);
        for faulty in 0..n {
            let honest_mask = !(1u32 << faulty) & ((1 << n) - 1);
            for a in &subsets {
                for b in &subsets {
                    assert!((a & b).count_ones() as usize >= f + 1);
                    assert!(a & b & honest_mask != 0, "{a:04b} and {b:04b} share no honest node");
                }
            }
        }
    }

    #[test]
    fn validation_rejects_unsafe_or_impossible_quorums() {
        assert!(matches!(
            validate_rule(QuorumRule::HonestWitness, RequestClass::Write, 4, 1),
            Err(DispatchError::UnsafeWriteQuorum { .. })
        ));
        assert_eq!(validate_rule(QuorumRule::HonestWitness, RequestClass::Read, 4, 1), Ok(2));
        assert!(matches!(
            validate_rule(QuorumRule::Fixed(5), RequestClass::Read, 4, 1),
            Err(DispatchError::QuorumOutOfRange { .. })
        ));
        assert!(validate_rule(QuorumRule::Fixed(0), RequestClass::Read, 4, 1).is_err());
        assert_eq!(validate_rule(QuorumRule::Fixed(4), RequestClass::Write, 4, 1), Ok(4));
        assert_eq!(
            validate_rule(QuorumRule::default(), RequestClass::Read, 0, 0),
            Err(DispatchError::EmptyPool)
        );
    }

    #[test]
    fn read_quorum_must_exceed_half_the_fault_tolerance() {
        assert_eq!(
            validate_rule(QuorumRule::Fixed(1), RequestClass::Read, 7, 2),
            Err(DispatchError::UnsafeReadQuorum {
                quorum: 1,
                fault_tolerance: 2
            })
        );
        assert_eq!(validate_rule(QuorumRule::Fixed(2), RequestClass::Read, 7, 2), Ok(2));
        assert_eq!(validate_rule(QuorumRule::Fixed(1), RequestClass::Read, 4, 1), Ok(1));

        let config = DispatchConfig {
            read_quorum: QuorumRule::Fixed(1),
            ..DispatchConfig::default()
        };
        assert!(matches!(
            DispatchStrategy::new(config, 7, 2),
            Err(DispatchError::UnsafeReadQuorum { .. })
        ));
    }

    #[test]
    fn writes_target_every_node() {
        let strategy = DispatchStrategy::new(DispatchConfig::default(), 4, 1).unwrap();
        let plan = strategy.plan(OperationKind::Schema, &nodes(4));
        assert_eq!(plan.targets.len(), 4);
        assert!(plan.reserve.is_empty());
        assert_eq!(plan.required_quorum, 3);
        assert_eq!(plan.hedge_delay, None);
    }

    #[test]
    fn reads_fan_out_to_a_random_subset_with_ordered_reserve() {
        let config = DispatchConfig {
            read_quorum: QuorumRule::HonestWitness,
            ..DispatchConfig::default()
        };
        let strategy = DispatchStrategy::new(config, 7, 2).unwrap();
        let pool = nodes(7);
        let mut rng = StdRng::seed_from_u64(7);
        let plan = strategy.plan_with_rng(OperationKind::GetTxn, &pool, &mut rng);
        assert_eq!(plan.required_quorum, 3);
        assert_eq!(plan.targets.len(), 3);
        assert_eq!(plan.reserve.len(), 4);
        let all: HashSet<_> = plan.targets.iter().chain(plan.reserve.iter()).collect();
        assert_eq!(all.len(), 7);
        assert!(plan.hedge_delay.is_some());

        let mut first_targets = HashSet::new();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = strategy.plan_with_rng(OperationKind::GetTxn, &pool, &mut rng);
            first_targets.insert(plan.targets[0].clone());
        }
        assert!(first_targets.len() > 1, "read targets should vary");
    }

    #[test]
    fn default_read_plan_on_four_nodes_targets_quorum_and_keeps_one_in_reserve() {
        let strategy = DispatchStrategy::new(DispatchConfig::default(), 4, 1).unwrap();
        let plan = strategy.plan(OperationKind::GetTxn, &nodes(4));
        assert_eq!(plan.required_quorum, 3);
        assert_eq!(plan.targets.len(), 3);
        assert_eq!(plan.reserve.len(), 1);
    }
}
