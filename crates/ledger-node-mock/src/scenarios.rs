use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use ledger_crypto::{keypair_from_seed, Ed25519NodeSigner};
use ledger_types::{Did, NodeIdentity};
use serde_json::json;

use crate::{
    ledger::DomainLedger,
    node::{MockNode, NodeBehavior},
    server::{NodeServer, SharedNode},
};

/// Seed of the trustee DID every demo ledger starts with.
pub const TRUSTEE_SEED: [u8; 32] = *b"000000000000000000000000Trustee1";
pub const GENESIS_TIME: u64 = 1_700_000_000;

/// A pool of simulated nodes sharing one genesis: the trustee NYM at seqNo 1.
#[derive(Debug, Clone)]
pub struct DemoPool {
    pub trustee_did: Did,
    pub nodes: Vec<SharedNode>,
}

impl DemoPool {
    pub fn new(size: usize) -> Self {
        let (_, trustee_verkey, trustee_did) = keypair_from_seed(TRUSTEE_SEED);
        let nodes = (1..=size)
            .map(|index| {
                let name = format!("Node{index}");
                let signer = Ed25519NodeSigner::from_seed(name.as_str(), node_seed(&name));
                let ledger =
                    DomainLedger::with_trustee(GENESIS_TIME, trustee_did.clone(), trustee_verkey);
                let address = format!("127.0.0.1:{}", 9700 + 2 * index);
                Arc::new(Mutex::new(MockNode::new(signer, address, ledger)))
            })
            .collect();
        Self { trustee_did, nodes }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Applies `f` to node `index` (0-based). `None` when out of range.
    pub fn with_node<R>(&self, index: usize, f: impl FnOnce(&mut MockNode) -> R) -> Option<R> {
        let node = self.nodes.get(index)?;
        let mut guard = node.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    pub fn set_behavior(&self, index: usize, behavior: NodeBehavior) -> bool {
        self.with_node(index, |node| node.set_behavior(behavior)).is_some()
    }

    pub fn identities(&self) -> Vec<NodeIdentity> {
        (0..self.size())
            .filter_map(|index| self.with_node(index, |node| node.identity()))
            .collect()
    }

    /// Binds every node to an ephemeral loopback port. The returned identities
    /// carry the real addresses; the servers stop when dropped.
    pub async fn serve(&self) -> io::Result<(Vec<NodeIdentity>, Vec<NodeServer>)> {
        let mut identities = Vec::with_capacity(self.size());
        let mut servers = Vec::with_capacity(self.size());
        for node in &self.nodes {
            let server = NodeServer::spawn("127.0.0.1:0", node.clone()).await?;
            let address = server.local_addr().to_string();
            let identity = {
                let mut guard = node.lock().unwrap_or_else(PoisonError::into_inner);
                guard.set_address(address);
                guard.identity()
            };
            identities.push(identity);
            servers.push(server);
        }
        Ok((identities, servers))
    }
}

fn node_seed(name: &str) -> [u8; 32] {
    let mut seed = [b'0'; 32];
    let bytes = name.as_bytes();
    let len = bytes.len().min(32);
    seed[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    seed
}

/// Pool genesis transactions, one JSON line per node, in the ledger's NODE txn shape.
pub fn genesis_lines(identities: &[NodeIdentity]) -> Vec<String> {
    identities
        .iter()
        .enumerate()
        .map(|(index, identity)| {
            let (ip, port) = identity
                .address
                .rsplit_once(':')
                .map(|(ip, port)| (ip.to_string(), port.parse::<u16>().unwrap_or_default()))
                .unwrap_or_else(|| (identity.address.clone(), 0));
            json!({
                "data": {
                    "alias": identity.name,
                    "client_ip": ip,
                    "client_port": port,
                    "node_ip": ip,
                    "node_port": port.saturating_sub(1),
                    "services": ["VALIDATOR"],
                },
                "dest": identity.verkey,
                "txnId": format!("{:064x}", index + 1),
                "type": "0",
            })
            .to_string()
        })
        .collect()
}
