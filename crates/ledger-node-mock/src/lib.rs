//! Simulated validator nodes for exercising the ledger client without a real pool.

pub mod ledger;
pub mod node;
pub mod scenarios;
pub mod server;

pub use ledger::{DomainLedger, NymRecord, Refusal};
pub use node::{MockNode, NodeBehavior, NodeError};
pub use scenarios::{genesis_lines, DemoPool, GENESIS_TIME, TRUSTEE_SEED};
pub use server::{NodeServer, SharedNode};
