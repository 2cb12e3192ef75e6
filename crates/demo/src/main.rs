//! Demo binary: registers a schema on a simulated validator pool and reads it
//! back by sequence number, with some nodes misbehaving.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use ledger_client::{
    build_get_txn_request, build_schema_request, GetTxnResult, InMemoryWallet, LedgerClient,
    LedgerConfig, MockTransport, NodeTransport, PoolConnection, PoolGenesis, TcpTransport,
    TypedResult,
};
use ledger_node_mock::{genesis_lines, DemoPool, NodeBehavior, TRUSTEE_SEED};
use ledger_types::SchemaData;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ledger-demo",
    about = "Write a schema and read it back through quorum reconciliation"
)]
struct Cli {
    /// Number of validator nodes in the simulated pool.
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// How many nodes misbehave, starting from the last one.
    #[arg(long, default_value = "1")]
    faulty: usize,

    /// Behavior of the faulty nodes.
    #[arg(long, value_enum, default_value = "corrupt")]
    fault: Fault,

    /// Client configuration in TOML.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the nodes on loopback TCP instead of calling them in-process.
    #[arg(long)]
    tcp: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Fault {
    Corrupt,
    BadSignature,
    Silent,
    Divergent,
}

impl Fault {
    fn behavior(self, index: usize) -> NodeBehavior {
        match self {
            Self::Corrupt => NodeBehavior::CorruptPayload,
            Self::BadSignature => NodeBehavior::BadSignature,
            Self::Silent => NodeBehavior::Silent,
            Self::Divergent => NodeBehavior::Divergent(index as u64),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };

    let pool = DemoPool::new(cli.nodes);
    for index in cli.nodes.saturating_sub(cli.faulty)..cli.nodes {
        pool.set_behavior(index, cli.fault.behavior(index));
        warn!(node = index + 1, fault = ?cli.fault, "node misbehaves");
    }

    let (identities, _servers) = if cli.tcp {
        pool.serve().await?
    } else {
        (pool.identities(), Vec::new())
    };
    let transport: Arc<dyn NodeTransport> = if cli.tcp {
        Arc::new(TcpTransport::new())
    } else {
        Arc::new(MockTransport::new(pool.nodes.clone()))
    };
    let genesis = if config.pool.genesis_path.is_some() {
        PoolGenesis::from_config(&config.pool)?
    } else {
        PoolGenesis::parse(&genesis_lines(&identities).join("\n"))?
    };
    let connection = PoolConnection::open(genesis, transport, &config.pool)?;
    let client = LedgerClient::new(&connection, &config)?;

    let mut wallet = InMemoryWallet::new();
    let (trustee, _) = wallet.create_did(TRUSTEE_SEED);
    let schema = SchemaData {
        name: "gvt2".to_string(),
        version: "3.0".to_string(),
        keys: vec!["name".to_string(), "male".to_string()],
    };

    info!(issuer = %trustee, name = %schema.name, "submitting schema");
    let request = build_schema_request(&trustee, &schema)?;
    let receipt = client
        .sign_and_submit(&connection, &wallet, &trustee, &request)
        .await?
        .into_receipt()
        .ok_or("schema write did not return a receipt")?;
    info!(seq_no = receipt.seq_no, txn_time = receipt.txn_time, "schema committed");

    let read = build_get_txn_request(&trustee, receipt.seq_no);
    match client.submit(&connection, &read).await? {
        TypedResult::Txn(GetTxnResult::Found(txn)) => {
            let data = txn.data.ok_or("transaction without data")?;
            info!(seq_no = txn.seq_no, data = %data, "read back schema");
        }
        other => return Err(format!("unexpected read result: {other:?}").into()),
    }

    let next = build_get_txn_request(&trustee, receipt.seq_no + 1);
    if let Some(GetTxnResult::NotFound) = client.submit(&connection, &next).await?.into_txn() {
        info!(seq_no = receipt.seq_no + 1, "no transaction yet");
    }

    connection.close().await;
    Ok(())
}
