//! Serves a `MockNode` over TCP using the shared length-prefixed framing.
//!
//! One request frame per connection. The node's reply frames are written in
//! order and the connection is closed; a silent node holds the connection
//! open until the client hangs up.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use ledger_types::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::MockNode;

pub type SharedNode = Arc<Mutex<MockNode>>;

/// A running listener. Dropping the handle stops accepting connections.
#[derive(Debug)]
pub struct NodeServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl NodeServer {
    pub async fn spawn(bind: &str, node: SharedNode) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let name = node.lock().unwrap_or_else(PoisonError::into_inner).name().clone();
        info!(node = %name, addr = %local_addr, "mock node listening");
        let task = tokio::spawn(accept_loop(listener, node));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, node: SharedNode) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, node).await {
                        debug!(peer = %peer, error = %err, "connection ended with error");
                    }
                });
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
}

async fn serve_connection(mut stream: TcpStream, node: SharedNode) -> Result<(), FrameError> {
    let Some(request) = read_frame(&mut stream, MAX_FRAME_SIZE).await? else {
        return Ok(());
    };
    let handled = {
        let mut node = node.lock().unwrap_or_else(PoisonError::into_inner);
        node.handle(&request)
    };
    let frames = match handled {
        Ok(frames) => frames,
        Err(err) => {
            debug!(error = %err, "dropping connection");
            return Ok(());
        }
    };
    if frames.is_empty() {
        while read_frame(&mut stream, MAX_FRAME_SIZE).await?.is_some() {}
        return Ok(());
    }
    for frame in frames {
        let bytes = serde_json::to_vec(&frame)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_frame(&mut stream, &bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ledger_crypto::{keypair_from_seed, Ed25519NodeSigner};
    use ledger_types::{read_frame, write_frame, ReplyFrame, MAX_FRAME_SIZE};
    use serde_json::json;
    use tokio::net::TcpStream;

    use super::NodeServer;
    use crate::{ledger::DomainLedger, node::MockNode};

    #[tokio::test]
    async fn answers_one_request_per_connection() {
        let (_, verkey, did) = keypair_from_seed(*b"000000000000000000000000Trustee1");
        let node = MockNode::new(
            Ed25519NodeSigner::from_seed("Node1", [0x01; 32]),
            "127.0.0.1:0",
            DomainLedger::with_trustee(0, did.clone(), verkey),
        );
        let server = NodeServer::spawn("127.0.0.1:0", Arc::new(Mutex::new(node)))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let request = json!({"reqId": 4, "identifier": did, "operation": {"type": "3", "data": 1}});
        write_frame(&mut stream, &serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();
        let bytes = read_frame(&mut stream, MAX_FRAME_SIZE).await.unwrap().unwrap();
        let frame: ReplyFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(frame.reply["op"], "REPLY");
        assert_eq!(frame.req_id.0, 4);
        assert!(read_frame(&mut stream, MAX_FRAME_SIZE).await.unwrap().is_none());
    }
}
