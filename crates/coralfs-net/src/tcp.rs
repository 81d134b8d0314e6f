//! Tokio TCP transport implementation

use crate::frame;
use coralfs_common::{EntityName, Error, Inst, Result};
use coralfs_msg::{Envelope, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Everything the transport delivers to the node.
#[derive(Debug)]
pub enum NetEvent {
    /// An inbound envelope
    Inbound(Envelope),
    /// A queued send could not be delivered
    Failure { peer: Inst },
    /// A peer connection closed cleanly
    Reset { addr: SocketAddr },
    /// A peer connection was torn down from the remote side
    RemoteReset { addr: SocketAddr },
}

type Sink = Arc<dyn Fn(NetEvent) + Send + Sync>;

/// TCP messenger: framed envelopes in both directions, one writer task per
/// outbound peer.
pub struct TcpTransport {
    local: SocketAddr,
    nonce: u64,
    name: Mutex<EntityName>,
    conns: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
    sink: Sink,
    runtime: tokio::runtime::Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    down: AtomicBool,
}

impl TcpTransport {
    /// Bind a listener and start accepting. Must be called from within a
    /// tokio runtime.
    pub async fn bind(
        listen: SocketAddr,
        nonce: u64,
        sink: impl Fn(NetEvent) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| Error::transport(format!("bind {listen}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::transport(e.to_string()))?;

        let transport = Arc::new(Self {
            local,
            nonce,
            name: Mutex::new(EntityName::Mds(None)),
            conns: Mutex::new(HashMap::new()),
            sink: Arc::new(sink),
            runtime: tokio::runtime::Handle::current(),
            tasks: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
        });

        let accept = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let sink = Arc::clone(&t.sink);
                            let reader = tokio::spawn(read_loop(stream, peer, sink));
                            t.tasks.lock().push(reader);
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                            break;
                        }
                    }
                }
            })
        };
        transport.tasks.lock().push(accept);

        Ok(transport)
    }

    fn queue(&self, env: &Envelope, to: &Inst) {
        if self.down.load(Ordering::SeqCst) {
            trace!("transport down, dropping {}", env.msg.type_name());
            return;
        }
        let buf = match frame::encode(env) {
            Ok(b) => b,
            Err(e) => {
                warn!("dropping undeliverable {}: {e}", env.msg.type_name());
                return;
            }
        };

        let mut conns = self.conns.lock();
        let tx = conns.entry(to.addr).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let peer = *to;
            let sink = Arc::clone(&self.sink);
            let handle = self.runtime.spawn(write_loop(peer, rx, sink));
            self.tasks.lock().push(handle);
            tx
        });
        if tx.send(buf).is_err() {
            // writer already died; retry through a fresh connection next send
            conns.remove(&to.addr);
            (self.sink)(NetEvent::Failure { peer: *to });
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, env: Envelope, to: &Inst) {
        trace!(msg = env.msg.type_name(), %to, "send");
        self.queue(&env, to);
    }

    fn forward(&self, env: Envelope, to: &Inst) {
        trace!(msg = env.msg.type_name(), from = %env.from, %to, "forward");
        self.queue(&env, to);
    }

    fn reset_local_name(&self, name: EntityName) {
        *self.name.lock() = name;
    }

    fn local_inst(&self) -> Inst {
        Inst::new(self.local, self.nonce)
    }

    fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conns.lock().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(
    peer: Inst,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: Sink,
) {
    let mut stream = match TcpStream::connect(peer.addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, "connect failed: {e}");
            sink(NetEvent::Failure { peer });
            return;
        }
    };
    while let Some(buf) = rx.recv().await {
        if let Err(e) = stream.write_all(&buf).await {
            warn!(%peer, "write failed: {e}");
            sink(NetEvent::Failure { peer });
            return;
        }
    }
}

async fn read_loop(mut stream: TcpStream, peer: SocketAddr, sink: Sink) {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                sink(NetEvent::Reset { addr: peer });
                return;
            }
            Err(_) => {
                sink(NetEvent::RemoteReset { addr: peer });
                return;
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > frame::MAX_FRAME {
            warn!(%peer, len, "oversized frame, dropping connection");
            sink(NetEvent::RemoteReset { addr: peer });
            return;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            sink(NetEvent::RemoteReset { addr: peer });
            return;
        }
        match frame::decode(&body) {
            Ok(env) => sink(NetEvent::Inbound(env)),
            Err(e) => warn!(%peer, "undecodable frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coralfs_msg::Message;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loopback_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), 1, move |ev| {
            let _ = tx.send(ev);
        })
        .await
        .unwrap();
        let b = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), 2, |_| {})
            .await
            .unwrap();

        let env = Envelope::new(
            EntityName::Mds(None),
            b.local_inst(),
            Message::MonCommand {
                cmd: "beacon_grace_ms=1000".into(),
            },
        );
        b.send(env.clone(), &a.local_inst());

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("sink closed");
        match got {
            NetEvent::Inbound(e) => assert_eq!(e, env),
            other => panic!("unexpected event: {other:?}"),
        }

        a.shutdown();
        b.shutdown();
        b.shutdown(); // idempotent
    }
}
