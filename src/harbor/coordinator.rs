//! Coordinator - the cluster directory.
//!
//! Every node keeps one TCP connection to the coordinator. The coordinator
//! knows each node's peer address and every published global name; it
//! never relays messages itself.
//!
//! - A node opens with `HELLO(node, addr)`; the coordinator acknowledges
//!   with `HELLO(0)`, replays the known names, and announces the node to
//!   everyone else with `CONNECT(node, addr)`.
//! - `WHO-HAS(n)` is answered with `CONNECT(n, addr)` or `NODE-DOWN(n)`.
//! - `NAME(0, name)` is answered with the stored handle, or held until the
//!   name is published. `NAME(h, name)` publishes and fans out to every
//!   other node.
//! - When a node's connection ends, the others get `NODE-DOWN(node)`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, write_frame, ControlFrame};
use crate::types::{Error, Handle, Result};

/// Node ids are one byte and 0 is reserved.
const MAX_NODES: usize = 255;

#[derive(Debug)]
struct NodeEntry {
    addr: String,
    conn: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Debug, Default)]
struct Directory {
    nodes: HashMap<u8, NodeEntry>,
    names: HashMap<String, Handle>,
    /// Nodes waiting for a name to be published.
    waiting: HashMap<String, Vec<u8>>,
    next_conn: u64,
}

impl Directory {
    fn send_to(&self, node: u8, frame: &ControlFrame) {
        let Some(entry) = self.nodes.get(&node) else {
            return;
        };
        match frame.encode() {
            Ok(bytes) => {
                let _ = entry.tx.send(bytes);
            }
            Err(e) => tracing::error!(node, error = %e, "cannot encode control frame"),
        }
    }

    fn broadcast(&self, except: u8, frame: &ControlFrame) {
        for node in self.nodes.keys().copied().filter(|n| *n != except) {
            self.send_to(node, frame);
        }
    }

    fn handle_request(&mut self, from: u8, frame: ControlFrame) {
        match frame {
            ControlFrame::WhoHas { node } => {
                let reply = match self.nodes.get(&node) {
                    Some(entry) => ControlFrame::Connect {
                        node,
                        addr: entry.addr.clone(),
                    },
                    None => ControlFrame::NodeDown { node },
                };
                self.send_to(from, &reply);
            }
            ControlFrame::Name { handle, name } if handle.is_none() => {
                match self.names.get(&name) {
                    Some(&handle) => self.send_to(from, &ControlFrame::Name { handle, name }),
                    None => self.waiting.entry(name).or_default().push(from),
                }
            }
            ControlFrame::Name { handle, name } => {
                tracing::debug!(node = from, name = %name, handle = %handle, "name published");
                self.names.insert(name.clone(), handle);
                self.waiting.remove(&name);
                self.broadcast(from, &ControlFrame::Name { handle, name });
            }
            other => {
                tracing::warn!(node = from, frame = ?other, "unexpected control frame from node");
            }
        }
    }
}

/// Coordinator server.
#[derive(Debug)]
pub struct Coordinator {
    listener: TcpListener,
    addr: SocketAddr,
    cancel: CancellationToken,
    max_frame_bytes: usize,
    directory: Arc<Mutex<Directory>>,
}

impl Coordinator {
    /// Bind the listening socket. Port 0 picks a free port; see
    /// [`Coordinator::local_addr`].
    pub async fn bind(addr: &str, max_frame_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            cancel: CancellationToken::new(),
            max_frame_bytes,
            directory: Arc::new(Mutex::new(Directory::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Token that stops [`Coordinator::serve`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the accept loop until cancelled.
    pub async fn serve(self) -> Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(MAX_NODES));
        tracing::info!("harbor coordinator listening on {}", self.addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("harbor coordinator shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, peer) = accept?;
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!("Connection from {} rejected: all {} node ids in use", peer, MAX_NODES);
                            drop(stream);
                            continue;
                        }
                    };
                    let directory = Arc::clone(&self.directory);
                    let cancel = self.cancel.clone();
                    let max_frame_bytes = self.max_frame_bytes;
                    tokio::spawn(async move {
                        if let Err(e) = handle_node(stream, directory, cancel, max_frame_bytes, permit).await {
                            tracing::warn!("Node connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Serve one node connection from HELLO to disconnect.
async fn handle_node(
    stream: TcpStream,
    directory: Arc<Mutex<Directory>>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let Some(body) = read_frame(&mut reader, max_frame_bytes).await? else {
        return Ok(());
    };
    let (node, addr) = match ControlFrame::decode(body)? {
        ControlFrame::Hello { node, addr } if node != 0 => (node, addr),
        other => {
            return Err(Error::protocol(format!(
                "expected HELLO from a non-zero node, got {:?}",
                other
            )))
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let conn = {
        let mut dir = directory.lock();
        if dir.nodes.contains_key(&node) {
            return Err(Error::protocol(format!("node {} is already connected", node)));
        }
        dir.next_conn += 1;
        let conn = dir.next_conn;
        let _ = tx.send(ControlFrame::Hello { node: 0, addr: String::new() }.encode()?);
        for (name, handle) in &dir.names {
            let frame = ControlFrame::Name {
                handle: *handle,
                name: name.clone(),
            };
            let _ = tx.send(frame.encode()?);
        }
        dir.broadcast(
            node,
            &ControlFrame::Connect {
                node,
                addr: addr.clone(),
            },
        );
        dir.nodes.insert(
            node,
            NodeEntry {
                addr: addr.clone(),
                conn,
                tx,
            },
        );
        conn
    };
    tracing::info!(node, addr = %addr, "node joined");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!(node, error = %e, "coordinator write failed");
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = read_frame(&mut reader, max_frame_bytes) => match frame {
                Ok(Some(body)) => match ControlFrame::decode(body) {
                    Ok(frame) => directory.lock().handle_request(node, frame),
                    Err(e) => tracing::warn!(node, error = %e, "bad control frame"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::from(e)),
            },
        }
    };

    {
        let mut dir = directory.lock();
        if dir.nodes.get(&node).is_some_and(|entry| entry.conn == conn) {
            dir.nodes.remove(&node);
            for waiters in dir.waiting.values_mut() {
                waiters.retain(|n| *n != node);
            }
            dir.broadcast(node, &ControlFrame::NodeDown { node });
        }
    }
    writer_task.abort();
    tracing::info!(node, "node left");
    result
}
