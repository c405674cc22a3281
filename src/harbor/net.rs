//! Node-side harbor networking.
//!
//! One task owns the coordinator link: it forwards router requests (WHO-HAS,
//! NAME) and applies the coordinator's answers. Each connected peer gets a
//! writer task draining that node's frame channel. An accept loop takes
//! inbound peer links and pushes decoded messages into local mailboxes.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, write_frame, ControlFrame, RemoteMessage};
use crate::kernel::Kernel;
use crate::types::{Error, HarborConfig, Result, MAX_HARBOR_FRAME};

/// Bind the inbound peer listener (`listen_addr`, or an ephemeral
/// localhost port).
pub async fn bind_listener(config: &HarborConfig) -> Result<TcpListener> {
    let addr = config.listen_addr.as_deref().unwrap_or("127.0.0.1:0");
    Ok(TcpListener::bind(addr).await?)
}

async fn connect_with_timeout(addr: &str, config: &HarborConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::delivery(format!("connecting to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connect to the coordinator and introduce this node. Returns once the
/// coordinator has acknowledged, so peers can already find this node.
pub async fn connect_coordinator(kernel: &Kernel, advertise: SocketAddr) -> Result<TcpStream> {
    let config = &kernel.config().harbor;
    let addr = config
        .coordinator_addr
        .as_deref()
        .ok_or_else(|| Error::config("harbor.coordinator_addr is not set"))?;
    let mut stream = connect_with_timeout(addr, config).await?;

    let hello = ControlFrame::Hello {
        node: kernel.node(),
        addr: advertise.to_string(),
    };
    write_frame(&mut stream, &hello.encode()?).await?;

    let ack = tokio::time::timeout(
        config.connect_timeout,
        read_frame(&mut stream, MAX_HARBOR_FRAME),
    )
    .await
    .map_err(|_| Error::delivery("coordinator did not acknowledge"))??;
    match ack.map(ControlFrame::decode).transpose()? {
        Some(ControlFrame::Hello { node: 0, .. }) => {
            tracing::info!(node = kernel.node(), coordinator = %addr, "joined cluster");
            Ok(stream)
        }
        Some(other) => Err(Error::protocol(format!(
            "expected coordinator acknowledgement, got {:?}",
            other
        ))),
        None => Err(Error::delivery(format!(
            "coordinator refused node {}",
            kernel.node()
        ))),
    }
}

/// Run the node's harbor until cancelled.
pub async fn run(
    kernel: Arc<Kernel>,
    listener: TcpListener,
    coordinator: TcpStream,
    cancel: CancellationToken,
) {
    let Some(mut control_rx) = kernel.harbor().take_control_receiver() else {
        tracing::error!("harbor networking is already running");
        return;
    };

    tokio::spawn(accept_peers(
        Arc::clone(&kernel),
        listener,
        cancel.clone(),
    ));

    let (mut reader, mut writer) = coordinator.into_split();
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = control_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(error = %e, "cannot encode coordinator request");
                            continue;
                        }
                    };
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        tracing::error!(error = %e, "coordinator write failed");
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader, MAX_HARBOR_FRAME) => match frame {
                Ok(Some(body)) => match ControlFrame::decode(body) {
                    Ok(frame) => handle_control(&kernel, frame, &cancel),
                    Err(e) => tracing::warn!(error = %e, "bad frame from coordinator"),
                },
                Ok(None) => {
                    tracing::error!("coordinator closed the connection");
                    kernel.harbor().on_coordinator_lost();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "coordinator link failed");
                    kernel.harbor().on_coordinator_lost();
                    break;
                }
            },
        }
    }
}

fn handle_control(kernel: &Arc<Kernel>, frame: ControlFrame, cancel: &CancellationToken) {
    match frame {
        ControlFrame::Connect { node, addr } => {
            if node != kernel.node() && kernel.harbor().begin_connect(node) {
                tokio::spawn(connect_peer(
                    Arc::clone(kernel),
                    node,
                    addr,
                    cancel.clone(),
                ));
            }
        }
        ControlFrame::NodeDown { node } => kernel.harbor().on_node_down(node),
        ControlFrame::Name { handle, name } if !handle.is_none() => {
            kernel.deliver_named(&name, handle);
        }
        other => tracing::warn!(frame = ?other, "unexpected frame from coordinator"),
    }
}

/// Open the outbound link to `node` and drain its frame channel into it.
async fn connect_peer(kernel: Arc<Kernel>, node: u8, addr: String, cancel: CancellationToken) {
    let config = &kernel.config().harbor;
    let stream = match connect_with_timeout(&addr, config).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(node, addr = %addr, error = %e, "cannot connect to node");
            kernel.harbor().on_node_down(node);
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();

    let hello = ControlFrame::Hello {
        node: kernel.node(),
        addr: String::new(),
    };
    let sent = match hello.encode() {
        Ok(bytes) => write_frame(&mut writer, &bytes).await.map_err(Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::error!(node, error = %e, "peer handshake failed");
        kernel.harbor().on_node_down(node);
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let generation = kernel.harbor().on_connected(node, tx);

    // Peers never write on this link; a read returning means it closed.
    let mut sink = [0u8; 64];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!(node, error = %e, "peer write failed");
                    break;
                }
            }
            read = reader.read(&mut sink) => {
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
        }
    }
    kernel.harbor().on_link_closed(node, generation);
}

async fn accept_peers(kernel: Arc<Kernel>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "peer accept failed");
                        continue;
                    }
                };
                let kernel = Arc::clone(&kernel);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_peer(stream, kernel, cancel).await {
                        tracing::warn!("Peer connection from {} error: {}", peer, e);
                    }
                });
            }
        }
    }
}

/// Inbound peer link: HELLO, then message frames until EOF.
async fn handle_peer(
    mut stream: TcpStream,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(body) = read_frame(&mut stream, MAX_HARBOR_FRAME).await? else {
        return Ok(());
    };
    let node = match ControlFrame::decode(body)? {
        ControlFrame::Hello { node, .. } => node,
        other => {
            return Err(Error::protocol(format!(
                "expected HELLO on peer link, got {:?}",
                other
            )))
        }
    };
    tracing::debug!(node, "peer link accepted");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream, MAX_HARBOR_FRAME) => match frame? {
                Some(body) => match RemoteMessage::decode(body, kernel.node()) {
                    Ok(remote) => kernel.deliver_remote(remote),
                    Err(e) => {
                        tracing::warn!(node, error = %e, "bad message frame");
                        break;
                    }
                },
                None => break,
            },
        }
    }
    tracing::debug!(node, "peer link closed");
    Ok(())
}
