//! Harbor integration tests - a coordinator and two kernel nodes talking
//! over real localhost TCP.
//!
//! `KernelHandle::start` blocks on the harbor handshake, so these are plain
//! threaded tests rather than `#[tokio::test]`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff_core::harbor::{Coordinator, NodeStatus};
use skiff_core::kernel::{service_fn, Kernel};
use skiff_core::types::MAX_HARBOR_FRAME;
use skiff_core::{Config, Handle, KernelHandle, MessageType, SendFlags};

struct Cluster {
    runtime: tokio::runtime::Runtime,
    addr: String,
}

impl Cluster {
    fn new() -> Self {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let coordinator = runtime
            .block_on(Coordinator::bind("127.0.0.1:0", MAX_HARBOR_FRAME))
            .unwrap();
        let addr = coordinator.local_addr().to_string();
        runtime.spawn(coordinator.serve());
        Self { runtime, addr }
    }

    fn node(&self, id: u8) -> (Arc<Kernel>, KernelHandle) {
        let mut config = Config::default();
        config.kernel.node_id = id;
        config.kernel.workers = 2;
        config.monitor.enabled = false;
        config.harbor.coordinator_addr = Some(self.addr.clone());
        let kernel = Arc::new(Kernel::new(config).unwrap());
        let handle = KernelHandle::start(Arc::clone(&kernel)).unwrap();
        (kernel, handle)
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

type Replies = Arc<Mutex<Vec<(Handle, i32, MessageType, Vec<u8>)>>>;

fn recorder(kernel: &Kernel) -> (Handle, Replies) {
    let replies: Replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    let handle = kernel
        .spawn(
            "recorder",
            service_fn(move |_ctx, msg| {
                sink.lock()
                    .push((msg.source, msg.session, msg.kind, msg.payload().to_vec()))
            }),
            "",
        )
        .unwrap();
    (handle, replies)
}

/// Replies to every TEXT message with its payload upper-cased.
fn echo(kernel: &Kernel) -> Handle {
    kernel
        .spawn(
            "echo",
            service_fn(|ctx, msg| {
                if msg.kind == MessageType::TEXT {
                    let reply = msg.payload().to_ascii_uppercase();
                    ctx.send(msg.source, MessageType::RESPONSE, msg.session, &reply);
                }
            }),
            "",
        )
        .unwrap()
}

#[test]
fn test_request_reply_across_nodes() {
    let cluster = Cluster::new();
    let (k1, h1) = cluster.node(1);
    let (k2, h2) = cluster.node(2);

    let (client, replies) = recorder(&k1);
    let server = echo(&k2);
    assert_eq!(client.node(), 1);
    assert_eq!(server.node(), 2);

    // Queued while node 2 is still being resolved, then replayed in order.
    for session in 1..=3 {
        let sent = k1.send(
            client,
            server,
            MessageType::TEXT,
            session,
            Bytes::from(format!("msg{}", session)),
            SendFlags::NONE,
        );
        assert_eq!(sent, Some(session));
    }

    wait_until("three replies", || replies.lock().len() == 3);
    let got = replies.lock().clone();
    let expected: Vec<_> = (1..=3)
        .map(|s| (server, s, MessageType::RESPONSE, format!("MSG{}", s).into_bytes()))
        .collect();
    assert_eq!(got, expected);
    assert_eq!(k1.harbor().status(2), NodeStatus::Connected);
    assert!(k2.stats().remote_received >= 3);

    h2.shutdown();
    h1.shutdown();
}

#[test]
fn test_global_name_resolves_on_other_node() {
    let cluster = Cluster::new();
    let (k1, h1) = cluster.node(1);
    let (k2, h2) = cluster.node(2);

    let server = echo(&k2);
    assert_eq!(k2.bind_name(server, "echo").unwrap(), "echo");
    let (client, replies) = recorder(&k1);

    let sent = k1.send_name(
        client,
        "echo",
        MessageType::TEXT,
        7,
        Bytes::from_static(b"named"),
        SendFlags::NONE,
    );
    assert_eq!(sent, Some(7));

    wait_until("named reply", || !replies.lock().is_empty());
    assert_eq!(
        replies.lock()[0],
        (server, 7, MessageType::RESPONSE, b"NAMED".to_vec())
    );
    assert_eq!(k1.query_name("echo"), Some(server));

    h2.shutdown();
    h1.shutdown();
}

#[test]
fn test_unknown_remote_handle_gets_error_reply() {
    let cluster = Cluster::new();
    let (k1, h1) = cluster.node(1);
    let (k2, h2) = cluster.node(2);
    let _keepalive = echo(&k2);

    let (client, replies) = recorder(&k1);
    let ghost = Handle::new(2, 0x00ff_fff0);
    k1.send(client, ghost, MessageType::TEXT, 3, Bytes::from_static(b"?"), SendFlags::NONE)
        .unwrap();

    wait_until("error reply", || !replies.lock().is_empty());
    let (source, session, kind, _) = replies.lock()[0].clone();
    assert_eq!((source, session, kind), (ghost, 3, MessageType::ERROR));

    h2.shutdown();
    h1.shutdown();
}

#[test]
fn test_node_down_closes_route() {
    let cluster = Cluster::new();
    let (k1, h1) = cluster.node(1);
    let (k2, h2) = cluster.node(2);

    let (client, replies) = recorder(&k1);
    let server = echo(&k2);
    k1.send(client, server, MessageType::TEXT, 1, Bytes::from_static(b"up"), SendFlags::NONE)
        .unwrap();
    wait_until("first reply", || replies.lock().len() == 1);

    h2.shutdown();
    wait_until("node 2 closed", || k1.harbor().status(2) == NodeStatus::Closed);

    let sent = k1.send(client, server, MessageType::TEXT, 2, Bytes::from_static(b"down"), SendFlags::NONE);
    assert_eq!(sent, None);

    h1.shutdown();
}

#[test]
fn test_duplicate_node_id_is_refused() {
    let cluster = Cluster::new();
    let (_k1, h1) = cluster.node(1);

    let mut config = Config::default();
    config.kernel.node_id = 1;
    config.monitor.enabled = false;
    config.harbor.coordinator_addr = Some(cluster.addr.clone());
    let duplicate = Arc::new(Kernel::new(config).unwrap());
    assert!(KernelHandle::start(duplicate).is_err());

    h1.shutdown();
}
