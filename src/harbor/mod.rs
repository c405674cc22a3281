//! Harbor - cross-node message routing.
//!
//! Each remote node is tracked by a small state machine:
//!
//! ```text
//!  (absent) --send--> Resolving --connected--> Connected
//!                        |                         |
//!                        +-------down/error--------+--> Closed
//! ```
//!
//! The router itself never touches a socket. Requests for the coordinator go
//! out through a control channel; outbound frames for a connected node go
//! into that node's link channel, drained by a writer task (see [`net`]).
//! This keeps `send` non-blocking on whatever thread calls it.
//!
//! Global (cluster-wide) names are cached locally. Messages addressed to a
//! name that is not yet known are parked until the coordinator answers.

pub mod codec;
pub mod coordinator;
pub mod net;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;

use crate::kernel::Message;
use crate::types::{Handle, MAX_HARBOR_FRAME};

pub use codec::{ControlFrame, RemoteMessage};
pub use coordinator::Coordinator;

/// Observable per-node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Resolving,
    Connected,
    Closed,
}

#[derive(Debug)]
enum NodeState {
    /// Frames wait here, in send order, until the link is up.
    Resolving { pending: VecDeque<Bytes> },
    Connected {
        link: mpsc::UnboundedSender<Bytes>,
        generation: u64,
    },
    Closed,
}

/// What happened to a message handed to [`Harbor::send`].
#[derive(Debug)]
pub enum Routed {
    /// Written to the node's link.
    Sent,
    /// Parked until the node is resolved.
    Queued,
    /// Addressed to this node after all; deliver it locally.
    Local(Message),
    /// Not deliverable; already reported.
    Dropped,
}

/// What happened to a message handed to [`Harbor::send_name`].
#[derive(Debug)]
pub enum NameRoute {
    /// The name is known; deliver to this handle.
    Resolved(Handle, Message),
    /// Parked until the coordinator answers.
    Queued,
    Dropped,
}

#[derive(Debug, Default)]
struct HarborState {
    nodes: HashMap<u8, NodeState>,
    names: HashMap<String, Handle>,
    pending_names: HashMap<String, Vec<Message>>,
    /// Nodes with a connection attempt in flight.
    connecting: HashSet<u8>,
    next_generation: u64,
}

/// Router for messages whose destination lives on another node.
#[derive(Debug)]
pub struct Harbor {
    local: u8,
    max_frame_bytes: usize,
    control: mpsc::UnboundedSender<ControlFrame>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlFrame>>>,
    state: Mutex<HarborState>,
}

impl Harbor {
    /// Router for `local`. Node 0 means standalone: every remote send fails.
    pub fn new(local: u8, max_frame_bytes: usize) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        Self {
            local,
            max_frame_bytes: max_frame_bytes.min(MAX_HARBOR_FRAME),
            control,
            control_rx: Mutex::new(Some(control_rx)),
            state: Mutex::new(HarborState::default()),
        }
    }

    pub fn local_node(&self) -> u8 {
        self.local
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Take the receiving end of the coordinator request channel. The
    /// coordinator link task calls this once.
    pub fn take_control_receiver(&self) -> Option<mpsc::UnboundedReceiver<ControlFrame>> {
        self.control_rx.lock().take()
    }

    /// Whether `handle` must be routed through the harbor.
    pub fn is_remote(&self, handle: Handle) -> bool {
        let node = handle.node();
        node != 0 && node != self.local
    }

    pub fn status(&self, node: u8) -> NodeStatus {
        match self.state.lock().nodes.get(&node) {
            None => NodeStatus::Unknown,
            Some(NodeState::Resolving { .. }) => NodeStatus::Resolving,
            Some(NodeState::Connected { .. }) => NodeStatus::Connected,
            Some(NodeState::Closed) => NodeStatus::Closed,
        }
    }

    /// Route `msg` to `dest` on another node.
    pub fn send(&self, dest: Handle, msg: Message) -> Routed {
        let node = dest.node();
        if node == self.local || node == 0 {
            tracing::warn!(destination = %dest, "local handle reached the harbor, delivering locally");
            return Routed::Local(msg);
        }
        if self.local == 0 {
            tracing::error!(destination = %dest, "harbor is disabled on a standalone node");
            return Routed::Dropped;
        }

        let remote = RemoteMessage {
            source: msg.source,
            destination: dest,
            session: msg.session,
            kind: msg.kind,
            payload: msg.into_payload(),
        };
        let frame = match remote.encode(self.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(source = %remote.source, destination = %dest, error = %e, "remote message dropped");
                return Routed::Dropped;
            }
        };

        let mut state = self.state.lock();
        match state.nodes.get_mut(&node) {
            Some(NodeState::Resolving { pending }) => {
                pending.push_back(frame);
                return Routed::Queued;
            }
            Some(NodeState::Connected { link, .. }) => {
                if link.send(frame).is_ok() {
                    return Routed::Sent;
                }
                tracing::error!(node, destination = %dest, "link to node is closed");
            }
            Some(NodeState::Closed) => {
                tracing::error!(node, destination = %dest, "node is down, message dropped");
                return Routed::Dropped;
            }
            None => {
                if self.control.send(ControlFrame::WhoHas { node }).is_ok() {
                    tracing::debug!(node, "resolving node");
                    state.nodes.insert(
                        node,
                        NodeState::Resolving {
                            pending: VecDeque::from([frame]),
                        },
                    );
                    return Routed::Queued;
                }
                tracing::error!(node, "coordinator link is gone, cannot resolve node");
            }
        }
        state.nodes.insert(node, NodeState::Closed);
        Routed::Dropped
    }

    /// Claim the right to connect to `node` after the coordinator announced
    /// its address. Only nodes that are resolving (or closed, and may have
    /// come back) are worth connecting to, and only one attempt at a time.
    pub fn begin_connect(&self, node: u8) -> bool {
        let mut state = self.state.lock();
        let wanted = matches!(
            state.nodes.get(&node),
            Some(NodeState::Resolving { .. }) | Some(NodeState::Closed)
        );
        wanted && state.connecting.insert(node)
    }

    /// Install a live link to `node`, replaying parked frames in order.
    /// Returns the link generation to pass to [`Harbor::on_link_closed`].
    pub fn on_connected(&self, node: u8, link: mpsc::UnboundedSender<Bytes>) -> u64 {
        let mut state = self.state.lock();
        state.connecting.remove(&node);
        state.next_generation += 1;
        let generation = state.next_generation;
        let pending = match state.nodes.remove(&node) {
            Some(NodeState::Resolving { pending }) => pending,
            _ => VecDeque::new(),
        };
        let replayed = pending.len();
        for frame in pending {
            if link.send(frame).is_err() {
                tracing::error!(node, "link closed while replaying");
                state.nodes.insert(node, NodeState::Closed);
                return generation;
            }
        }
        state
            .nodes
            .insert(node, NodeState::Connected { link, generation });
        tracing::info!(node, replayed, "node connected");
        generation
    }

    /// A link's writer or reader stopped. Ignored if a newer link replaced it.
    pub fn on_link_closed(&self, node: u8, generation: u64) {
        let mut state = self.state.lock();
        let current = matches!(
            state.nodes.get(&node),
            Some(NodeState::Connected { generation: g, .. }) if *g == generation
        );
        if current {
            state.nodes.insert(node, NodeState::Closed);
            tracing::warn!(node, "link to node closed");
        }
    }

    /// The node is unreachable: fail everything waiting on it.
    pub fn on_node_down(&self, node: u8) {
        let mut state = self.state.lock();
        state.connecting.remove(&node);
        if let Some(NodeState::Resolving { pending }) = state.nodes.get(&node) {
            if !pending.is_empty() {
                tracing::error!(node, dropped = pending.len(), "node is down, dropping queued messages");
            }
        }
        state.nodes.insert(node, NodeState::Closed);
    }

    /// The coordinator link is gone: nothing still resolving can complete.
    pub fn on_coordinator_lost(&self) {
        let mut state = self.state.lock();
        for (node, entry) in state.nodes.iter_mut() {
            if let NodeState::Resolving { pending } = entry {
                tracing::error!(node = *node, dropped = pending.len(), "coordinator lost while resolving node");
                *entry = NodeState::Closed;
            }
        }
        let parked: usize = state.pending_names.values().map(Vec::len).sum();
        if parked > 0 {
            tracing::error!(dropped = parked, "coordinator lost, dropping messages parked on names");
        }
        state.pending_names.clear();
    }

    pub fn global_name(&self, name: &str) -> Option<Handle> {
        self.state.lock().names.get(name).copied()
    }

    /// Publish `name` cluster-wide.
    pub fn register_name(&self, name: &str, handle: Handle) -> bool {
        self.state.lock().names.insert(name.to_string(), handle);
        if self.local == 0 {
            return true;
        }
        self.control
            .send(ControlFrame::Name {
                handle,
                name: name.to_string(),
            })
            .is_ok()
    }

    /// Route `msg` to a global name, parking it if the name is unknown.
    pub fn send_name(&self, name: &str, msg: Message) -> NameRoute {
        let mut state = self.state.lock();
        if let Some(handle) = state.names.get(name) {
            return NameRoute::Resolved(*handle, msg);
        }
        if self.local == 0 {
            tracing::error!(name, "unknown global name on a standalone node");
            return NameRoute::Dropped;
        }
        match state.pending_names.get_mut(name) {
            Some(parked) => parked.push(msg),
            None => {
                let query = ControlFrame::Name {
                    handle: Handle::NONE,
                    name: name.to_string(),
                };
                if self.control.send(query).is_err() {
                    tracing::error!(name, "coordinator link is gone, cannot resolve name");
                    return NameRoute::Dropped;
                }
                state.pending_names.insert(name.to_string(), vec![msg]);
            }
        }
        NameRoute::Queued
    }

    /// Record a name update; returns the messages parked on it.
    pub fn on_name(&self, name: &str, handle: Handle) -> Vec<Message> {
        let mut state = self.state.lock();
        state.names.insert(name.to_string(), handle);
        state.pending_names.remove(name).unwrap_or_default()
    }
}
