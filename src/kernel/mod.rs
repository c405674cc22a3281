//! Kernel - registry, scheduler, timers and routing for services.
//!
//! The [`Kernel`] owns every piece of shared runtime state: the handle
//! registry, the global ready queue, the timer wheel, the harbor router,
//! the module table, the environment and the message counters. It is an
//! explicit value, shared as `Arc<Kernel>` by worker threads and services;
//! there are no process-wide singletons. [`KernelHandle`] runs it.

pub mod command;
pub mod env;
pub mod logger;
pub mod mailbox;
pub mod message;
pub mod monitor;
pub mod registry;
pub(crate) mod ring;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod timer;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::harbor::{Harbor, NameRoute, RemoteMessage, Routed};
use crate::types::{Config, Error, Handle, Result};

pub use command::{Command, StatKey, Target};
pub use message::{Message, MessageType, SendFlags, MESSAGE_SIZE_MAX};
pub use monitor::{StuckDispatch, WorkerMonitor};
pub use registry::HandleRegistry;
pub use runtime::KernelHandle;
pub use service::{service_fn, Context, ModuleRegistry, Service, ServiceFactory, ServiceInfo};
pub use stats::{Disposition, StatsSnapshot};

use env::Env;
use scheduler::GlobalQueue;
use service::ServiceCell;
use stats::KernelStats;
use timer::TimerService;

#[derive(Debug)]
pub struct Kernel {
    pub(crate) config: Config,
    pub(crate) registry: HandleRegistry<ServiceCell>,
    pub(crate) global: Arc<GlobalQueue>,
    pub(crate) timer: TimerService,
    pub(crate) harbor: Harbor,
    pub(crate) stats: KernelStats,
    modules: ModuleRegistry,
    env: Env,
    exit_watcher: AtomicU32,
    shutdown: AtomicBool,
    ever_launched: AtomicBool,
}

impl Kernel {
    /// Build a kernel from a validated configuration. Nothing runs until
    /// it is handed to [`KernelHandle::start`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let node = config.kernel.node_id;
        let kernel = Self {
            registry: HandleRegistry::new(node, config.kernel.registry_initial_slots),
            global: Arc::new(GlobalQueue::new(config.kernel.global_queue_initial_capacity)),
            timer: TimerService::new(config.timer.tick),
            harbor: Harbor::new(node, config.harbor.max_frame_bytes),
            stats: KernelStats::default(),
            modules: ModuleRegistry::new(),
            env: Env::new(config.env.clone()),
            exit_watcher: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            ever_launched: AtomicBool::new(false),
            config,
        };
        kernel.register_module("logger", || Box::new(logger::Logger::default()))?;
        Ok(kernel)
    }

    /// Build and start a kernel in one step.
    pub fn start(config: Config) -> Result<KernelHandle> {
        KernelHandle::start(Arc::new(Self::new(config)?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node(&self) -> u8 {
        self.registry.node()
    }

    pub fn harbor(&self) -> &Harbor {
        &self.harbor
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a module factory under `name`.
    pub fn register_module<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.modules.register(name, Arc::new(factory))
    }

    /// Give a node-less handle this node's id.
    fn localize(&self, handle: Handle) -> Handle {
        if handle.node() == 0 {
            handle.with_node(self.node())
        } else {
            handle
        }
    }

    // ---- lifecycle ----

    /// Instantiate `module` and start it with `args`.
    pub fn launch(&self, module: &str, args: &str) -> Option<Handle> {
        let Some(instance) = self.modules.create(module) else {
            tracing::error!(module, "module not found");
            return None;
        };
        self.spawn(module, instance, args)
    }

    /// Register an already-built service instance, run its `init`, and link
    /// its mailbox. Messages sent to the new handle during `init` are kept.
    /// A failed `init` retires the handle and returns `None`.
    pub fn spawn(&self, module: &str, instance: Box<dyn Service>, args: &str) -> Option<Handle> {
        let registered = self.registry.register(|handle| {
            ServiceCell::new(
                handle,
                module,
                instance,
                Arc::clone(&self.global),
                &self.config.kernel,
            )
        });
        let (handle, cell) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                tracing::error!(module, error = %e, "cannot register service");
                return None;
            }
        };
        self.ever_launched.store(true, Ordering::Relaxed);

        match self.init_service(&cell, args) {
            Ok(()) => {
                self.global.enqueue(Arc::clone(&cell.mailbox));
                tracing::info!(handle = %handle, module, args, "LAUNCH");
                Some(handle)
            }
            Err(e) => {
                tracing::error!(handle = %handle, module, args, error = %e, "FAILED launch");
                drop(self.registry.retire(handle));
                for msg in cell.mailbox.close() {
                    self.drop_message(handle, msg);
                }
                None
            }
        }
    }

    /// Retire `handle`, notifying the exit watcher. Returns `false` if no
    /// such service is live.
    pub fn retire(&self, handle: Handle) -> bool {
        let handle = self.localize(handle);
        let Some(cell) = self.registry.retire(handle) else {
            return false;
        };
        tracing::info!(handle = %handle, module = cell.module(), "service retired");
        drop(cell);

        let watcher = Handle::from_raw(self.exit_watcher.load(Ordering::Relaxed));
        if watcher == handle {
            self.exit_watcher.store(0, Ordering::Relaxed);
        } else if !watcher.is_none() {
            self.push_message(watcher, Message::empty(handle, 0, MessageType::SYSTEM));
        }
        true
    }

    /// Retire every service and forget every local name.
    pub fn abort(&self) {
        let retired = self.registry.retire_all();
        tracing::warn!(count = retired.len(), "ABORT: all services retired");
        self.exit_watcher.store(0, Ordering::Relaxed);
        drop(retired);
    }

    pub fn exit_watcher(&self) -> Option<Handle> {
        let watcher = Handle::from_raw(self.exit_watcher.load(Ordering::Relaxed));
        (!watcher.is_none()).then_some(watcher)
    }

    /// Make `handle` receive a `SYSTEM` message whenever another service is
    /// retired.
    pub fn set_exit_watcher(&self, handle: Handle) {
        self.exit_watcher
            .store(self.localize(handle).raw(), Ordering::Relaxed);
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.registry.grab(self.localize(handle)).is_some()
    }

    pub fn service_count(&self) -> usize {
        self.registry.len()
    }

    pub fn services(&self) -> Vec<Handle> {
        self.registry.handles()
    }

    pub fn service_info(&self, handle: Handle) -> Option<ServiceInfo> {
        let handle = self.localize(handle);
        let cell = self.registry.grab(handle)?;
        Some(ServiceInfo {
            handle,
            module: cell.module().to_string(),
            names: self.registry.names_of(handle),
            mailbox_len: cell.mailbox.len(),
            message_count: cell.message_count(),
            cpu_cost_us: u64::try_from(cell.cpu_cost().as_micros()).unwrap_or(u64::MAX),
            initialized: cell.is_initialized(),
        })
    }

    pub fn mark_endless(&self, handle: Handle) {
        if let Some(cell) = self.registry.grab(handle) {
            cell.set_endless();
        }
    }

    /// Allocate a session on behalf of `handle`.
    pub fn new_session(&self, handle: Handle) -> Option<i32> {
        self.registry
            .grab(self.localize(handle))
            .map(|cell| cell.new_session())
    }

    pub(crate) fn all_services_exited(&self) -> bool {
        self.ever_launched.load(Ordering::Relaxed) && self.registry.is_empty()
    }

    /// Ask every kernel thread to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::info!("kernel stopping");
            self.global.wake_all();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Dispatch on the calling thread until no mailbox is ready. Returns the
    /// number of scheduling steps taken.
    pub fn run_until_idle(&self) -> usize {
        let monitor = WorkerMonitor::new();
        let mut steps = 0;
        while self.dispatch_next(&monitor, -1) {
            steps += 1;
        }
        steps
    }

    // ---- naming ----

    /// Resolve `:hex`, `.local` or a cluster-wide name.
    pub fn query_name(&self, name: &str) -> Option<Handle> {
        if let Some(hex) = name.strip_prefix(':') {
            return u32::from_str_radix(hex, 16).ok().map(Handle::from_raw);
        }
        if let Some(local) = name.strip_prefix('.') {
            return self.registry.find_by_name(local);
        }
        self.harbor.global_name(name)
    }

    /// Bind `.local` or publish a cluster-wide name for `handle`.
    pub fn bind_name(&self, handle: Handle, name: &str) -> Result<String> {
        let handle = self.localize(handle);
        if let Some(local) = name.strip_prefix('.') {
            if local.is_empty() {
                return Err(Error::validation("empty name"));
            }
            return self
                .registry
                .bind_name(handle, local)
                .map(|bound| format!(".{}", bound))
                .ok_or_else(|| Error::validation(format!("name already bound: {}", name)));
        }
        if name.is_empty() || name.starts_with(':') {
            return Err(Error::validation(format!("invalid name: {:?}", name)));
        }
        if !self.harbor.register_name(name, handle) {
            return Err(Error::delivery(format!(
                "cannot publish {}: coordinator link is gone",
                name
            )));
        }
        Ok(name.to_string())
    }

    // ---- messaging ----

    fn prepare(
        &self,
        source: Handle,
        kind: MessageType,
        session: i32,
        payload: Bytes,
        flags: SendFlags,
    ) -> Option<Message> {
        let session = if flags.alloc_session {
            match self.new_session(source) {
                Some(session) => session,
                None => {
                    tracing::error!(source = %source, "cannot allocate a session for a null or retired source");
                    self.stats.record_undeliverable();
                    return None;
                }
            }
        } else {
            session
        };
        if payload.len() > MESSAGE_SIZE_MAX {
            tracing::error!(source = %source, size = payload.len(), "message too large");
            return None;
        }
        let payload = if flags.dont_copy {
            payload
        } else {
            Bytes::copy_from_slice(&payload)
        };
        Some(Message::new(source, session, kind, payload))
    }

    /// Send `payload` from `source` to `dest`. Returns the session used, or
    /// `None` if the message could not be delivered (the payload is freed).
    pub fn send(
        &self,
        source: Handle,
        dest: Handle,
        kind: MessageType,
        session: i32,
        payload: Bytes,
        flags: SendFlags,
    ) -> Option<i32> {
        if dest.is_none() {
            tracing::error!(source = %source, "destination address can't be 0");
            return None;
        }
        let msg = self.prepare(source, kind, session, payload, flags)?;
        let session = msg.session;
        self.push_message(dest, msg).then_some(session)
    }

    /// Send to a name (`:hex`, `.local`, or cluster-wide).
    pub fn send_name(
        &self,
        source: Handle,
        name: &str,
        kind: MessageType,
        session: i32,
        payload: Bytes,
        flags: SendFlags,
    ) -> Option<i32> {
        if name.starts_with(':') || name.starts_with('.') {
            let Some(dest) = self.query_name(name) else {
                tracing::error!(source = %source, name, "drop message to unknown name");
                return None;
            };
            return self.send(source, dest, kind, session, payload, flags);
        }
        let msg = self.prepare(source, kind, session, payload, flags)?;
        let session = msg.session;
        match self.harbor.send_name(name, msg) {
            NameRoute::Resolved(dest, msg) => self.push_message(dest, msg).then_some(session),
            NameRoute::Queued => Some(session),
            NameRoute::Dropped => None,
        }
    }

    /// Route a prepared message, locally or through the harbor.
    pub fn push_message(&self, dest: Handle, msg: Message) -> bool {
        if !self.harbor.is_remote(dest) {
            return self.push_local(dest, msg);
        }
        match self.harbor.send(dest, msg) {
            Routed::Sent | Routed::Queued => {
                self.stats.record_remote_sent();
                true
            }
            Routed::Local(msg) => self.push_local(dest, msg),
            Routed::Dropped => {
                self.stats.record_undeliverable();
                false
            }
        }
    }

    /// Push into a local mailbox, looking the service up fresh.
    pub(crate) fn push_local(&self, dest: Handle, msg: Message) -> bool {
        let dest = self.localize(dest);
        let Some(cell) = self.registry.grab(dest) else {
            tracing::debug!(destination = %dest, source = %msg.source, "drop message to a retired service");
            self.stats.record_undeliverable();
            return false;
        };
        match cell.mailbox.push(msg, &self.global) {
            Ok(()) => {
                self.stats.record_enqueued();
                true
            }
            Err(msg) => {
                tracing::debug!(destination = %dest, source = %msg.source, "mailbox already drained");
                self.stats.record_undeliverable();
                false
            }
        }
    }

    /// Free an undeliverable message and tell its sender.
    pub(crate) fn drop_message(&self, handle: Handle, msg: Message) {
        self.stats.record(Disposition::Dropped);
        let (source, session, kind) = (msg.source, msg.session, msg.kind);
        drop(msg);
        if !source.is_none() && kind != MessageType::ERROR {
            self.push_message(source, Message::empty(handle, session, MessageType::ERROR));
        }
    }

    /// Deliver a message received from another node.
    pub fn deliver_remote(&self, remote: RemoteMessage) {
        self.stats.record_remote_received();
        let RemoteMessage {
            source,
            destination,
            session,
            kind,
            payload,
        } = remote;
        let msg = Message::new(source, session, kind, payload);
        if !self.push_local(destination, msg) {
            tracing::warn!(source = %source, destination = %destination, kind = %kind, "unknown destination for remote message");
            if !source.is_none() && kind != MessageType::ERROR {
                self.push_message(source, Message::empty(destination, session, MessageType::ERROR));
            }
        }
    }

    /// A cluster-wide name resolved: record it and release parked messages.
    pub fn deliver_named(&self, name: &str, handle: Handle) {
        for msg in self.harbor.on_name(name, handle) {
            self.push_message(handle, msg);
        }
    }

    /// Report through the kernel's error channel.
    pub fn report(&self, handle: Handle, text: &str) {
        tracing::error!(handle = %handle, "{}", text);
    }
}
