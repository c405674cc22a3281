//! Services - the units of scheduling.
//!
//! A service is private state plus a message callback. The kernel keeps each
//! one in a [`ServiceCell`] together with its mailbox, session counter and
//! bookkeeping. The cell is reference counted: the registry slot holds one
//! reference, every in-flight `grab` holds another. When the last reference
//! goes the instance is destroyed and the mailbox is marked for deferred
//! release, so queued messages are drained by a worker instead of leaking.
//!
//! A service instance is only ever touched from inside its own callback
//! (or its `init`/`signal` hooks), never by two threads at once.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::command::Command;
use super::mailbox::Mailbox;
use super::message::{Message, MessageType, SendFlags};
use super::registry::Registered;
use super::scheduler::GlobalQueue;
use super::stats::Disposition;
use super::Kernel;
use crate::types::{Error, Handle, KernelConfig, Result};

/// Behaviour of a service.
pub trait Service: Send + 'static {
    /// Called once after the service has a handle and before its mailbox is
    /// scheduled. An error aborts the launch and retires the handle.
    fn init(&mut self, _ctx: &mut Context<'_>, _args: &str) -> Result<()> {
        Ok(())
    }

    /// Handle one message. Call [`Message::retain`] to keep the payload, or
    /// [`Context::forward`] to redirect the whole message after returning.
    fn handle(&mut self, ctx: &mut Context<'_>, msg: &mut Message);

    /// Out-of-band signal delivered by the `SIGNAL` command.
    fn signal(&mut self, ctx: &mut Context<'_>, signal: i32) {
        tracing::debug!(handle = %ctx.handle(), signal, "signal ignored");
    }
}

/// Adapter turning a closure into a [`Service`].
pub struct FnService<F>(F);

impl<F> fmt::Debug for FnService<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnService")
    }
}

impl<F> Service for FnService<F>
where
    F: FnMut(&mut Context<'_>, &mut Message) + Send + 'static,
{
    fn handle(&mut self, ctx: &mut Context<'_>, msg: &mut Message) {
        (self.0)(ctx, msg)
    }
}

/// Wrap a closure as a service.
pub fn service_fn<F>(f: F) -> Box<dyn Service>
where
    F: FnMut(&mut Context<'_>, &mut Message) + Send + 'static,
{
    Box::new(FnService(f))
}

/// Factory producing fresh service instances for a module name.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Module table consulted by `launch`.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RwLock<HashMap<String, ServiceFactory>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.factories.read().keys().cloned().collect();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: ServiceFactory) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(Error::validation(format!(
                "module already registered: {}",
                name
            )));
        }
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Service>> {
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

/// Kernel-side record of one live service.
pub struct ServiceCell {
    handle: Handle,
    module: String,
    instance: Mutex<Box<dyn Service>>,
    pub(crate) mailbox: Arc<Mailbox>,
    global: Arc<GlobalQueue>,
    session: AtomicI32,
    endless: AtomicBool,
    initialized: AtomicBool,
    trace: AtomicBool,
    message_count: AtomicU64,
    cpu_cost_us: AtomicU64,
}

impl fmt::Debug for ServiceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCell")
            .field("handle", &self.handle)
            .field("module", &self.module)
            .field("mailbox_len", &self.mailbox.len())
            .finish()
    }
}

impl Registered for ServiceCell {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl ServiceCell {
    pub(crate) fn new(
        handle: Handle,
        module: &str,
        instance: Box<dyn Service>,
        global: Arc<GlobalQueue>,
        config: &KernelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            module: module.to_string(),
            instance: Mutex::new(instance),
            mailbox: Mailbox::new(
                handle,
                config.mailbox_initial_capacity,
                config.mailbox_overload_threshold,
            ),
            global,
            session: AtomicI32::new(0),
            endless: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            trace: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            cpu_cost_us: AtomicU64::new(0),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Next positive session id, wrapping back to 1.
    pub fn new_session(&self) -> i32 {
        let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if session <= 0 {
            self.session.store(1, Ordering::Relaxed);
            return 1;
        }
        session
    }

    pub(crate) fn set_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    /// Read and clear the endless flag.
    pub(crate) fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn set_trace(&self, on: bool) {
        self.trace.store(on, Ordering::Relaxed);
    }

    pub(crate) fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub(crate) fn cpu_cost(&self) -> Duration {
        Duration::from_micros(self.cpu_cost_us.load(Ordering::Relaxed))
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }
}

impl Drop for ServiceCell {
    fn drop(&mut self) {
        tracing::debug!(handle = %self.handle, module = %self.module, "service released");
        self.mailbox.mark_release(&self.global);
    }
}

/// Snapshot of one service, as reported by [`Kernel::service_info`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub handle: Handle,
    pub module: String,
    pub names: Vec<String>,
    pub mailbox_len: usize,
    pub message_count: u64,
    pub cpu_cost_us: u64,
    pub initialized: bool,
}

/// What a service sees of the kernel while it runs.
pub struct Context<'a> {
    kernel: &'a Kernel,
    cell: &'a ServiceCell,
    forward: Option<Handle>,
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.cell.handle)
            .field("forward", &self.forward)
            .finish()
    }
}

impl<'a> Context<'a> {
    pub(crate) fn new(kernel: &'a Kernel, cell: &'a ServiceCell) -> Self {
        Self {
            kernel,
            cell,
            forward: None,
        }
    }

    pub fn handle(&self) -> Handle {
        self.cell.handle
    }

    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub fn new_session(&self) -> i32 {
        self.cell.new_session()
    }

    /// Send a copy of `data`.
    pub fn send(&self, dest: Handle, kind: MessageType, session: i32, data: &[u8]) -> Option<i32> {
        self.kernel.send(
            self.cell.handle,
            dest,
            kind,
            session,
            Bytes::copy_from_slice(data),
            SendFlags::DONT_COPY,
        )
    }

    /// Send an owned buffer, transferring it without a copy.
    pub fn send_bytes(&self, dest: Handle, kind: MessageType, session: i32, data: Bytes) -> Option<i32> {
        self.kernel
            .send(self.cell.handle, dest, kind, session, data, SendFlags::DONT_COPY)
    }

    /// Send with a freshly allocated session, returning it.
    pub fn call(&self, dest: Handle, kind: MessageType, data: &[u8]) -> Option<i32> {
        self.kernel.send(
            self.cell.handle,
            dest,
            kind,
            0,
            Bytes::copy_from_slice(data),
            SendFlags {
                dont_copy: true,
                alloc_session: true,
            },
        )
    }

    /// Send to `:hex`, `.local` or a global cluster name.
    pub fn send_name(&self, name: &str, kind: MessageType, session: i32, data: &[u8]) -> Option<i32> {
        self.kernel.send_name(
            self.cell.handle,
            name,
            kind,
            session,
            Bytes::copy_from_slice(data),
            SendFlags::DONT_COPY,
        )
    }

    /// Redirect the message being handled to `dest` once the callback
    /// returns. Source and session are preserved. Refused if the callback
    /// also retained the payload.
    pub fn forward(&mut self, dest: Handle) {
        self.forward = Some(dest);
    }

    /// Schedule a `RESPONSE` message to self after `ticks`; returns its session.
    pub fn timeout(&self, ticks: i32) -> Option<i32> {
        let session = self.cell.new_session();
        self.kernel.timeout(self.cell.handle, ticks, session)
    }

    /// Run a control command as this service.
    pub fn command(&self, cmd: Command) -> Result<Option<String>> {
        self.kernel.command(self.cell.handle, cmd)
    }

    /// Parse and run a text control command (`"REG .name"`, `"TIMEOUT 10"`, ...).
    pub fn command_str(&self, text: &str) -> Result<Option<String>> {
        let cmd: Command = text.parse()?;
        self.command(cmd)
    }

    /// Retire this service.
    pub fn exit(&self) {
        self.kernel.retire(self.cell.handle);
    }

    /// Report through the kernel's error channel, tagged with this handle.
    pub fn error(&self, text: &str) {
        self.kernel.report(self.cell.handle, text);
    }
}

impl Kernel {
    /// Invoke the owning service's callback for one message and settle the
    /// message's fate: forwarded, retained, consumed, or (after a panic)
    /// dropped.
    pub(crate) fn dispatch(&self, cell: &Arc<ServiceCell>, mut msg: Message) {
        if cell.trace.load(Ordering::Relaxed) {
            tracing::debug!(
                handle = %cell.handle,
                source = %msg.source,
                session = msg.session,
                kind = %msg.kind,
                size = msg.size(),
                "dispatch"
            );
        }

        let started = Instant::now();
        let mut service = cell.instance.lock();
        let mut ctx = Context::new(self, cell);
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| service.handle(&mut ctx, &mut msg)));
        let forward = ctx.forward.take();
        drop(service);

        cell.message_count.fetch_add(1, Ordering::Relaxed);
        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        cell.cpu_cost_us.fetch_add(elapsed, Ordering::Relaxed);

        if outcome.is_err() {
            tracing::error!(handle = %cell.handle, source = %msg.source, "service callback panicked");
            self.stats.record(Disposition::Dropped);
            return;
        }

        match forward {
            // The payload already belongs to the callback; the message
            // settles as retained and nothing reaches `dest`.
            Some(dest) if msg.is_retained() => {
                self.report(
                    cell.handle,
                    &format!("cannot forward a retained message to {}", dest),
                );
                self.stats.record(Disposition::Retained);
            }
            Some(dest) => {
                self.stats.record(Disposition::Forwarded);
                self.push_message(dest, msg);
            }
            None if msg.is_retained() => self.stats.record(Disposition::Retained),
            None => {
                self.stats.record(Disposition::Consumed);
                drop(msg.into_payload());
            }
        }
    }

    /// Run the service's `init` hook; `Ok` means the launch succeeded.
    pub(crate) fn init_service(&self, cell: &ServiceCell, args: &str) -> Result<()> {
        let mut service = cell.instance.lock();
        let mut ctx = Context::new(self, cell);
        let result =
            std::panic::catch_unwind(AssertUnwindSafe(|| service.init(&mut ctx, args)));
        match result {
            Ok(Ok(())) => {
                cell.initialized.store(true, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::internal("service init panicked")),
        }
    }

    /// Deliver a signal, waiting briefly if the service is mid-callback.
    pub(crate) fn signal_service(&self, cell: &ServiceCell, signal: i32) -> Result<()> {
        let Some(mut service) = cell.instance.try_lock_for(Duration::from_millis(100)) else {
            return Err(Error::delivery(format!(
                "service {} is busy, signal {} not delivered",
                cell.handle, signal
            )));
        };
        let mut ctx = Context::new(self, cell);
        service.signal(&mut ctx, signal);
        Ok(())
    }
}
