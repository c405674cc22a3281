//! Kernel threads.
//!
//! [`KernelHandle::start`] spawns the worker pool, the timer thread and the
//! monitor thread. A clustered node (non-zero node id) also gets a small
//! tokio runtime for harbor networking, and optionally hosts the
//! coordinator. `shutdown` stops and joins everything; it runs on drop too.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::monitor::WorkerMonitor;
use super::Kernel;
use crate::harbor::{net, Coordinator};
use crate::types::Result;

#[derive(Debug)]
pub struct KernelHandle {
    kernel: Arc<Kernel>,
    threads: Vec<JoinHandle<()>>,
    runtime: Option<tokio::runtime::Runtime>,
    cancel: CancellationToken,
}

impl KernelHandle {
    pub fn start(kernel: Arc<Kernel>) -> Result<Self> {
        let mut handle = Self {
            kernel: Arc::clone(&kernel),
            threads: Vec::new(),
            runtime: None,
            cancel: CancellationToken::new(),
        };

        if kernel.node() != 0 {
            handle.runtime = Some(handle.start_harbor()?);
        }

        let workers = kernel.config.kernel.workers;
        let monitors: Vec<Arc<WorkerMonitor>> =
            (0..workers).map(|_| Arc::new(WorkerMonitor::new())).collect();
        for (index, monitor) in monitors.iter().enumerate() {
            let kernel = Arc::clone(&kernel);
            let monitor = Arc::clone(monitor);
            handle.spawn_thread(format!("skiff-worker-{}", index), move || {
                kernel.run_worker(index, monitor)
            })?;
        }

        let timer_kernel = Arc::clone(&kernel);
        handle.spawn_thread("skiff-timer".to_string(), move || timer_kernel.run_timer())?;

        if kernel.config.monitor.enabled {
            let monitor_kernel = Arc::clone(&kernel);
            handle.spawn_thread("skiff-monitor".to_string(), move || {
                monitor_kernel.run_monitor(monitors)
            })?;
        }

        tracing::info!(node = kernel.node(), workers, "kernel started");
        Ok(handle)
    }

    fn spawn_thread(&mut self, name: String, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let thread = std::thread::Builder::new().name(name).spawn(body)?;
        self.threads.push(thread);
        Ok(())
    }

    fn start_harbor(&self) -> Result<tokio::runtime::Runtime> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("skiff-harbor")
            .enable_all()
            .build()?;
        let config = self.kernel.config.harbor.clone();

        if let Some(addr) = config.coordinator_listen.as_deref() {
            let coordinator = runtime.block_on(Coordinator::bind(addr, config.max_frame_bytes))?;
            let token = coordinator.cancel_token();
            let cancel = self.cancel.clone();
            runtime.spawn(async move {
                cancel.cancelled().await;
                token.cancel();
            });
            runtime.spawn(async move {
                if let Err(e) = coordinator.serve().await {
                    tracing::error!(error = %e, "coordinator stopped");
                }
            });
        }

        let listener = runtime.block_on(net::bind_listener(&config))?;
        let advertise = listener.local_addr()?;
        let coordinator = runtime.block_on(net::connect_coordinator(&self.kernel, advertise))?;
        runtime.spawn(net::run(
            Arc::clone(&self.kernel),
            listener,
            coordinator,
            self.cancel.clone(),
        ));
        tracing::info!(node = self.kernel.node(), listen = %advertise, "harbor started");
        Ok(runtime)
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Block until the kernel stops on its own (every service exited) or
    /// someone calls [`Kernel::shutdown`], then join everything.
    pub fn wait(mut self) {
        while !self.kernel.is_shutting_down() {
            std::thread::sleep(Duration::from_millis(50));
        }
        self.stop();
    }

    /// Stop all kernel threads and join them. Idempotent.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.kernel.shutdown();
        self.cancel.cancel();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("kernel thread panicked");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                // Blocking is not allowed inside another runtime.
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
