//! Skiff node launcher - main entry point.
//!
//! Loads configuration, starts the kernel, launches the bootstrap services
//! and runs until every service has exited or the process is interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use skiff_core::kernel::Kernel;
use skiff_core::{Config, KernelHandle};

#[derive(Debug, Parser)]
#[command(name = "skiff-node", version, about = "Run a skiff service kernel node")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "SKIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster node id (0 = standalone).
    #[arg(long)]
    node: Option<u8>,

    /// Worker thread count.
    #[arg(long)]
    workers: Option<usize>,

    /// Coordinator address to join.
    #[arg(long)]
    coordinator: Option<String>,

    /// Host the coordinator in this process, bound to this address.
    #[arg(long)]
    serve_coordinator: Option<String>,

    /// Address peers connect to for delivering messages to this node.
    #[arg(long)]
    listen: Option<String>,

    /// Service to launch at startup, as "module args". Repeatable.
    #[arg(long = "launch", value_name = "MODULE [ARGS]", default_value = "logger")]
    launch: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<(Config, Vec<String>), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(node) = self.node {
            config.kernel.node_id = node;
        }
        if let Some(workers) = self.workers {
            config.kernel.workers = workers;
        }
        if let Some(addr) = self.serve_coordinator {
            if config.harbor.coordinator_addr.is_none() {
                config.harbor.coordinator_addr = Some(addr.clone());
            }
            config.harbor.coordinator_listen = Some(addr);
        }
        if let Some(addr) = self.coordinator {
            config.harbor.coordinator_addr = Some(addr);
        }
        if let Some(addr) = self.listen {
            config.harbor.listen_addr = Some(addr);
        }
        config.validate()?;
        Ok((config, self.launch))
    }
}

/// Stop the kernel on Ctrl-C. Runs on its own thread so the kernel's own
/// runtime is never shut down from inside another one.
fn watch_ctrl_c(kernel: Arc<Kernel>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("skiff-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted");
                    kernel.shutdown();
                }
            });
        })?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, launch) = Args::parse().into_config()?;

    // Initialize observability
    skiff_core::observability::init_tracing_with(&config.observability);

    let kernel = Arc::new(Kernel::new(config)?);
    let handle = KernelHandle::start(Arc::clone(&kernel))?;
    watch_ctrl_c(Arc::clone(&kernel))?;

    for entry in &launch {
        let (module, args) = entry.split_once(' ').unwrap_or((entry.as_str(), ""));
        match kernel.launch(module, args) {
            Some(service) => tracing::info!(handle = %service, module, "bootstrap service started"),
            None => {
                tracing::error!(module, args, "bootstrap service failed");
                handle.shutdown();
                return Err(format!("cannot launch {}", entry).into());
            }
        }
    }

    handle.wait();
    tracing::info!(stats = ?kernel.stats(), "kernel stopped");
    Ok(())
}
