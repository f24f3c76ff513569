use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vm_memory::{GuestAddress, GuestMemoryMmap};

use mvirt_vqnet::{BridgeConfig, DeviceEvents, EventLoop, LoopbackFacade, VirtioNetDevice};

#[derive(Parser)]
#[command(name = "mvirt-vqnet")]
#[command(about = "mvirt virtio-net virtqueue data plane")]
struct Args {
    /// JSON file with the device geometry
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Descriptors per ring
    #[arg(long)]
    queue_size: Option<u16>,

    /// Number of transmit buffers
    #[arg(long)]
    chunk_count: Option<u16>,

    /// Size of each transmit buffer in bytes
    #[arg(long)]
    chunk_size: Option<u32>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(queue_size) = self.queue_size {
            config.queue_size = queue_size;
        }
        if let Some(chunk_count) = self.chunk_count {
            config.chunk_count = chunk_count;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_vqnet=info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.load_config()?;

    let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), config.memory_size as usize)])
        .map_err(|e| anyhow!("Failed to map shared memory: {e:?}"))?;
    let events = DeviceEvents::new().context("Failed to create eventfds")?;
    // Stand-in for the guest end until a hypervisor hands us real eventfds
    let _peer = events.peer().context("Failed to clone eventfds")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let dataplane = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("vqnet-dataplane".to_string())
            .spawn(move || -> anyhow::Result<()> {
                let mut device = VirtioNetDevice::new(&config, mem, events, LoopbackFacade::new)?;
                let mut event_loop = EventLoop::new();
                event_loop.register_device(&device)?;
                event_loop.run(&mut device, &shutdown)?;

                let facade = device.facade();
                info!(
                    relayed = facade.relayed(),
                    dropped = facade.dropped(),
                    "Data plane stopped"
                );
                Ok(())
            })
            .context("Failed to spawn data plane thread")?
    };

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    info!("mvirt-vqnet running (Ctrl+C to stop)");
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    match dataplane.join() {
        Ok(result) => result,
        Err(_) => {
            error!("Data plane thread panicked");
            Err(anyhow!("Data plane thread panicked"))
        }
    }
}
