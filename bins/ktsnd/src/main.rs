//! `ktsnd`: the deadline-scheduled kernel-bypass transmit daemon.
//!
//! Carves the shared-memory arena, publishes its layout for the shim to
//! attach to, then runs the scheduling loop until SIGINT/SIGTERM.
//!
//! The NIC driver itself is out of scope (§1 of the spec this daemon
//! implements): `ktsn_nic::NullNic` stands in for a real kernel-bypass
//! driver, recording frames instead of transmitting them. Wiring in a real
//! `NicDriver` for a specific NIC is a deployment concern, not this crate's.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use ktsn_config::SenderConfig;
use ktsn_core::ShmLayout;
use ktsn_fabric::Arena;
use ktsn_mmap::SharedMemory;
use ktsn_nic::NullNic;
use ktsn_sender::SenderLoop;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ktsnd", version, about = "Deadline-scheduled kernel-bypass transmit daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/ktsn/ktsnd.toml")]
    config: String,

    /// NIC port id to transmit on.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// NIC tx queue id to transmit on.
    #[arg(long, default_value_t = 0)]
    queue: u16,

    /// Raise the tracing filter to debug regardless of config/env.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error(transparent)]
    Shm(#[from] ktsn_mmap::ShmError),

    #[error(transparent)]
    Arena(#[from] ktsn_fabric::ArenaError),

    #[error("failed to register a signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

fn main() {
    let args = Args::parse();

    let config = SenderConfig::load(&args.config).unwrap_or_else(|err| {
        eprintln!("ktsnd: {}: {err}, falling back to compiled-in defaults", args.config);
        SenderConfig::default()
    });

    init_logging(&args, &config);

    match run(&args, &config) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(%err, "ktsnd: init failed");
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &Args, config: &SenderConfig) {
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: &Args, config: &SenderConfig) -> Result<(), InitError> {
    tracing::info!(port = args.port, queue = args.queue, config = %args.config, "ktsnd starting");

    let mut data_shm = SharedMemory::create(&config.data_memory_name, config.data_memory_size)?;
    let mut ctrl_shm = SharedMemory::create(&config.ctrl_memory_name, ShmLayout::SIZE)?;

    let page_size = ktsn_core::DEFAULT_PAGE_SIZE;
    // SAFETY: data_shm was just created and mapped read-write for exactly
    // config.data_memory_size bytes, not yet visible to any other process.
    let (arena, layout) =
        unsafe { Arena::create(data_shm.as_mut_ptr(), config.data_memory_size as u32, page_size, config.ring_capacity)? };

    // SAFETY: ctrl_shm was just created and mapped read-write for exactly
    // ShmLayout::SIZE bytes; writing the layout here is what lets the shim
    // attach to the same arena afterwards.
    unsafe {
        *(ctrl_shm.as_mut_ptr() as *mut ShmLayout) = layout;
    }

    tracing::info!(slots = arena.slot_count(), "arena carved, shim may now attach");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

    let mut nic = NullNic::new();
    let mut sender = SenderLoop::new(arena.slot_count(), config.tx_delta_ns);
    sender.run(&arena, &mut nic, &shutdown, ktsn_sender::now_ns);

    tracing::info!(frames_submitted = nic.submitted().len(), "ktsnd shutting down");
    data_shm.destroy();
    ctrl_shm.destroy();
    Ok(())
}
