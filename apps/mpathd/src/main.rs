use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mpathd_netlink::{NetlinkMonitor, Subscription, DEFAULT_RECEIVE_BUFFER};
use mpathd_uevent::{
    ConfigStore, DevnodeFilter, MultipathConfig, Uevent, UeventPipeline, UeventTrigger,
    UidAttrRule,
};
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::signal::{
    kill, pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::Pid;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signal: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[derive(Debug, Parser)]
#[command(name = "mpathd")]
#[command(about = "Coalescing uevent pipeline for multipath path management", long_about = None)]
struct Args {
    /// Kernel subsystem to subscribe to.
    #[arg(long, default_value = "block")]
    subsystem: String,
    /// Device type to subscribe to.
    #[arg(long, default_value = "disk")]
    devtype: String,
    /// Netlink receive buffer size in bytes.
    #[arg(long, default_value_t = DEFAULT_RECEIVE_BUFFER)]
    receive_buffer: usize,
    /// Devnode deny pattern (repeatable).
    #[arg(long = "deny", value_name = "REGEX")]
    deny: Vec<String>,
    /// Devnode allow pattern overriding denials (repeatable).
    #[arg(long = "allow", value_name = "REGEX")]
    allow: Vec<String>,
    /// Identifier attribute rule mapping a kernel-name prefix to the env
    /// key carrying the wwid (repeatable; any rule enables merging).
    #[arg(long = "uid-attr", value_name = "PREFIX:KEY")]
    uid_attrs: Vec<String>,
    /// Lock process memory to avoid paging stalls under event storms.
    #[arg(long)]
    lock_memory: bool,
}

/// Stands in for the multipath reconfiguration layer: records each
/// serviced event in the log.
#[derive(Default)]
struct LogTrigger {
    serviced: u64,
}

impl UeventTrigger for LogTrigger {
    fn handle(&mut self, event: &Uevent) -> Result<()> {
        self.serviced += 1;
        info!(
            action = event.action(),
            kernel = event.kernel(),
            wwid = event.wwid().unwrap_or("-"),
            merged = event.merged().len(),
            mpath = event.is_mpath(),
            serviced = self.serviced,
            "serviced uevent"
        );
        for child in event.merged() {
            info!(
                action = child.action(),
                kernel = child.kernel(),
                "merged path event"
            );
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let uid_attrs = args
        .uid_attrs
        .iter()
        .map(|rule| rule.parse())
        .collect::<Result<Vec<UidAttrRule>>>()?;
    let config = MultipathConfig {
        devnode_filter: DevnodeFilter::compile(&args.allow, &args.deny)?,
        uid_attrs,
    };
    if config.merging_enabled() {
        info!(rules = config.uid_attrs.len(), "uevent merging enabled");
    } else {
        info!("no identifier rules, uevent merging disabled");
    }

    if args.lock_memory {
        if let Err(err) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
            warn!(error = %err, "mlockall failed, continuing without locked memory");
        }
    }

    install_shutdown_handler().context("install signal handlers")?;
    // Shutdown signals go to the listener thread only, where they
    // interrupt the poll; every other thread keeps them blocked.
    let mut shutdown_signals = SigSet::empty();
    shutdown_signals.add(Signal::SIGINT);
    shutdown_signals.add(Signal::SIGTERM);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&shutdown_signals), None)
        .context("mask shutdown signals")?;

    let pipeline = Arc::new(UeventPipeline::new());
    let store = Arc::new(ConfigStore::new(config));

    let dispatcher = {
        let pipeline = pipeline.clone();
        let store = store.clone();
        thread::Builder::new()
            .name("uev-dispatch".to_string())
            .spawn(move || {
                let mut trigger = LogTrigger::default();
                pipeline.dispatch(&store, &mut trigger)
            })
            .context("spawn dispatcher thread")?
    };

    let listener = {
        let pipeline = pipeline.clone();
        let subscription = Subscription::new(&args.subsystem, &args.devtype);
        let receive_buffer = args.receive_buffer;
        thread::Builder::new()
            .name("uev-listen".to_string())
            .spawn(move || -> Result<()> {
                pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&shutdown_signals), None)
                    .context("unmask shutdown signals")?;
                let mut monitor = NetlinkMonitor::open(subscription, receive_buffer)
                    .context("open netlink uevent monitor")?;
                pipeline.listen(&mut monitor)
            })
            .context("spawn listener thread")?
    };

    info!(
        subsystem = %args.subsystem,
        devtype = %args.devtype,
        "mpathd running"
    );
    while !SHUTDOWN.load(Ordering::SeqCst) && !listener.is_finished() {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    pipeline.shutdown();
    // Re-deliver the signal so a listener parked in poll wakes up and
    // observes the shutdown flag.
    let _ = kill(Pid::this(), Signal::SIGTERM);

    let listen_result = match listener.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("listener thread panicked")),
    };
    let dispatch_result = match dispatcher.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("dispatcher thread panicked")),
    };
    dispatch_result?;
    listen_result
}

fn install_shutdown_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("install SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("install SIGTERM handler")?;
    }
    Ok(())
}
