//! Collector daemon: command line, signal handling and component wiring.
//! All data-plane logic lives in the library.

use ipfix_collector::configurator::{Configurator, StartupConfig};
use ipfix_collector::elements::ElementDictionary;
use ipfix_collector::output_manager::OutputManager;
use ipfix_collector::preprocessor::Preprocessor;
use ipfix_collector::ring_buffer::RingBuffer;
use ipfix_collector::stats::{QueueDirectory, StatsSettings};
use ipfix_collector::template_manager::TemplateManager;

use clap::Parser;
use log::{error, info, warn, LevelFilter};

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// IPFIX collector capture daemon.
#[derive(Debug, Parser)]
#[command(name = "ipfix_collector", version, about)]
struct Opts {
    /// Startup configuration path
    #[arg(short = 'c', value_name = "file", default_value = "/etc/ipfix_collector/startup.yaml")]
    config: PathBuf,

    /// Internal configuration path (accepted for compatibility; the plugin
    /// registry is built in)
    #[arg(short = 'i', value_name = "file")]
    internal: Option<PathBuf>,

    /// Additional information-element dictionary (YAML list)
    #[arg(short = 'e', value_name = "file")]
    elements: Option<PathBuf>,

    /// Run daemonized
    #[arg(short = 'd')]
    daemonize: bool,

    /// Logging verbosity (0-3)
    #[arg(short = 'v', value_name = "level", default_value_t = 1)]
    verbosity: u8,

    /// Skip sequence-number error reporting
    #[arg(short = 's')]
    skip_seq_errors: bool,

    /// Ring buffer capacity
    #[arg(short = 'r', value_name = "n", default_value_t = 8192)]
    ring_size: usize,

    /// Statistics interval in seconds (0 disables)
    #[arg(short = 'S', value_name = "sec", default_value_t = 0)]
    stat_interval: u64,
}

/// Orderly-shutdown request from SIGINT/SIGTERM/SIGQUIT.
static SIG_TERMINATE: AtomicBool = AtomicBool::new(false);
/// Reload request from SIGUSR1.
static SIG_RECONF: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn signal_handler(sig: std::ffi::c_int) {
    if sig == nix::sys::signal::Signal::SIGUSR1 as std::ffi::c_int {
        SIG_RECONF.store(true, Ordering::SeqCst);
        return;
    }
    if SIG_TERMINATE.swap(true, Ordering::SeqCst) {
        // Second termination signal: give up on cleanup.
        std::process::exit(1);
    }
}

#[cfg(unix)]
fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(signal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGUSR1] {
        // Safety: the handler only touches atomics.
        if let Err(e) = unsafe { sigaction(sig, &action) } {
            warn!("cannot install handler for {sig}: {e}");
        }
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> ExitCode {
    let opts = Opts::parse();

    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter(None, level_filter(opts.verbosity))
        .init();

    if let Some(internal) = &opts.internal {
        info!(
            "internal configuration {} ignored: plugin registry is built in",
            internal.display()
        );
    }

    #[cfg(unix)]
    if opts.daemonize {
        if let Err(e) = nix::unistd::daemon(true, false) {
            error!("cannot daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    install_signal_handlers();

    match run(opts) {
        Ok(()) => {
            info!("closing collector");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: Opts) -> Result<(), ipfix_collector::CollectorError> {
    info!("starting IPFIX collector");

    let mut elements = ElementDictionary::new();
    if let Some(path) = &opts.elements {
        match elements.load_extra(path) {
            Ok(count) => info!("loaded {count} extra information elements"),
            Err(e) => warn!("cannot load element dictionary: {e}"),
        }
    }

    let statistics_file = StartupConfig::from_file(&opts.config)
        .ok()
        .and_then(|c| c.statistics_file);

    let templates = Arc::new(TemplateManager::new());
    let preprocessor_queue = RingBuffer::new(opts.ring_size)?;
    let preprocessor = Arc::new(Mutex::new(Preprocessor::new(
        Arc::clone(&templates),
        Arc::clone(&preprocessor_queue),
        Arc::new(elements),
        opts.skip_seq_errors,
    )));

    let queues = QueueDirectory::new();
    let mut output = OutputManager::new(
        Arc::clone(&templates),
        Arc::clone(&preprocessor_queue),
        opts.ring_size,
    );

    let terminating = Arc::new(AtomicBool::new(false));
    let mut configurator = Configurator::new(
        Some(opts.config.clone()),
        opts.ring_size,
        Arc::clone(&preprocessor),
        output.handle(),
        Arc::clone(&queues),
        Arc::clone(&terminating),
    );

    output.start(
        Some(StatsSettings {
            interval: opts.stat_interval,
            file: statistics_file,
        }),
        Arc::clone(&queues),
    )?;

    // Initial configuration must apply or the collector has nothing to do.
    configurator.reconf()?;

    while !SIG_TERMINATE.load(Ordering::SeqCst) && !terminating.load(Ordering::SeqCst) {
        if SIG_RECONF.swap(false, Ordering::SeqCst) {
            info!("reloading configuration");
            if let Err(e) = configurator.reconf() {
                error!("reload failed; live pipeline unchanged: {e}");
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    terminating.store(true, Ordering::SeqCst);
    configurator.shutdown();
    output.close()?;
    Ok(())
}
