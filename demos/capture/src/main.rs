//! `capture` — a thin CLI orchestrator around [`rxtx_fanout`], matching
//! the original tool's option surface one-for-one except for CPU-mask
//! and NUMA-set parsing, which stay out of scope (ring selection is by
//! explicit index list only).

use clap::Parser;
use rxtx_fanout::{DirectionFilter, FanoutMode, RingSet, RxtxError};
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_FAIL: u8 = 1;
const EXIT_FAIL_OPTION: u8 = 2;

/// Everything [`run`] can fail with, kept distinct from a flat string so
/// `main` can pick the exit code the spec's contract demands (§6) instead
/// of collapsing every failure to "configuration/usage error".
enum RunError {
    /// CLI-level usage errors caught before any engine call is made.
    Option(String),
    /// A failure surfaced by the engine itself; `Configuration`/`State`
    /// are usage errors, everything else (`Resource`/`Io`/`Timeout`) is
    /// a fatal runtime failure.
    Engine(RxtxError),
}

impl RunError {
    fn exit_code(&self) -> u8 {
        match self {
            RunError::Option(_) => EXIT_FAIL_OPTION,
            RunError::Engine(RxtxError::Configuration(_) | RxtxError::State(_)) => {
                EXIT_FAIL_OPTION
            }
            RunError::Engine(_) => EXIT_FAIL,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Option(message) => write!(f, "{message}"),
            RunError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl From<RxtxError> for RunError {
    fn from(e: RxtxError) -> Self {
        RunError::Engine(e)
    }
}

#[derive(Parser, Debug)]
#[command(name = "capture", about = "Multi-ring AF_PACKET capture")]
struct Args {
    /// Exit after receiving N packets.
    #[arg(short = 'c', long = "count", default_value_t = 0)]
    count: u64,

    /// Capture only packets matching DIRECTION ('rx', 'tx', or 'rxtx').
    #[arg(short = 'd', long = "direction", default_value = "rxtx")]
    direction: String,

    /// Capture only on rings in RINGLIST (e.g. '0,2-4,6').
    #[arg(short = 'l', long = "ring-list")]
    ring_list: Option<String>,

    /// Total number of rings to create. Defaults to the online CPU count.
    #[arg(short = 'n', long = "ring-count")]
    ring_count: Option<usize>,

    /// Put the interface into promiscuous mode.
    #[arg(short = 'p', long = "promiscuous", default_value_t = false)]
    promiscuous: bool,

    /// Flush the pcap write buffer after each packet.
    #[arg(short = 'U', long = "packet-buffered", default_value_t = false)]
    packet_buffered: bool,

    /// Display more verbose output.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,

    /// Write packets to FILE in pcap format (a per-ring filename template).
    #[arg(short = 'w', long = "write")]
    write: Option<String>,

    /// Interface to capture on. Unset means "any".
    interface: Option<String>,
}

fn parse_direction(s: &str) -> Result<DirectionFilter, String> {
    match s {
        "rx" => Ok(DirectionFilter::In),
        "tx" => Ok(DirectionFilter::Out),
        "rxtx" => Ok(DirectionFilter::Both),
        other => Err(format!(
            "invalid direction '{other}': must be 'rx', 'tx', or 'rxtx'"
        )),
    }
}

/// Parses a cpu-list-style ring selection, e.g. `"0,2-4,6"`.
fn parse_ring_list(s: &str) -> Result<RingSet, String> {
    let mut set = RingSet::new();
    for term in s.split(',') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = term.split_once('-') {
            let lo: usize = lo
                .trim()
                .parse()
                .map_err(|_| format!("invalid ring list term '{term}'"))?;
            let hi: usize = hi
                .trim()
                .parse()
                .map_err(|_| format!("invalid ring list term '{term}'"))?;
            if lo > hi {
                return Err(format!("invalid ring list range '{term}'"));
            }
            for idx in lo..=hi {
                set.set(idx);
            }
        } else {
            let idx: usize = term
                .parse()
                .map_err(|_| format!("invalid ring list term '{term}'"))?;
            set.set(idx);
        }
    }
    Ok(set)
}

fn online_ring_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn run(args: Args) -> Result<u8, RunError> {
    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        env_logger::init();
    }

    let direction = parse_direction(&args.direction).map_err(RunError::Option)?;
    let ring_set = match &args.ring_list {
        Some(s) => parse_ring_list(s).map_err(RunError::Option)?,
        None => RingSet::new(),
    };

    if args.write.as_deref() == Some("-") && ring_set.count() > 1 {
        return Err(RunError::Option(
            "writing to stdout ('-') is only supported with a single ring".to_string(),
        ));
    }

    ctrlc::set_handler(rxtx_fanout::set_breakloop_global).map_err(|e| {
        RunError::Engine(RxtxError::Resource(format!(
            "error installing signal handler: {e}"
        )))
    })?;

    let mut descriptor = rxtx_fanout::Descriptor::new();
    descriptor.set_interface(args.interface.as_deref())?;
    descriptor.set_direction(direction)?;
    descriptor.set_ring_count(args.ring_count.unwrap_or_else(online_ring_count))?;
    descriptor.set_ring_set(ring_set)?;
    descriptor.set_fanout_mode(FanoutMode::CpuModulo)?;
    descriptor.set_savefile_template(args.write.as_deref())?;
    descriptor.set_packet_count(args.count)?;
    if args.packet_buffered {
        descriptor.set_packet_buffered()?;
    }
    if args.promiscuous {
        descriptor.set_promiscuous()?;
    }
    if args.verbose {
        descriptor.set_verbose()?;
    }

    descriptor.activate()?;

    let reports = descriptor.run_workers()?;

    let received = descriptor.packets_received().unwrap_or(0);
    log::info!("received {received} packets total");

    let mut failed = false;
    for report in &reports {
        if let Err(e) = &report.outcome {
            log::error!("ring {}: {e}", report.ring_idx);
            failed = true;
        }
    }

    descriptor.close()?;

    Ok(if failed { EXIT_FAIL } else { EXIT_OK })
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("capture: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
