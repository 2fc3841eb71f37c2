//! Multi-stream `AF_PACKET` capture engine.
//!
//! A [`descriptor::Descriptor`] owns a fixed number of [`ring::Ring`]s,
//! one per kernel fanout member, and spawns one [`worker`] thread per
//! selected ring to pump frames into optional [`savefile::Savefile`]s.
//! See `descriptor` for the lifecycle state machine and `worker` for
//! the per-ring packet pump.

pub mod affinity;
pub mod descriptor;
pub mod error;
pub mod ring;
pub mod ring_set;
pub mod savefile;
pub mod socket;
pub mod stats;
pub mod worker;

pub use descriptor::{CaptureConfig, Descriptor, DescriptorState, RingSelection, WorkerReport};
pub use error::{RxtxError, ERRBUF_SIZE};
pub use ring::{FanoutMode, Ring};
pub use ring_set::RingSet;
pub use savefile::Savefile;
pub use stats::{Counters, Field, SharedStats, Stats};
pub use worker::{Direction, DirectionFilter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Process-wide breakloop, set by a signal handler installed by a
/// collaborator (e.g. `demos/capture`'s SIGINT/SIGTERM handler). Every
/// active descriptor's workers observe this alongside their own
/// per-descriptor flag (§5).
pub static GLOBAL_BREAKLOOP: AtomicBool = AtomicBool::new(false);

/// Sets the process-wide breakloop flag. Idempotent and safe to call
/// from a signal handler context (a single `SeqCst` store, no
/// allocation or locking).
pub fn set_breakloop_global() {
    GLOBAL_BREAKLOOP.store(true, Ordering::SeqCst);
}

pub fn breakloop_global_isset() -> bool {
    GLOBAL_BREAKLOOP.load(Ordering::SeqCst)
}

static PROGRAM_BASENAME: OnceLock<String> = OnceLock::new();

/// Records the process's basename once, for use in diagnostic output.
/// Matches the original's `program_basename` global; set at most once
/// per process (subsequent calls are no-ops).
pub fn set_program_basename(name: &str) {
    let _ = PROGRAM_BASENAME.set(name.to_string());
}

/// The basename recorded by [`set_program_basename`], or `""` if never
/// set.
pub fn program_basename() -> &'static str {
    PROGRAM_BASENAME.get().map(String::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_breakloop_round_trip() {
        // Other tests in this binary may also touch the global flag;
        // this only asserts monotonic set -> observed, not a fresh start.
        set_breakloop_global();
        assert!(breakloop_global_isset());
    }
}
