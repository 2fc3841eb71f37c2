//! Worker-thread CPU pinning (§5): one ring runs on one CPU, matching
//! the CPU-fanout variant's ring-index-to-CPU mapping. A single
//! `sched_setaffinity` call doesn't warrant a dedicated affinity crate,
//! so this stays on direct `libc`, the same idiom `socket.rs` uses for
//! every other raw syscall.

use std::io;
use std::mem;

/// Pins the calling thread to `cpu`. Ring `i`'s worker is pinned to CPU
/// `i` in the CPU-fanout variant; a NUMA variant would instead pin to
/// every CPU in a node's set, which is out of scope for this engine
/// (§1: CPU/NUMA set resolution from `sysfs` is an external collaborator).
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
