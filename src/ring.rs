//! One capture ring (C3): socket, fanout membership, unreliable-window
//! bookkeeping, per-ring stats, optional savefile.

use crate::error::{Result, RxtxError};
use crate::savefile::{PacketHeader, Savefile};
use crate::socket::Socket;
use crate::stats::{Field, Stats};
use crate::worker::{FrameSource, RecvOutcome};

use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::worker::Direction;

/// Receive timeout for every ring's socket: short enough that a worker
/// notices a breakloop quickly, long enough not to busy-spin the CPU.
const RECV_TIMEOUT_MICROS: i64 = 10;

const FANOUT_MODE_SHIFT_MASK: i32 = 0x0000_ffff;

/// Kernel fanout policy. `CpuModulo` distributes by `skb_get_rx_queue`-ish
/// CPU hashing (`PACKET_FANOUT_CPU`); `NumaViaProgram` attaches a BPF
/// classifier program identified by `fd` (`PACKET_FANOUT_EBPF` or
/// `PACKET_FANOUT_CBPF` depending on how the fd was loaded).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanoutMode {
    CpuModulo,
    NumaViaProgram { fd: i32 },
}

impl FanoutMode {
    const PACKET_FANOUT_CPU: i32 = 2;
    const PACKET_FANOUT_EBPF: i32 = 7;

    fn kernel_mode(&self) -> i32 {
        match self {
            FanoutMode::CpuModulo => Self::PACKET_FANOUT_CPU,
            FanoutMode::NumaViaProgram { .. } => Self::PACKET_FANOUT_EBPF,
        }
    }
}

/// One ring's capture endpoint. Index is assigned by the Descriptor at
/// construction time and matches creation order (§3).
///
/// `socket` and `savefile` are `pub(crate)` rather than behind accessor
/// methods so that the worker-spawn path in `descriptor.rs` can borrow
/// them disjointly from `stats` when handing a ring to its worker thread
/// (a single `&mut self` accessor would force one borrow covering both).
pub struct Ring {
    pub idx: usize,
    pub(crate) socket: Socket,
    pub unreliable: u64,
    pub stats: Stats,
    pub(crate) savefile: Option<Savefile>,
}

impl Ring {
    /// Builds one ring, performing the strict socket → ring-opt →
    /// timeout → bind → fanout-join → stats-query sequence (§4.3). The
    /// returned ring's `unreliable` field is already populated; no
    /// worker may start before every ring in the descriptor has been
    /// constructed this way. Savefiles are attached separately, via
    /// [`Ring::attach_savefile`], after every ring's unreliable window
    /// has been measured (§3 Lifecycle).
    pub fn activate(
        idx: usize,
        if_name: &str,
        if_index: u32,
        fanout_group_id: u16,
        fanout_mode: FanoutMode,
    ) -> Result<Ring> {
        let socket = Socket::open(if_name, if_index)
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: socket"), e))?;

        socket
            .set_ring_options_noop()
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: ring options"), e))?;

        socket
            .set_recv_timeout(RECV_TIMEOUT_MICROS)
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: receive timeout"), e))?;

        socket
            .bind()
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: bind"), e))?;

        let mode_arg = fanout_mode.kernel_mode() & FANOUT_MODE_SHIFT_MASK;
        socket
            .join_fanout_group(fanout_group_id, mode_arg)
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: fanout join"), e))?;

        let tstats = socket
            .read_tpacket_stats()
            .map_err(|e| RxtxError::resource(&format!("ring {idx}: packet statistics"), e))?;
        let unreliable = (tstats.tp_packets as u64).saturating_sub(tstats.tp_drops as u64);

        let mut stats = Stats::new();
        stats.increment(Field::TpPackets, tstats.tp_packets as u64);
        stats.increment(Field::TpDrops, tstats.tp_drops as u64);

        Ok(Ring {
            idx,
            socket,
            unreliable,
            stats,
            savefile: None,
        })
    }

    /// Attaches an already-opened savefile to this ring. Called only for
    /// rings selected by the descriptor's ring-set, after every ring has
    /// been constructed (§3, §4.4).
    pub fn attach_savefile(&mut self, savefile: Savefile) {
        self.savefile = Some(savefile);
    }

    pub fn savefile(&self) -> Option<&Savefile> {
        self.savefile.as_ref()
    }
}

/// A borrowed view of a [`Ring`]'s socket and savefile, implementing
/// [`FrameSource`] without capturing `stats`. Built by direct field
/// projection (`RingFrames { socket: &mut ring.socket, savefile: &ring.savefile }`)
/// at the worker-spawn call site, disjoint from a simultaneous
/// `&mut ring.stats` borrow — see `descriptor::Descriptor::run_workers`.
pub(crate) struct RingFrames<'a> {
    pub(crate) socket: &'a mut Socket,
    pub(crate) savefile: &'a Option<Savefile>,
}

impl<'a> FrameSource for RingFrames<'a> {
    fn recv(&mut self) -> Result<RecvOutcome> {
        let mut buf = [0u8; 65535];
        match self.socket.recv_with_direction(&mut buf) {
            Ok(Some((len, direction))) => Ok(RecvOutcome::Frame {
                data: buf[..len].to_vec(),
                direction,
            }),
            Ok(None) => Ok(RecvOutcome::TimedOut),
            Err(e) => Err(RxtxError::resource("ring recv", e)),
        }
    }

    fn dump(&self, frame: &[u8], flush: bool) -> Result<()> {
        if let Some(savefile) = self.savefile {
            let ts_sec = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            let header = PacketHeader::for_frame(frame.len(), ts_sec);
            savefile.dump(&header, frame, flush)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_mode_selects_kernel_constant() {
        assert_eq!(FanoutMode::CpuModulo.kernel_mode(), 2);
        assert_eq!(FanoutMode::NumaViaProgram { fd: 9 }.kernel_mode(), 7);
    }

}
