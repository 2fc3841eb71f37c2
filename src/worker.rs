//! Per-ring packet pump (C5).
//!
//! Generic over [`FrameSource`] so the algorithm — clear the unreliable
//! prefix, filter by direction, honor the count cap and both breakloop
//! flags, emit pcap records — can be exercised against a synthetic
//! source in tests without a real kernel socket.

use crate::error::Result;
use crate::stats::{Field, SharedStats, Stats};
use std::sync::atomic::{AtomicBool, Ordering};

/// Consecutive same-direction misses tolerated before a worker breaks
/// out to recheck its shutdown conditions (§4.5 step 4).
const DIRECTION_MISS_LIMIT: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// The configured direction filter. `Both` accepts every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionFilter {
    In,
    Out,
    Both,
}

impl DirectionFilter {
    fn accepts(&self, direction: Direction) -> bool {
        match (self, direction) {
            (DirectionFilter::Both, _) => true,
            (DirectionFilter::In, Direction::Rx) => true,
            (DirectionFilter::Out, Direction::Tx) => true,
            _ => false,
        }
    }
}

/// The outcome of one non-blocking receive attempt.
pub enum RecvOutcome {
    Frame { data: Vec<u8>, direction: Direction },
    TimedOut,
}

/// A source of frames a worker can pump. Implemented by [`crate::ring::Ring`]
/// for real captures, and by canned in-memory sequences in tests.
pub trait FrameSource {
    fn recv(&mut self) -> Result<RecvOutcome>;

    /// Writes `frame` to this source's savefile, if any, flushing when
    /// `flush` is set. A no-op for sources with no attached savefile.
    fn dump(&self, frame: &[u8], flush: bool) -> Result<()>;
}

/// Everything a worker needs from its owning Descriptor besides the
/// ring itself: the shared shutdown/counting state.
pub struct WorkerContext<'a> {
    pub direction: DirectionFilter,
    pub packet_buffered: bool,
    pub packet_count: u64,
    pub aggregate_stats: &'a SharedStats,
    pub descriptor_breakloop: &'a AtomicBool,
    pub global_breakloop: &'a AtomicBool,
}

/// Runs one worker to completion against `source` and `ring_stats`
/// (the ring's own per-thread counters), honoring `unreliable` — the
/// number of already-queued frames to discard before counting anything
/// (§4.5 step 2).
pub fn run<S: FrameSource>(
    source: &mut S,
    ring_stats: &mut Stats,
    unreliable: u64,
    ctx: &WorkerContext,
) -> Result<()> {
    clear_unreliable_prefix(source, ring_stats, unreliable)?;
    main_loop(source, ring_stats, ctx)
}

fn should_stop(ctx: &WorkerContext) -> Result<bool> {
    if ctx.descriptor_breakloop.load(Ordering::SeqCst) {
        return Ok(true);
    }
    if ctx.global_breakloop.load(Ordering::SeqCst) {
        return Ok(true);
    }
    if ctx.packet_count > 0 {
        let received = ctx.aggregate_stats.get(Field::PacketsReceived)?;
        if received >= ctx.packet_count {
            return Ok(true);
        }
    }
    Ok(false)
}

fn clear_unreliable_prefix<S: FrameSource>(
    source: &mut S,
    ring_stats: &mut Stats,
    unreliable: u64,
) -> Result<()> {
    while ring_stats.get(Field::PacketsUnreliable) < unreliable {
        match source.recv()? {
            RecvOutcome::Frame { .. } => {
                ring_stats.increment(Field::PacketsUnreliable, 1);
            }
            RecvOutcome::TimedOut => break,
        }
    }
    Ok(())
}

/// Receives the next frame matching `ctx.direction`, rechecking shutdown
/// conditions on every timeout and after every run of
/// [`DIRECTION_MISS_LIMIT`] consecutive wrong-direction frames so an
/// unwanted-direction flood can't starve shutdown detection (§4.5 step 4).
/// Returns `None` once a shutdown condition is observed.
fn recv_accepted<S: FrameSource>(source: &mut S, ctx: &WorkerContext) -> Result<Option<Vec<u8>>> {
    let mut misses = 0u32;
    loop {
        match source.recv()? {
            RecvOutcome::TimedOut => {
                if should_stop(ctx)? {
                    return Ok(None);
                }
            }
            RecvOutcome::Frame { data, direction } => {
                if ctx.direction.accepts(direction) {
                    return Ok(Some(data));
                }
                misses += 1;
                if misses >= DIRECTION_MISS_LIMIT {
                    misses = 0;
                    if should_stop(ctx)? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

fn main_loop<S: FrameSource>(
    source: &mut S,
    ring_stats: &mut Stats,
    ctx: &WorkerContext,
) -> Result<()> {
    loop {
        if should_stop(ctx)? {
            return Ok(());
        }

        match recv_accepted(source, ctx)? {
            Some(frame) => accept(source, ring_stats, ctx, &frame)?,
            None => return Ok(()),
        }
    }
}

fn accept<S: FrameSource>(
    source: &S,
    ring_stats: &mut Stats,
    ctx: &WorkerContext,
    frame: &[u8],
) -> Result<()> {
    ctx.aggregate_stats.increment(Field::PacketsReceived, 1)?;
    ring_stats.increment(Field::PacketsReceived, 1);
    source.dump(frame, ctx.packet_buffered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CannedSource {
        frames: std::collections::VecDeque<RecvOutcome>,
        dumped: Mutex<Vec<Vec<u8>>>,
    }

    impl CannedSource {
        fn new(frames: Vec<RecvOutcome>) -> Self {
            CannedSource {
                frames: frames.into(),
                dumped: Mutex::new(Vec::new()),
            }
        }
    }

    impl FrameSource for CannedSource {
        fn recv(&mut self) -> Result<RecvOutcome> {
            Ok(self.frames.pop_front().unwrap_or(RecvOutcome::TimedOut))
        }

        fn dump(&self, frame: &[u8], _flush: bool) -> Result<()> {
            self.dumped.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    fn frame(direction: Direction, payload: &[u8]) -> RecvOutcome {
        RecvOutcome::Frame {
            data: payload.to_vec(),
            direction,
        }
    }

    #[test]
    fn direction_filter_keeps_only_matching_frames() {
        let mut source = CannedSource::new(vec![
            frame(Direction::Rx, b"rx1"),
            frame(Direction::Tx, b"tx1"),
            frame(Direction::Rx, b"rx2"),
        ]);
        let mut ring_stats = Stats::new();
        let aggregate = SharedStats::new().unwrap();
        let descriptor_breakloop = AtomicBool::new(false);
        let global_breakloop = AtomicBool::new(false);
        let ctx = WorkerContext {
            direction: DirectionFilter::Out,
            packet_buffered: false,
            packet_count: 1,
            aggregate_stats: &aggregate,
            descriptor_breakloop: &descriptor_breakloop,
            global_breakloop: &global_breakloop,
        };

        run(&mut source, &mut ring_stats, 0, &ctx).unwrap();

        assert_eq!(aggregate.get(Field::PacketsReceived).unwrap(), 1);
        assert_eq!(ring_stats.get(Field::PacketsReceived), 1);
        let dumped = source.dumped.lock().unwrap();
        assert_eq!(dumped.len(), 1);
        assert_eq!(&dumped[0], b"tx1");
    }

    #[test]
    fn unreliable_prefix_is_discarded_and_counted() {
        let mut source = CannedSource::new(vec![
            frame(Direction::Rx, b"a"),
            frame(Direction::Rx, b"b"),
            frame(Direction::Rx, b"c"),
            frame(Direction::Rx, b"d"),
        ]);
        let mut ring_stats = Stats::new();
        clear_unreliable_prefix(&mut source, &mut ring_stats, 3).unwrap();
        assert_eq!(ring_stats.get(Field::PacketsUnreliable), 3);
    }

    #[test]
    fn count_cap_stops_aggregate_at_target() {
        let aggregate = SharedStats::new().unwrap();
        aggregate.increment(Field::PacketsReceived, 5).unwrap();
        let descriptor_breakloop = AtomicBool::new(false);
        let global_breakloop = AtomicBool::new(false);
        let ctx = WorkerContext {
            direction: DirectionFilter::Both,
            packet_buffered: false,
            packet_count: 5,
            aggregate_stats: &aggregate,
            descriptor_breakloop: &descriptor_breakloop,
            global_breakloop: &global_breakloop,
        };
        assert!(should_stop(&ctx).unwrap());
    }

    #[test]
    fn global_breakloop_stops_worker_immediately() {
        let mut source = CannedSource::new(vec![frame(Direction::Rx, b"a")]);
        let mut ring_stats = Stats::new();
        let aggregate = SharedStats::new().unwrap();
        let descriptor_breakloop = AtomicBool::new(false);
        let global_breakloop = AtomicBool::new(true);
        let ctx = WorkerContext {
            direction: DirectionFilter::Both,
            packet_buffered: false,
            packet_count: 0,
            aggregate_stats: &aggregate,
            descriptor_breakloop: &descriptor_breakloop,
            global_breakloop: &global_breakloop,
        };
        run(&mut source, &mut ring_stats, 0, &ctx).unwrap();
        assert_eq!(aggregate.get(Field::PacketsReceived).unwrap(), 0);
    }
}
