//! The capture session (C4): configuration, the activation state
//! machine, savefile-name resolution, and worker spawning.

use crate::error::{Result, RxtxError};
use crate::ring::{FanoutMode, Ring, RingFrames};
use crate::ring_set::RingSet;
use crate::savefile::Savefile;
use crate::socket;
use crate::stats::{Field, SharedStats};
use crate::worker::{self, DirectionFilter, WorkerContext};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Lifecycle state (§4.4). Configuration setters are only permitted in
/// `Inactive`, with the narrow exceptions documented on each setter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorState {
    Inactive,
    Activating,
    Active,
}

/// Direction, fanout, output, and limit configuration — consolidated
/// from the original's dozen individually state-gated setters into one
/// struct validated as a whole at `activate` (§9 Design Notes).
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub direction: DirectionFilter,
    pub fanout_group_id: u16,
    pub fanout_mode: Option<FanoutMode>,
    pub savefile_template: Option<String>,
    pub packet_count: u64,
    pub packet_buffered: bool,
    pub promiscuous: bool,
    pub verbose: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            direction: DirectionFilter::Both,
            fanout_group_id: (std::process::id() & 0xffff) as u16,
            fanout_mode: None,
            savefile_template: None,
            packet_count: 0,
            packet_buffered: false,
            promiscuous: false,
            verbose: false,
        }
    }
}

/// Which rings exist and which of them run workers (§4.6). An empty
/// `ring_set` expands to "every ring" at activation.
#[derive(Clone, Debug, Default)]
pub struct RingSelection {
    pub ring_count: usize,
    pub ring_set: RingSet,
}

/// The outcome of one worker thread, returned by [`Descriptor::run_workers`].
#[derive(Debug)]
pub struct WorkerReport {
    pub ring_idx: usize,
    pub outcome: Result<()>,
}

/// One capture session (§3). Owns its rings in an arena (`Vec<Ring>`
/// indexed by creation order); rings hold no back-pointer to the
/// descriptor, only the index they were built with (§9: arena, not a
/// pointer cycle).
pub struct Descriptor {
    ifname: Option<String>,
    ifindex: u32,
    config: CaptureConfig,
    selection: RingSelection,
    state: DescriptorState,
    breakloop: AtomicBool,
    initialized_ring_count: usize,
    rings: Vec<Ring>,
    stats: Option<SharedStats>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor::new()
    }
}

impl Descriptor {
    pub fn new() -> Descriptor {
        Descriptor {
            ifname: None,
            ifindex: 0,
            config: CaptureConfig::default(),
            selection: RingSelection::default(),
            state: DescriptorState::Inactive,
            breakloop: AtomicBool::new(false),
            initialized_ring_count: 0,
            rings: Vec::new(),
            stats: None,
        }
    }

    fn ensure_inactive(&self) -> Result<()> {
        if self.state != DescriptorState::Inactive {
            return Err(RxtxError::State(
                "changing configuration on a non-inactive descriptor is not permitted".into(),
            ));
        }
        Ok(())
    }

    // ------------------------------ setters ------------------------------

    /// Sets the capture interface by name, resolving and caching its
    /// ifindex. `None` or `""` means "any interface" (ifindex `0`).
    pub fn set_interface(&mut self, name: Option<&str>) -> Result<()> {
        self.ensure_inactive()?;
        match name {
            None | Some("") => {
                self.ifname = None;
                self.ifindex = 0;
            }
            Some(name) => {
                let ifindex = socket::get_if_index(name)
                    .map_err(|e| RxtxError::resource(&format!("setting ifname '{name}'"), e))?;
                self.ifname = Some(name.to_string());
                self.ifindex = ifindex;
            }
        }
        Ok(())
    }

    /// Sets the capture interface by kernel ifindex, resolving and
    /// caching its name. `0` means "any interface".
    pub fn set_ifindex(&mut self, ifindex: u32) -> Result<()> {
        self.ensure_inactive()?;
        if ifindex == 0 {
            self.ifindex = 0;
            self.ifname = None;
        } else {
            let name = socket::get_if_name(ifindex)
                .map_err(|e| RxtxError::resource(&format!("setting ifindex '{ifindex}'"), e))?;
            self.ifindex = ifindex;
            self.ifname = Some(name);
        }
        Ok(())
    }

    pub fn set_direction(&mut self, direction: DirectionFilter) -> Result<()> {
        self.ensure_inactive()?;
        self.config.direction = direction;
        Ok(())
    }

    pub fn set_fanout_group_id(&mut self, group_id: u16) -> Result<()> {
        self.ensure_inactive()?;
        self.config.fanout_group_id = group_id;
        Ok(())
    }

    pub fn set_fanout_mode(&mut self, mode: FanoutMode) -> Result<()> {
        self.ensure_inactive()?;
        self.config.fanout_mode = Some(mode);
        Ok(())
    }

    pub fn set_savefile_template(&mut self, template: Option<&str>) -> Result<()> {
        self.ensure_inactive()?;
        self.config.savefile_template = template.map(str::to_string);
        Ok(())
    }

    pub fn set_packet_count(&mut self, count: u64) -> Result<()> {
        self.ensure_inactive()?;
        self.config.packet_count = count;
        Ok(())
    }

    pub fn set_ring_count(&mut self, count: usize) -> Result<()> {
        self.ensure_inactive()?;
        self.selection.ring_count = count;
        Ok(())
    }

    pub fn set_ring_set(&mut self, set: RingSet) -> Result<()> {
        self.ensure_inactive()?;
        self.selection.ring_set = set;
        Ok(())
    }

    pub fn set_packet_buffered(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.packet_buffered = true;
        Ok(())
    }

    pub fn unset_packet_buffered(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.packet_buffered = false;
        Ok(())
    }

    pub fn set_promiscuous(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.promiscuous = true;
        Ok(())
    }

    pub fn unset_promiscuous(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.promiscuous = false;
        Ok(())
    }

    pub fn set_verbose(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.verbose = true;
        Ok(())
    }

    pub fn unset_verbose(&mut self) -> Result<()> {
        self.ensure_inactive()?;
        self.config.verbose = false;
        Ok(())
    }

    /// Sets the per-descriptor breakloop flag. Requires `Active` (§4.4).
    pub fn set_breakloop(&self) -> Result<()> {
        if self.state != DescriptorState::Active {
            return Err(RxtxError::State(
                "setting breakloop on a non-active descriptor is not permitted".into(),
            ));
        }
        self.breakloop.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Requires `Activating`; used internally during [`Descriptor::activate`].
    fn increment_initialized_ring_count(&mut self) -> Result<()> {
        if self.state != DescriptorState::Activating {
            return Err(RxtxError::State(
                "changing initialized ring count outside of activation is not permitted".into(),
            ));
        }
        self.initialized_ring_count += 1;
        Ok(())
    }

    /// Requires `Active`. Exposed for API completeness (§4.4); the real
    /// packet path increments through the worker's own
    /// [`crate::stats::SharedStats`] handle instead of routing through
    /// the descriptor on every frame.
    pub fn increment_packets_received(&self) -> Result<()> {
        if self.state != DescriptorState::Active {
            return Err(RxtxError::State(
                "changing packets received on a non-active descriptor is not permitted".into(),
            ));
        }
        self.stats
            .as_ref()
            .expect("active descriptor always has stats")
            .increment(Field::PacketsReceived, 1)
    }

    // ------------------------------ getters ------------------------------

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn ifname(&self) -> Option<&str> {
        self.ifname.as_deref()
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn direction(&self) -> DirectionFilter {
        self.config.direction
    }

    pub fn fanout_group_id(&self) -> u16 {
        self.config.fanout_group_id
    }

    pub fn fanout_mode(&self) -> Option<FanoutMode> {
        self.config.fanout_mode
    }

    pub fn savefile_template(&self) -> Option<&str> {
        self.config.savefile_template.as_deref()
    }

    pub fn packet_count(&self) -> u64 {
        self.config.packet_count
    }

    pub fn packet_buffered_isset(&self) -> bool {
        self.config.packet_buffered
    }

    pub fn promiscuous_isset(&self) -> bool {
        self.config.promiscuous
    }

    pub fn verbose_isset(&self) -> bool {
        self.config.verbose
    }

    pub fn ring_count(&self) -> usize {
        self.selection.ring_count
    }

    pub fn ring_set(&self) -> &RingSet {
        &self.selection.ring_set
    }

    pub fn initialized_ring_count(&self) -> usize {
        self.initialized_ring_count
    }

    /// `true` once the process-global or per-descriptor breakloop flag
    /// is set (§5: two independent shutdown flags).
    pub fn breakloop_isset(&self) -> bool {
        crate::breakloop_global_isset() || self.breakloop.load(Ordering::SeqCst)
    }

    pub fn packets_received(&self) -> Result<u64> {
        self.stats
            .as_ref()
            .map(|s| s.get(Field::PacketsReceived))
            .unwrap_or(Ok(0))
    }

    pub fn packet_count_reached(&self) -> Result<bool> {
        if self.config.packet_count == 0 {
            return Ok(false);
        }
        Ok(self.packets_received()? >= self.config.packet_count)
    }

    /// Only permitted on an `Active` descriptor (§3: ring access on an
    /// inactive or activating descriptor is not permitted).
    pub fn ring(&self, idx: usize) -> Result<&Ring> {
        if self.state != DescriptorState::Active {
            return Err(RxtxError::State(
                "ring access on an inactive or activating descriptor is not permitted".into(),
            ));
        }
        self.rings
            .get(idx)
            .ok_or_else(|| RxtxError::Configuration(format!("ring idx '{idx}' is out-of-bounds")))
    }

    // ----------------------------- lifecycle ------------------------------

    /// `Inactive -> Activating -> Active` (§4.4). On any validation or
    /// resource failure the descriptor is left `Activating`; callers
    /// must call [`Descriptor::close`] to return to `Inactive`.
    pub fn activate(&mut self) -> Result<()> {
        if self.state != DescriptorState::Inactive {
            return Err(RxtxError::State(
                "error activating descriptor: descriptor is already active".into(),
            ));
        }
        self.state = DescriptorState::Activating;

        if crate::breakloop_global_isset() {
            return Err(RxtxError::Configuration(
                "error activating descriptor: global breakloop is set".into(),
            ));
        }

        if self.config.verbose {
            log::info!("using direction '{:?}'", self.config.direction);
            log::info!("using fanout group id '{}'", self.config.fanout_group_id);
        }

        validate_for_activation(&self.config, &mut self.selection)?;

        if self.config.verbose {
            log::info!("using fanout mode '{:?}'", self.config.fanout_mode);
            if self.ifindex == 0 {
                log::info!("using ifindex '0' for any interface");
            } else {
                log::info!(
                    "using ifindex '{}' for interface '{}'",
                    self.ifindex,
                    self.ifname.as_deref().unwrap_or("")
                );
            }
            log::info!("packet buffered output {}", self.config.packet_buffered);
            if self.config.packet_count == 0 {
                log::info!("using packet count '0' (infinite)");
            } else {
                log::info!("using packet count '{}'", self.config.packet_count);
            }
            log::info!("promiscuous mode {}", self.config.promiscuous);
            log::info!("using ring count '{}'", self.selection.ring_count);
            // TODO: compress this into a standard cpulist-style range notation.
            log::info!(
                "using ring set '{}'",
                format_ring_set(&self.selection.ring_set, self.selection.ring_count)
            );
        }

        let fanout_mode = self
            .config
            .fanout_mode
            .expect("validate_for_activation guarantees a fanout mode");

        // We only have to enable promiscuity once; it persists for the
        // rest of the process's lifetime.
        if self.config.promiscuous {
            if self.ifindex == 0 {
                if self.config.verbose {
                    log::info!("skipping promiscuous mode for any interface");
                }
            } else {
                socket::set_promiscuous(self.ifname.as_deref().unwrap_or(""))
                    .map_err(|e| RxtxError::resource("enabling promiscuous mode", e))?;
            }
        }

        let stats = SharedStats::new()?;

        // Construct every ring in index order; per-CPU fanout depends on
        // this ordering (§5).
        let mut rings = Vec::with_capacity(self.selection.ring_count);
        for idx in 0..self.selection.ring_count {
            let ring = Ring::activate(
                idx,
                self.ifname.as_deref().unwrap_or(""),
                self.ifindex,
                self.config.fanout_group_id,
                fanout_mode,
            )?;
            self.increment_initialized_ring_count()?;
            rings.push(ring);
        }

        // Savefiles are opened only for selected rings, after every
        // ring's unreliable window has already been measured.
        if let Some(template) = self.config.savefile_template.clone() {
            let mut shared_stdout: Option<Savefile> = None;
            for idx in self
                .selection
                .ring_set
                .set_rings_in_size(self.selection.ring_count)
            {
                let name = resolve_savefile_name(&template, idx);
                let savefile = if name == "-" {
                    match &shared_stdout {
                        Some(sf) => sf.clone(),
                        None => {
                            let sf = Savefile::open("-")?;
                            shared_stdout = Some(sf.clone());
                            sf
                        }
                    }
                } else {
                    Savefile::open(&name)?
                };
                rings[idx].attach_savefile(savefile);
            }
        }

        self.stats = Some(stats);
        self.rings = rings;
        self.state = DescriptorState::Active;

        Ok(())
    }

    /// `Active -> Inactive`. The orchestrator must join all workers
    /// before calling this (§3: joins nothing itself). Rings are
    /// destroyed in reverse index order so the lowest-indexed ring,
    /// which may own a stdout-shared savefile, outlives its peers.
    pub fn close(&mut self) -> Result<()> {
        self.state = DescriptorState::Inactive;
        self.breakloop.store(false, Ordering::SeqCst);
        self.initialized_ring_count = 0;

        while self.rings.pop().is_some() {
            // Dropping here, in descending-index order, runs each
            // ring's (and its savefile Arc's) destructor before the
            // next-lower-indexed ring's.
        }

        self.stats = None;

        Ok(())
    }

    /// Spawns one scoped worker thread per selected ring, pinned to the
    /// CPU matching its ring index, and joins them all before returning
    /// (§4.5, §5). Requires `Active`.
    pub fn run_workers(&mut self) -> Result<Vec<WorkerReport>> {
        if self.state != DescriptorState::Active {
            return Err(RxtxError::State(
                "cannot run workers on a non-active descriptor".into(),
            ));
        }

        let selected: Vec<usize> = self
            .selection
            .ring_set
            .set_rings_in_size(self.selection.ring_count)
            .collect();
        let config = &self.config;
        let aggregate_stats = self
            .stats
            .as_ref()
            .expect("active descriptor always has stats");
        let breakloop = &self.breakloop;

        let reports = thread::scope(|scope| {
            let handles: Vec<_> = self
                .rings
                .iter_mut()
                .filter(|ring| selected.contains(&ring.idx))
                .map(|ring| {
                    let ring_idx = ring.idx;
                    let unreliable = ring.unreliable;
                    let verbose = config.verbose;
                    let ctx = WorkerContext {
                        direction: config.direction,
                        packet_buffered: config.packet_buffered,
                        packet_count: config.packet_count,
                        aggregate_stats,
                        descriptor_breakloop: breakloop,
                        global_breakloop: &crate::GLOBAL_BREAKLOOP,
                    };

                    scope.spawn(move || {
                        if verbose {
                            log::info!("worker for ring {ring_idx} starting");
                        }
                        if let Err(e) = crate::affinity::pin_current_thread(ring_idx) {
                            if verbose {
                                log::warn!("ring {ring_idx}: failed to pin to cpu {ring_idx}: {e}");
                            }
                        }

                        // Direct field projection, not `ring.frame_source()`: a
                        // method call would borrow all of `*ring` for the
                        // returned value's lifetime and conflict with the
                        // `&mut ring.stats` borrow taken in the same call.
                        let mut frames = RingFrames {
                            socket: &mut ring.socket,
                            savefile: &ring.savefile,
                        };
                        let outcome = worker::run(&mut frames, &mut ring.stats, unreliable, &ctx);
                        WorkerReport { ring_idx, outcome }
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect::<Vec<_>>()
        });

        Ok(reports)
    }
}

/// The `Inactive -> Activating` validation (§4.4), kept as a free
/// function so it can be unit tested without opening real sockets.
fn validate_for_activation(config: &CaptureConfig, selection: &mut RingSelection) -> Result<()> {
    if config.fanout_mode.is_none() {
        return Err(RxtxError::Configuration(
            "error activating descriptor: fanout mode is required, but unset".into(),
        ));
    }

    if selection.ring_count == 0 {
        return Err(RxtxError::Configuration(
            "error activating descriptor: ring count of one or more is required, but is zero"
                .into(),
        ));
    }

    if selection.ring_set.count() == 0 {
        for i in 0..selection.ring_count {
            selection.ring_set.set(i);
        }
    }

    let in_range = selection
        .ring_set
        .set_rings_in_size(selection.ring_count)
        .count();
    if in_range == 0 {
        return Err(RxtxError::Configuration(
            "error activating descriptor: ring set contains only out-of-bounds members".into(),
        ));
    }

    Ok(())
}

fn format_ring_set(set: &RingSet, size: usize) -> String {
    set.set_rings_in_size(size)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolves a savefile template and ring index to a concrete filename
/// (§4.4, §6). `-` always means standard output. Otherwise the basename
/// is split on its final `.`; a hidden file with no further extension
/// (`.hidden`) has no extension, matching GNU `basename`/`ext` semantics
/// rather than POSIX `basename`.
pub fn resolve_savefile_name(template: &str, idx: usize) -> String {
    if template == "-" {
        return "-".to_string();
    }

    let path = Path::new(template);
    let dir = path.parent();
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, ext) = split_extension(&filename);
    let base = if ext.is_empty() {
        format!("{stem}-{idx}")
    } else {
        format!("{stem}-{idx}.{ext}")
    };

    match dir {
        Some(d) if !d.as_os_str().is_empty() => d.join(base).to_string_lossy().into_owned(),
        _ => base,
    }
}

/// Splits `filename` into `(stem, extension)` on its last `.`. A dot at
/// position `0` (a dotfile with no further extension, e.g. `.hidden`)
/// yields an empty extension and the stem unaltered, matching the
/// original's GNU `ext()`/`noext()` (not POSIX `basename`).
fn split_extension(filename: &str) -> (String, String) {
    match filename.rfind('.') {
        None | Some(0) => (filename.to_string(), String::new()),
        Some(idx) => (filename[..idx].to_string(), filename[idx + 1..].to_string()),
    }
}
