//! One ETM instance: session protocol and feature programmers.
//!
//! A caller unlocks and resets the instance, issues feature programmer
//! calls (each consuming resources from the instance's pools), then enables
//! the session. Programming order inside each feature matters: resources
//! are allocated first, registers are written second, and the event-packet
//! hookup comes last, because the selector logic evaluates combinationally
//! the moment the unit leaves the programming state. The typed index
//! wrappers ([`AddrCmpIndex`], [`RsIndex`], [`ExtSelIndex`]) only come out
//! of the pools, so a register write cannot precede its allocation.

use std::time::{Duration, Instant};

use crate::error::EtmError;
use crate::memory::EtmMemory;
use crate::registers::{
    AddrCmpAccess, BbCtl, CcCtl, CntCtl, CntRldv, CntVr, Config, EtmRegister, EventCtl0,
    EventCtl1, ExtInSel, Idr0, Idr3, Lar, OsLar, OsLsr, PrgCtrl, RsCtl, RsGroup, Stat, StallCtl,
    Syncp, TraceId, ViCtl, ViIeCtl, VissCtl, ADDR_CMP_UNITS, ADDR_CMP_VALUE_BASE,
    COUNTER_UNITS, CTXID_CMP_CTRL0, CTXID_CMP_UNITS, CTXID_CMP_VALUE_BASE, RS_UNITS, TS_CTRL,
    UNLOCK_MAGIC, VMID_CMP_VALUE_BASE,
};
use crate::resource::ResourcePools;

/// Number of independently tracked ETM instances.
pub const MAX_INSTANCES: u8 = 4;

/// Default deadline for the enable/disable status handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of event-packet positions in the trace stream.
const EVENT_POSITIONS: u8 = 4;

/// The hardwired always-true resource selector.
const RS_TRUE: RsIndex = RsIndex(1);

/// Session lifecycle of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Software lock engaged; register writes are ignored by the unit.
    Locked,
    /// Unlocked, not yet brought to a known register state.
    Unlocked,
    /// Reset to the documented baseline; ready for feature programming.
    Configured,
    /// Out of the programming state, producing trace.
    Enabled,
    /// Back in the programming state after a trace run.
    Disabled,
}

/// An allocated address comparator (or, for pairs, its even base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrCmpIndex(u8);

/// An allocated resource selector (or, for pairs, its even base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsIndex(u8);

/// An allocated external input selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtSelIndex(u8);

impl AddrCmpIndex {
    /// The comparator number inside the bank.
    pub fn number(self) -> u8 {
        self.0
    }
}

impl RsIndex {
    /// The selector number inside the bank.
    pub fn number(self) -> u8 {
        self.0
    }
}

impl ExtSelIndex {
    /// The selector number inside the bank.
    pub fn number(self) -> u8 {
        self.0
    }
}

/// Snapshot of the control/status registers, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtmStatus {
    /// PRGCTLR.EN readback.
    pub programming_enabled: bool,
    /// TRCSTATR.IDLE readback.
    pub idle: bool,
    /// TRCSTATR.PMSTABLE readback.
    pub pmstable: bool,
    /// Whether the OS lock is still set.
    pub os_locked: bool,
}

/// One Embedded Trace Macrocell instance.
///
/// Owns the register window and the four resource pools. All operations on
/// one instance must stay on a single logical thread of control; there is
/// no internal synchronization.
pub struct Etm<M: EtmMemory> {
    mem: M,
    index: u8,
    pools: ResourcePools,
    state: SessionState,
    handshake_timeout: Duration,
}

impl<M: EtmMemory> Etm<M> {
    /// Create an instance over an already-mapped register window.
    ///
    /// The instance starts [`SessionState::Locked`]; call
    /// [`unlock`](Self::unlock) and [`reset`](Self::reset) before
    /// programming any feature.
    pub fn new(mem: M, index: u8) -> Result<Self, EtmError> {
        if index >= MAX_INSTANCES {
            return Err(EtmError::InvalidInstanceIndex(index));
        }
        Ok(Etm {
            mem,
            index,
            pools: ResourcePools::new(index),
            state: SessionState::Locked,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// The instance index (0..=3).
    pub fn index(&self) -> u8 {
        self.index
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The instance's resource pools.
    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    /// Identity of the underlying register window.
    pub fn base_address(&self) -> usize {
        self.mem.base_address()
    }

    /// Replace the deadline for the enable/disable handshake.
    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = timeout;
    }

    /// Give the register window back, e.g. for unmapping at process exit.
    pub fn into_memory(self) -> M {
        self.mem
    }

    // --- session protocol -------------------------------------------------

    /// Release the software lock and the OS lock.
    ///
    /// No verification read-back is performed; TRCLSR stays readable for
    /// diagnostics.
    pub fn unlock(&mut self) {
        let mut lar = Lar::from(0);
        lar.set_access(UNLOCK_MAGIC);
        lar.store(&mut self.mem);
        OsLar::from(0).store(&mut self.mem);
        self.state = SessionState::Unlocked;
    }

    /// Bring every configurable register to a known baseline and restore
    /// all four resource pools to their initial watermarks.
    ///
    /// Defaults after reset: sync period `0b10100` (2^20 bytes), trace ID 1,
    /// instruction-view control `0x201` (ViewInst event = always-true
    /// resource, start/stop logic started).
    pub fn reset(&mut self) -> Result<(), EtmError> {
        if matches!(self.state, SessionState::Locked | SessionState::Enabled) {
            return Err(EtmError::InvalidState {
                operation: "reset",
                state: self.state,
            });
        }

        Config::from(0).store(&mut self.mem);
        EventCtl0::from(0).store(&mut self.mem);
        EventCtl1::from(0).store(&mut self.mem);
        StallCtl::from(0).store(&mut self.mem);
        self.mem.write_word(TS_CTRL, 0);

        let mut syncp = Syncp::from(0);
        syncp.set_period(0b10100);
        syncp.store(&mut self.mem);

        let mut id = TraceId::from(0);
        id.set_traceid(0x1);
        id.store(&mut self.mem);

        let mut vi = ViCtl::from(0);
        vi.set_sel(0x1);
        vi.set_ssstatus(true);
        vi.store(&mut self.mem);
        ViIeCtl::from(0).store(&mut self.mem);
        VissCtl::from(0).store(&mut self.mem);

        ExtInSel::from(0).store(&mut self.mem);

        // Selectors 0 and 1 are hardwired and have no control registers.
        for n in 2..RS_UNITS {
            RsCtl::from(0).store_unit(&mut self.mem, n);
        }

        for n in 0..ADDR_CMP_UNITS {
            self.mem
                .write_dword(ADDR_CMP_VALUE_BASE + 8 * u32::from(n), 0);
            self.mem
                .write_dword(AddrCmpAccess::OFFSET + 8 * u32::from(n), 0);
        }

        for n in 0..CTXID_CMP_UNITS {
            self.mem
                .write_dword(CTXID_CMP_VALUE_BASE + 8 * u32::from(n), 0);
            self.mem
                .write_dword(VMID_CMP_VALUE_BASE + 8 * u32::from(n), 0);
        }

        for n in 0..COUNTER_UNITS {
            CntCtl::from(0).store_unit(&mut self.mem, n);
            CntRldv::from(0).store_unit(&mut self.mem, n);
            CntVr::from(0).store_unit(&mut self.mem, n);
        }

        self.pools.reset_all();
        self.state = SessionState::Configured;
        tracing::debug!(instance = self.index, "trace unit reset to baseline");
        Ok(())
    }

    /// Leave the programming state and start tracing.
    ///
    /// Polls the status register until the unit reports it is no longer
    /// idle, bounded by the handshake deadline. Calling this while already
    /// enabled re-observes the same status bit and is harmless.
    pub fn enable(&mut self) -> Result<(), EtmError> {
        if self.state == SessionState::Locked {
            return Err(EtmError::InvalidState {
                operation: "enable",
                state: self.state,
            });
        }
        let mut ctrl = PrgCtrl::from(0);
        ctrl.set_en(true);
        ctrl.store(&mut self.mem);
        self.wait_for_idle(false)?;
        self.state = SessionState::Enabled;
        tracing::debug!(instance = self.index, "trace unit enabled");
        Ok(())
    }

    /// Re-enter the programming state, flushing the trace stream.
    ///
    /// Polls the status register until the unit reports idle, bounded by
    /// the handshake deadline. Disabling a unit that was never brought out
    /// of its lock is undefined by the architecture and is rejected.
    pub fn disable(&mut self) -> Result<(), EtmError> {
        if matches!(self.state, SessionState::Locked | SessionState::Unlocked) {
            return Err(EtmError::InvalidState {
                operation: "disable",
                state: self.state,
            });
        }
        PrgCtrl::from(0).store(&mut self.mem);
        self.wait_for_idle(true)?;
        self.state = SessionState::Disabled;
        tracing::debug!(instance = self.index, "trace unit disabled");
        Ok(())
    }

    /// Raw TRCSTATR.IDLE readback.
    pub fn is_idle(&mut self) -> bool {
        Stat::load(&mut self.mem).idle()
    }

    /// Control/status snapshot for diagnostics.
    pub fn status(&mut self) -> EtmStatus {
        let prg = PrgCtrl::load(&mut self.mem);
        let stat = Stat::load(&mut self.mem);
        let osl = OsLsr::load(&mut self.mem);
        EtmStatus {
            programming_enabled: prg.en(),
            idle: stat.idle(),
            pmstable: stat.pmstable(),
            os_locked: osl.locked(),
        }
    }

    /// Log the implementation characteristics the ID registers advertise.
    pub fn log_implementation_info(&mut self) {
        let id0 = Idr0::load(&mut self.mem);
        let id3 = Idr3::load(&mut self.mem);
        tracing::info!(
            instance = self.index,
            ccimin = id3.ccimin(),
            syncpr_fixed = id3.syncpr_fixed(),
            overflow_prevention = id3.nooverflow(),
            retstack = id0.retstack(),
            cond_trace = id0.trccond(),
            branch_broadcast = id0.trcbb(),
            "ETM implementation info",
        );
    }

    fn wait_for_idle(&mut self, wanted_idle: bool) -> Result<(), EtmError> {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if Stat::load(&mut self.mem).idle() == wanted_idle {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.handshake_timeout {
                return Err(EtmError::HandshakeTimeout {
                    wanted_idle,
                    waited,
                });
            }
            // Exponential backoff; the first transitions usually complete
            // within a few register reads.
            std::thread::sleep(Duration::from_micros(50 << attempt.min(8)));
            attempt += 1;
        }
    }

    // --- resource allocation ---------------------------------------------

    fn request_addr_cmp(&mut self) -> Result<AddrCmpIndex, EtmError> {
        self.pools.addr_cmp.allocate_single().map(AddrCmpIndex)
    }

    fn request_addr_cmp_pair(&mut self) -> Result<AddrCmpIndex, EtmError> {
        self.pools.addr_cmp.allocate_pair().map(AddrCmpIndex)
    }

    fn request_rs(&mut self) -> Result<RsIndex, EtmError> {
        self.pools.resource_sel.allocate_single().map(RsIndex)
    }

    fn request_rs_pair(&mut self) -> Result<RsIndex, EtmError> {
        self.pools.resource_sel.allocate_pair().map(RsIndex)
    }

    fn request_ext_sel(&mut self) -> Result<ExtSelIndex, EtmError> {
        self.pools.ext_input_sel.allocate_single().map(ExtSelIndex)
    }

    // --- register write helpers ------------------------------------------

    fn set_addr_cmp(&mut self, cmp: AddrCmpIndex, addr: u64, match_context: bool) {
        self.mem
            .write_dword(ADDR_CMP_VALUE_BASE + 8 * u32::from(cmp.0), addr);
        let mut access = AddrCmpAccess::load_unit(&mut self.mem, cmp.0);
        access.set_ctxid_match(match_context);
        access.set_vmid_match(false);
        access.store_unit(&mut self.mem, cmp.0);
    }

    fn set_resource_selector(
        &mut self,
        rs: RsIndex,
        group: RsGroup,
        primary: u8,
        secondary: Option<u8>,
        invert: bool,
        pair_invert: bool,
    ) {
        if rs.0 < 2 {
            tracing::warn!(
                selector = rs.0,
                "resource selectors 0 and 1 are hardwired; control write skipped"
            );
            return;
        }
        let mut ctl = RsCtl::load_unit(&mut self.mem, rs.0);
        let mut select = ctl.select() | 1 << primary;
        if group == RsGroup::CounterSequencer {
            if let Some(seq) = secondary {
                select |= 1 << (seq + 4);
            }
        }
        ctl.set_select(select);
        ctl.set_group(group as u8);
        ctl.set_inv(invert);
        ctl.set_pairinv(pair_invert);
        ctl.store_unit(&mut self.mem, rs.0);
    }

    /// Hook the resource indicated by `rs`/`pair` to the event-packet
    /// position `position`.
    fn hook_event_packet(&mut self, position: u8, rs: RsIndex, pair: bool) -> Result<(), EtmError> {
        if position >= EVENT_POSITIONS {
            return Err(EtmError::InvalidPacketPosition(position));
        }
        if !pair && rs.0 < 2 {
            tracing::warn!(
                selector = rs.0,
                position,
                "hardwired resource selector bound to an event position; \
                 make sure this is intended"
            );
        }
        let number = if pair { rs.0 / 2 } else { rs.0 };
        let mut ev0 = EventCtl0::load(&mut self.mem);
        ev0.set_event(position, number, pair);
        ev0.store(&mut self.mem);
        Ok(())
    }

    /// Enable event-packet generation at `position`.
    fn mark_event_position_active(&mut self, position: u8) {
        let mut ev1 = EventCtl1::load(&mut self.mem);
        ev1.set_insten(ev1.insten() | 1 << position);
        ev1.set_atb(false);
        ev1.store(&mut self.mem);
    }

    fn set_ext_input(&mut self, sel: ExtSelIndex, event_bus: u8) {
        let mut ext = ExtInSel::load(&mut self.mem);
        ext.set_event_bus(sel.0, event_bus);
        ext.store(&mut self.mem);
    }

    /// Split a 32-bit reload value across counters 0 and 1 and chain them.
    fn program_large_counter(&mut self, value: u32) {
        let low = value as u16;
        let high = (value >> 16) as u16;

        let mut cnt = CntVr::from(0);
        cnt.set_value(low);
        cnt.store_unit(&mut self.mem, 0);
        cnt.set_value(high);
        cnt.store_unit(&mut self.mem, 1);

        let mut rld = CntRldv::from(0);
        rld.set_value(low);
        rld.store_unit(&mut self.mem, 0);
        rld.set_value(high);
        rld.store_unit(&mut self.mem, 1);

        let mut ctl0 = CntCtl::load_unit(&mut self.mem, 0);
        ctl0.set_self_reload(true);
        ctl0.store_unit(&mut self.mem, 0);

        let mut ctl1 = CntCtl::load_unit(&mut self.mem, 1);
        ctl1.set_self_reload(true);
        ctl1.set_chain(true);
        ctl1.store_unit(&mut self.mem, 1);
    }

    /// Session-state guard for feature programmers. Rejecting programming
    /// outside `Unlocked`/`Configured` is a driver-level safety net; the
    /// architecture leaves the behavior undefined.
    fn ensure_programmable(&self, operation: &'static str) -> Result<(), EtmError> {
        match self.state {
            SessionState::Unlocked | SessionState::Configured => Ok(()),
            state => Err(EtmError::InvalidState { operation, state }),
        }
    }

    // --- feature programmers ---------------------------------------------

    /// Restrict instruction trace to the address range `start..end`.
    ///
    /// Consumes one address comparator pair. With `match_context` the range
    /// only matches while context ID comparator 0 matches (see
    /// [`filter_context_id`](Self::filter_context_id)).
    pub fn trace_address_range(
        &mut self,
        start: u64,
        end: u64,
        match_context: bool,
    ) -> Result<(), EtmError> {
        self.ensure_programmable("trace_address_range")?;
        let base = self.request_addr_cmp_pair()?;
        self.set_addr_cmp(base, start, match_context);
        self.set_addr_cmp(AddrCmpIndex(base.0 + 1), end, match_context);

        let mut vie = ViIeCtl::load(&mut self.mem);
        vie.set_include(vie.include() | 1 << (base.0 / 2));
        vie.store(&mut self.mem);
        tracing::debug!(
            instance = self.index,
            start,
            end,
            pair_base = base.0,
            "address range filter programmed"
        );
        Ok(())
    }

    /// Start tracing at `start` and stop at `stop`, using the
    /// instruction-view start/stop logic.
    ///
    /// Consumes two single address comparators, both context-qualified.
    pub fn trace_start_stop(&mut self, start: u64, stop: u64) -> Result<(), EtmError> {
        self.ensure_programmable("trace_start_stop")?;
        let start_cmp = self.request_addr_cmp()?;
        let stop_cmp = self.request_addr_cmp()?;
        self.set_addr_cmp(start_cmp, start, true);
        self.set_addr_cmp(stop_cmp, stop, true);

        // ViewInst event stays the always-true resource; the start/stop
        // logic begins in the stopped state.
        let mut vi = ViCtl::from(0);
        vi.set_sel(0x1);
        vi.store(&mut self.mem);

        let mut ss = VissCtl::load(&mut self.mem);
        ss.set_start(ss.start() | 1 << start_cmp.0);
        ss.set_stop(ss.stop() | 1 << stop_cmp.0);
        ss.store(&mut self.mem);
        Ok(())
    }

    /// Load `context_id` (typically the traced process ID) into context ID
    /// comparator 0 and clear its control.
    pub fn filter_context_id(&mut self, context_id: u64) -> Result<(), EtmError> {
        self.ensure_programmable("filter_context_id")?;
        self.mem.write_dword(CTXID_CMP_VALUE_BASE, context_id);
        self.mem.write_word(CTXID_CMP_CTRL0, 0);
        Ok(())
    }

    /// Route PMU event bus `event_bus` into the trace stream as event
    /// packets. Returns the event-packet position the event was bound to.
    ///
    /// Consumes one resource selector and one external input selector; the
    /// selector index doubles as the packet position.
    pub fn route_pmu_event(&mut self, event_bus: u8) -> Result<u8, EtmError> {
        self.ensure_programmable("route_pmu_event")?;
        let rs = self.request_rs()?;
        let ext = self.request_ext_sel()?;

        self.set_ext_input(ext, event_bus);
        self.set_resource_selector(rs, RsGroup::ExternalInput, ext.0, None, false, false);
        self.hook_event_packet(ext.0, rs, false)?;
        self.mark_event_position_active(ext.0);

        tracing::debug!(
            instance = self.index,
            event_bus,
            selector = ext.0,
            resource = rs.0,
            position = ext.0,
            "PMU event routed into trace stream"
        );
        Ok(ext.0)
    }

    /// Count occurrences of `event_bus` on counter 0, reloading with
    /// `reload` each time it reaches zero.
    ///
    /// Consumes one resource selector and one external input selector.
    pub fn count_events(&mut self, event_bus: u8, reload: u16) -> Result<(), EtmError> {
        self.ensure_programmable("count_events")?;
        let rs = self.request_rs()?;
        let ext = self.request_ext_sel()?;

        // Counter 0 decrements whenever the selector fires.
        let mut ctl = CntCtl::load_unit(&mut self.mem, 0);
        ctl.set_cnt_event(rs.0);
        ctl.store_unit(&mut self.mem, 0);

        let mut cnt = CntVr::from(0);
        cnt.set_value(reload);
        cnt.store_unit(&mut self.mem, 0);

        self.set_resource_selector(rs, RsGroup::ExternalInput, ext.0, None, false, false);
        self.set_ext_input(ext, event_bus);

        let mut ctl = CntCtl::load_unit(&mut self.mem, 0);
        ctl.set_self_reload(true);
        ctl.store_unit(&mut self.mem, 0);
        let mut rld = CntRldv::from(0);
        rld.set_value(reload);
        rld.store_unit(&mut self.mem, 0);

        tracing::debug!(
            instance = self.index,
            event_bus,
            reload,
            resource = rs.0,
            selector = ext.0,
            "single counter programmed"
        );
        Ok(())
    }

    /// Count occurrences of `event_bus` on the chained 32-bit counter
    /// formed by counters 0 and 1.
    ///
    /// Consumes one resource selector and one external input selector.
    /// Reading the counter while the unit is enabled may return unstable
    /// values.
    pub fn count_events_large(&mut self, event_bus: u8, reload: u32) -> Result<(), EtmError> {
        self.ensure_programmable("count_events_large")?;
        let rs = self.request_rs()?;
        let ext = self.request_ext_sel()?;

        let mut ctl = CntCtl::load_unit(&mut self.mem, 0);
        ctl.set_cnt_event(rs.0);
        ctl.store_unit(&mut self.mem, 0);

        self.set_resource_selector(rs, RsGroup::ExternalInput, ext.0, None, false, false);
        self.set_ext_input(ext, event_bus);
        self.program_large_counter(reload);
        Ok(())
    }

    /// Emit an event packet at `position` every `reload` occurrences of
    /// `event_bus`, using counter 0 alone.
    ///
    /// Consumes the resources of [`count_events`](Self::count_events) plus
    /// one resource selector monitoring counter-0-zero.
    pub fn fire_event_on_counter(
        &mut self,
        event_bus: u8,
        reload: u16,
        position: u8,
    ) -> Result<(), EtmError> {
        self.ensure_programmable("fire_event_on_counter")?;
        if position >= EVENT_POSITIONS {
            return Err(EtmError::InvalidPacketPosition(position));
        }
        self.count_events(event_bus, reload)?;

        let rs_fire = self.request_rs()?;
        self.set_resource_selector(rs_fire, RsGroup::CounterSequencer, 0, None, false, false);
        self.hook_event_packet(position, rs_fire, false)?;
        self.mark_event_position_active(position);
        Ok(())
    }

    /// Emit an event packet at `position` every `reload` occurrences of
    /// `event_bus`, using the chained 32-bit counter.
    ///
    /// Consumes one single resource selector (monitoring the event bus),
    /// one resource selector pair (AND of counter-0-zero and
    /// counter-1-zero) and one external input selector.
    pub fn fire_event_on_large_counter(
        &mut self,
        event_bus: u8,
        reload: u32,
        position: u8,
    ) -> Result<(), EtmError> {
        self.ensure_programmable("fire_event_on_large_counter")?;
        if position >= EVENT_POSITIONS {
            return Err(EtmError::InvalidPacketPosition(position));
        }
        let rs_bus = self.request_rs()?;
        let rs_pair = self.request_rs_pair()?;
        let ext = self.request_ext_sel()?;

        self.set_ext_input(ext, event_bus);
        self.set_resource_selector(rs_bus, RsGroup::ExternalInput, ext.0, None, false, false);

        self.program_large_counter(reload);

        // The low half decrements on the monitored event bus.
        let mut ctl = CntCtl::load_unit(&mut self.mem, 0);
        ctl.set_cnt_event(rs_bus.0);
        ctl.store_unit(&mut self.mem, 0);

        // The pair observes both counters; A and B combine, so it fires
        // only when the whole 32-bit counter wraps.
        self.set_resource_selector(rs_pair, RsGroup::CounterSequencer, 0, None, false, false);
        self.set_resource_selector(
            RsIndex(rs_pair.0 + 1),
            RsGroup::CounterSequencer,
            1,
            None,
            false,
            false,
        );

        self.hook_event_packet(position, rs_pair, true)?;
        self.mark_event_position_active(position);
        Ok(())
    }

    /// Emit event packets at `position` at the rate set by `reload`,
    /// decrementing the large counter on the always-true resource.
    ///
    /// Consumes one resource selector pair.
    pub fn rapid_fire_large_counter(&mut self, position: u8, reload: u32) -> Result<(), EtmError> {
        self.ensure_programmable("rapid_fire_large_counter")?;
        if position >= EVENT_POSITIONS {
            return Err(EtmError::InvalidPacketPosition(position));
        }
        let rs_pair = self.request_rs_pair()?;

        self.program_large_counter(reload);

        let mut ctl = CntCtl::load_unit(&mut self.mem, 0);
        ctl.set_cnt_event(RS_TRUE.0);
        ctl.store_unit(&mut self.mem, 0);

        self.set_resource_selector(rs_pair, RsGroup::CounterSequencer, 0, None, false, false);
        self.set_resource_selector(
            RsIndex(rs_pair.0 + 1),
            RsGroup::CounterSequencer,
            1,
            None,
            false,
            false,
        );

        self.hook_event_packet(position, rs_pair, true)?;
        self.mark_event_position_active(position);
        Ok(())
    }

    /// Bind the hardwired always-true resource to `position`, producing
    /// event packets at the maximum rate. Calibration aid.
    pub fn always_fire_event(&mut self, position: u8) -> Result<(), EtmError> {
        self.ensure_programmable("always_fire_event")?;
        self.hook_event_packet(position, RS_TRUE, false)?;
        self.mark_event_position_active(position);
        Ok(())
    }

    /// Emit an event packet whenever execution hits `addr`.
    ///
    /// Consumes one address comparator, one resource selector and one
    /// external input selector (whose index doubles as the packet
    /// position). Returns the position used.
    pub fn trace_single_address_match(&mut self, addr: u64) -> Result<u8, EtmError> {
        self.ensure_programmable("trace_single_address_match")?;
        let cmp = self.request_addr_cmp()?;
        let rs = self.request_rs()?;
        let ext = self.request_ext_sel()?;

        self.set_addr_cmp(cmp, addr, true);
        self.set_resource_selector(rs, RsGroup::SingleAddress, cmp.0, None, false, false);
        self.hook_event_packet(ext.0, rs, false)?;
        self.mark_event_position_active(ext.0);
        Ok(ext.0)
    }

    /// Enable cycle counting with the given threshold.
    ///
    /// When `threshold` is below the implementation's CCIMIN the request is
    /// refused with a warning and cycle counting stays disabled; this
    /// mirrors the hardware's own behavior of ignoring too-small values.
    pub fn set_cycle_counting(&mut self, threshold: u16) -> Result<(), EtmError> {
        self.ensure_programmable("set_cycle_counting")?;
        let ccimin = Idr3::load(&mut self.mem).ccimin();
        let mut config = Config::load(&mut self.mem);
        if threshold < ccimin {
            tracing::warn!(
                threshold,
                ccimin,
                "cycle count threshold below CCIMIN; cycle counting not enabled"
            );
            config.set_cci(false);
            config.store(&mut self.mem);
            return Ok(());
        }
        config.set_cci(true);
        config.store(&mut self.mem);
        let mut cc = CcCtl::from(0);
        cc.set_threshold(threshold);
        cc.store(&mut self.mem);
        Ok(())
    }

    /// Set the stall invasion level (0 disables stalling, 1..=15 trades
    /// target slowdown for overflow prevention).
    pub fn set_stall_level(&mut self, level: u8) -> Result<(), EtmError> {
        self.ensure_programmable("set_stall_level")?;
        let mut stall = StallCtl::load(&mut self.mem);
        if level != 0 {
            stall.set_istall(true);
            stall.set_nooverflow(true);
            stall.set_level(level & 0xF);
        } else {
            stall.set_istall(false);
            stall.set_nooverflow(false);
        }
        stall.store(&mut self.mem);
        Ok(())
    }

    /// Set the sync packet period (log2 of bytes between sync packets;
    /// 0 disables, valid values are `0b01000..=0b10100`).
    pub fn set_sync_period(&mut self, period: u8) -> Result<(), EtmError> {
        self.ensure_programmable("set_sync_period")?;
        let mut syncp = Syncp::from(0);
        syncp.set_period(period);
        syncp.store(&mut self.mem);
        Ok(())
    }

    /// Enable branch broadcasting over the address range comparator pairs
    /// selected by `range_mask`, optionally inverting the selection.
    pub fn set_branch_broadcast(&mut self, invert: bool, range_mask: u8) -> Result<(), EtmError> {
        self.ensure_programmable("set_branch_broadcast")?;
        let mut config = Config::load(&mut self.mem);
        config.set_bb(true);
        config.store(&mut self.mem);
        let mut bb = BbCtl::load(&mut self.mem);
        bb.set_invert(invert);
        bb.set_range_mask(bb.range_mask() | range_mask);
        bb.store(&mut self.mem);
        Ok(())
    }

    /// Program the chained 32-bit counter formed by counters 0 and 1 with
    /// `value` as both the initial and the self-reload value, without
    /// binding a decrement event.
    ///
    /// The large-counter programmers call this internally; it is public for
    /// callers that bind their own decrement source.
    pub fn set_large_counter(&mut self, value: u32) -> Result<(), EtmError> {
        self.ensure_programmable("set_large_counter")?;
        self.program_large_counter(value);
        Ok(())
    }

    /// Read back the chained 32-bit counter formed by counters 0 and 1.
    ///
    /// Only stable while the unit is in the programming state.
    pub fn large_counter_value(&mut self) -> u32 {
        let low = CntVr::load_unit(&mut self.mem, 0).value();
        let high = CntVr::load_unit(&mut self.mem, 1).value();
        u32::from(low) | (u32::from(high) << 16)
    }
}
