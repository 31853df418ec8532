//! Typed views over the ETMv4 trace registers.
//!
//! Every register the driver touches is modelled as a [`bitfield`] struct
//! with named fields, so field updates never disturb adjacent bits and no
//! shift amounts are computed by hand at the call sites. Registers that form
//! banks (resource selectors, counters, comparators) carry a `STRIDE` and
//! are addressed through [`EtmRegister::load_unit`]/[`EtmRegister::store_unit`].
//!
//! Offsets follow the Arm Embedded Trace Macrocell Architecture
//! Specification, ETMv4.0 to ETMv4.6.

use crate::memory::EtmMemory;

/// A register of the ETM trace unit.
///
/// Provides load/store of the whole register through an [`EtmMemory`], plus
/// unit-indexed access for banked registers.
pub trait EtmRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// Byte offset of the register (of unit 0 for banked registers).
    const OFFSET: u32;
    /// Architectural name, for diagnostics.
    const NAME: &'static str;
    /// Byte stride between consecutive units of a banked register.
    const STRIDE: u32 = 4;

    /// Read the register.
    fn load<M: EtmMemory>(mem: &mut M) -> Self {
        Self::from(mem.read_word(Self::OFFSET))
    }

    /// Read unit `unit` of a banked register.
    fn load_unit<M: EtmMemory>(mem: &mut M, unit: u8) -> Self {
        Self::from(mem.read_word(Self::OFFSET + Self::STRIDE * u32::from(unit)))
    }

    /// Write the register.
    fn store<M: EtmMemory>(&self, mem: &mut M) {
        mem.write_word(Self::OFFSET, self.clone().into());
    }

    /// Write unit `unit` of a banked register.
    fn store_unit<M: EtmMemory>(&self, mem: &mut M, unit: u8) {
        mem.write_word(
            Self::OFFSET + Self::STRIDE * u32::from(unit),
            self.clone().into(),
        );
    }
}

macro_rules! etm_register {
    (
        $(#[$attr:meta])*
        pub struct $name:ident(u32);
        $offset:literal, $reg_name:literal $(, stride = $stride:literal)?;
        $($fields:tt)*
    ) => {
        bitfield::bitfield! {
            $(#[$attr])*
            #[derive(Clone, Default)]
            pub struct $name(u32);
            impl Debug;
            $($fields)*
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(reg: $name) -> u32 {
                reg.0
            }
        }

        impl EtmRegister for $name {
            const OFFSET: u32 = $offset;
            const NAME: &'static str = $reg_name;
            $(const STRIDE: u32 = $stride;)?
        }
    };
}

etm_register! {
    /// Programming control. Setting `en` takes the unit out of the
    /// programming state and starts tracing.
    pub struct PrgCtrl(u32);
    0x004, "TRCPRGCTLR";
    pub en, set_en: 0;
}

etm_register! {
    /// Trace unit status.
    pub struct Stat(u32);
    0x00C, "TRCSTATR";
    pub idle, _: 0;
    pub pmstable, _: 1;
}

etm_register! {
    /// Trace configuration.
    pub struct Config(u32);
    0x010, "TRCCONFIGR";
    /// Branch broadcasting mode.
    pub bb, set_bb: 3;
    /// Cycle counting in instruction trace.
    pub cci, set_cci: 4;
    /// Conditional instruction tracing.
    pub cond, set_cond: 10, 8;
    /// Global timestamping.
    pub ts, set_ts: 11;
    /// Return stack enable.
    pub rs, set_rs: 12;
}

etm_register! {
    /// Event control 0: binds a resource (or resource pair) to each of the
    /// four event-packet positions.
    pub struct EventCtl0(u32);
    0x020, "TRCEVENTCTL0R";
    pub u8, sel0, set_sel0: 4, 0;
    pub type0, set_type0: 7;
    pub u8, sel1, set_sel1: 12, 8;
    pub type1, set_type1: 15;
    pub u8, sel2, set_sel2: 20, 16;
    pub type2, set_type2: 23;
    pub u8, sel3, set_sel3: 28, 24;
    pub type3, set_type3: 31;
}

impl EventCtl0 {
    /// Bind resource selector number `sel` to event-packet position
    /// `position`. `pair` marks `sel` as a selector-pair number.
    pub fn set_event(&mut self, position: u8, sel: u8, pair: bool) {
        let shift = 8 * u32::from(position);
        self.0 &= !(0xFFu32 << shift);
        self.0 |= u32::from(sel & 0x1F) << shift;
        if pair {
            self.0 |= 1u32 << (shift + 7);
        }
    }
}

etm_register! {
    /// Event control 1: enables event-packet generation per position.
    pub struct EventCtl1(u32);
    0x024, "TRCEVENTCTL1R";
    pub u8, insten, set_insten: 3, 0;
    /// ATB trigger enable.
    pub atb, set_atb: 11;
    pub lpoverride, set_lpoverride: 12;
}

etm_register! {
    /// Stall control.
    pub struct StallCtl(u32);
    0x02C, "TRCSTALLCTLR";
    pub u8, level, set_level: 3, 0;
    /// Instruction stall enable.
    pub istall, set_istall: 8;
    /// Data stall enable.
    pub dstall, set_dstall: 9;
    /// Trade invasiveness for overflow prevention.
    pub nooverflow, set_nooverflow: 13;
}

etm_register! {
    /// Synchronization period, as log2 of the bytes between sync packets.
    pub struct Syncp(u32);
    0x034, "TRCSYNCPR";
    pub u8, period, set_period: 4, 0;
}

etm_register! {
    /// Cycle count threshold.
    pub struct CcCtl(u32);
    0x038, "TRCCCCTLR";
    pub u16, threshold, set_threshold: 11, 0;
}

etm_register! {
    /// Branch broadcast control.
    pub struct BbCtl(u32);
    0x03C, "TRCBBCTLR";
    /// Address range comparator pairs the broadcast applies to.
    pub u8, range_mask, set_range_mask: 7, 0;
    /// Invert the range selection.
    pub invert, set_invert: 8;
}

etm_register! {
    /// Trace stream source ID.
    pub struct TraceId(u32);
    0x040, "TRCTRACEIDR";
    pub u8, traceid, set_traceid: 6, 0;
}

etm_register! {
    /// Instruction-view main control.
    pub struct ViCtl(u32);
    0x080, "TRCVICTLR";
    /// ViewInst event resource selector.
    pub u8, sel, set_sel: 7, 0;
    /// Start/stop logic state (started when set).
    pub ssstatus, set_ssstatus: 9;
    pub trcreset, set_trcreset: 10;
    pub trcerr, set_trcerr: 11;
    pub u8, exlevel_s, set_exlevel_s: 19, 16;
    pub u8, exlevel_ns, set_exlevel_ns: 23, 20;
}

etm_register! {
    /// Instruction-view include/exclude control. One include bit per
    /// address range comparator pair.
    pub struct ViIeCtl(u32);
    0x084, "TRCVIIECTLR";
    pub u8, include, set_include: 7, 0;
    pub u8, exclude, set_exclude: 23, 16;
}

etm_register! {
    /// Instruction-view start/stop control over single address comparators.
    pub struct VissCtl(u32);
    0x088, "TRCVISSCTLR";
    pub u8, start, set_start: 7, 0;
    pub u8, stop, set_stop: 23, 16;
}

etm_register! {
    /// External input selection: four byte lanes, each routing one
    /// event-bus number into an external input selector.
    pub struct ExtInSel(u32);
    0x120, "TRCEXTINSELR";
    pub u8, evt0, set_evt0: 7, 0;
    pub u8, evt1, set_evt1: 15, 8;
    pub u8, evt2, set_evt2: 23, 16;
    pub u8, evt3, set_evt3: 31, 24;
}

impl ExtInSel {
    /// Route `event_bus` into external input selector `selector`.
    pub fn set_event_bus(&mut self, selector: u8, event_bus: u8) {
        let shift = 8 * u32::from(selector);
        self.0 &= !(0xFFu32 << shift);
        self.0 |= u32::from(event_bus) << shift;
    }
}

etm_register! {
    /// Counter reload value bank.
    pub struct CntRldv(u32);
    0x140, "TRCCNTRLDVR", stride = 4;
    pub u16, value, set_value: 15, 0;
}

etm_register! {
    /// Counter control bank.
    pub struct CntCtl(u32);
    0x150, "TRCCNTCTLR", stride = 4;
    /// Resource selector whose firing decrements the counter.
    pub u8, cnt_event, set_cnt_event: 7, 0;
    pub u8, rld_event, set_rld_event: 15, 8;
    /// Reload from TRCCNTRLDVR when the counter reaches zero.
    pub self_reload, set_self_reload: 16;
    /// Chain to the preceding counter, forming one larger counter.
    pub chain, set_chain: 17;
}

etm_register! {
    /// Counter current value bank.
    pub struct CntVr(u32);
    0x160, "TRCCNTVR", stride = 4;
    pub u16, value, set_value: 15, 0;
}

etm_register! {
    /// ID register 8: maximum speculation depth.
    pub struct Idr8(u32);
    0x180, "TRCIDR8";
    pub maxspec, _: 31, 0;
}

etm_register! {
    /// ID register 0: implemented tracing features.
    pub struct Idr0(u32);
    0x1E0, "TRCIDR0";
    pub trcbb, _: 5;
    pub trccond, _: 6;
    pub retstack, _: 9;
}

etm_register! {
    /// ID register 3: cycle counting minimum and sync characteristics.
    pub struct Idr3(u32);
    0x1EC, "TRCIDR3";
    pub u16, ccimin, _: 11, 0;
    pub syncpr_fixed, _: 25;
    pub nooverflow, _: 31;
}

etm_register! {
    /// Resource selector control bank. Units 0 and 1 are the hardwired
    /// FALSE/TRUE resources and have no programmable control.
    pub struct RsCtl(u32);
    0x200, "TRCRSCTLR", stride = 4;
    pub u16, select, set_select: 15, 0;
    pub u8, group, set_group: 18, 16;
    pub inv, set_inv: 20;
    pub pairinv, set_pairinv: 21;
}

etm_register! {
    /// OS lock access. Writing zero clears the OS lock.
    pub struct OsLar(u32);
    0x300, "TRCOSLAR";
    pub oslk, set_oslk: 0;
}

etm_register! {
    /// OS lock status.
    pub struct OsLsr(u32);
    0x304, "TRCOSLSR";
    pub locked, _: 1;
}

etm_register! {
    /// Address comparator access type bank. The architectural register is
    /// 64 bits wide; all defined fields live in the low word.
    pub struct AddrCmpAccess(u32);
    0x480, "TRCACATR", stride = 8;
    pub u8, access_type, set_access_type: 1, 0;
    /// Qualify the comparator with context ID comparator 0.
    pub ctxid_match, set_ctxid_match: 2;
    /// Qualify the comparator with VMID comparator 0.
    pub vmid_match, set_vmid_match: 3;
}

etm_register! {
    /// Software lock access. Writing [`UNLOCK_MAGIC`] grants register access.
    pub struct Lar(u32);
    0xFB0, "TRCLAR";
    pub access, set_access: 31, 0;
}

etm_register! {
    /// Software lock status.
    pub struct Lsr(u32);
    0xFB4, "TRCLSR";
    pub lockexist, _: 0;
    pub lockgrant, _: 1;
    pub locktype, _: 2;
}

/// Value written to the software lock register to unlock the unit.
pub const UNLOCK_MAGIC: u32 = 0xC5AC_CE55;

/// Resource selector group, the GROUP field of [`RsCtl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RsGroup {
    /// External input selectors (PMU events routed via [`ExtInSel`]).
    ExternalInput = 0b000,
    /// Counters at zero and sequencer states. The only group where a
    /// selector observes two sub-resources at once.
    CounterSequencer = 0b010,
    /// Single address comparators.
    SingleAddress = 0b100,
    /// Address range comparator pairs.
    AddressRange = 0b101,
    /// Context ID comparators.
    ContextId = 0b110,
}

/// Base offset of the 64-bit address comparator value bank (stride 8).
pub const ADDR_CMP_VALUE_BASE: u32 = 0x400;
/// Base offset of the 64-bit context ID comparator value bank (stride 8).
pub const CTXID_CMP_VALUE_BASE: u32 = 0x600;
/// Base offset of the 64-bit VMID comparator value bank (stride 8).
pub const VMID_CMP_VALUE_BASE: u32 = 0x640;
/// Context ID comparator control 0.
pub const CTXID_CMP_CTRL0: u32 = 0x680;
/// Global timestamp event control, only ever zeroed by this layer.
pub const TS_CTRL: u32 = 0x030;

/// Number of address comparators in the architectural bank.
pub const ADDR_CMP_UNITS: u8 = 16;
/// Number of context ID / VMID comparators in the architectural bank.
pub const CTXID_CMP_UNITS: u8 = 8;
/// Number of resource selectors in the architectural bank.
pub const RS_UNITS: u8 = 32;
/// Number of counters in the architectural bank.
pub const COUNTER_UNITS: u8 = 4;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_ctl0_lane_programming() {
        let mut ev = EventCtl0::from(0);
        ev.set_event(0, 14, false);
        ev.set_event(3, 2, true);
        assert_eq!(ev.sel0(), 14);
        assert!(!ev.type0());
        assert_eq!(ev.sel3(), 2);
        assert!(ev.type3());
        assert_eq!(u32::from(ev), 0x8200_000E);
    }

    #[test]
    fn set_event_replaces_previous_binding() {
        let mut ev = EventCtl0::from(0);
        ev.set_event(1, 0x1F, true);
        ev.set_event(1, 3, false);
        assert_eq!(ev.sel1(), 3);
        assert!(!ev.type1());
    }

    #[test]
    fn ext_input_byte_lanes() {
        let mut sel = ExtInSel::from(0);
        sel.set_event_bus(2, 0x17);
        sel.set_event_bus(0, 0x4C);
        assert_eq!(sel.evt2(), 0x17);
        assert_eq!(sel.evt0(), 0x4C);
        assert_eq!(u32::from(sel), 0x0017_004C);
    }

    #[test]
    fn vi_ctl_default_encoding() {
        let mut vi = ViCtl::from(0);
        vi.set_sel(1);
        vi.set_ssstatus(true);
        assert_eq!(u32::from(vi), 0x201);
    }

    #[test]
    fn banked_register_offsets() {
        assert_eq!(RsCtl::OFFSET + RsCtl::STRIDE * 2, 0x208);
        assert_eq!(CntCtl::OFFSET + CntCtl::STRIDE, 0x154);
        assert_eq!(AddrCmpAccess::OFFSET + AddrCmpAccess::STRIDE * 3, 0x498);
    }
}
