//! Erratum workarounds for specific CPU generations.
//!
//! Family 17h model 01h parts need bits flipped in configuration registers
//! shared between hyperthread siblings before sampling can run, and
//! restored once the last channel on the physical core is disabled. Those
//! read-modify-write sequences are not atomic, so every one of them runs
//! under a per-physical-core lock keyed through the topology table.
//!
//! Family 10h erratum 420 needs a register prelude before disabling op
//! sampling; the family 15h erratum 718 scrub lives in the interrupt path.

use std::sync::Mutex;

use crate::caps::{Capabilities, Topology};
use crate::control::{
    IBS_FETCH_EN, IBS_OP_EN, IBS_OP_MAX_CNT_OLD, IBS_OP_VAL, MSR_IBS_FETCH_CTL, MSR_IBS_OP_CTL,
};
use crate::hw::Hardware;

/// Sibling-shared configuration registers touched by the family 17h
/// workaround, and the bits flipped in each.
const FAM17H_MSR_WA_1: u32 = 0xc001_1020;
const FAM17H_MSR_WA_1_BITS: u64 = 0x40_0000_0000_0000;
const FAM17H_MSR_WA_2: u32 = 0xc001_1029;
const FAM17H_MSR_WA_2_BITS: u64 = 0x8_0000;
const FAM17H_MSR_WA_3: u32 = 0xc001_0296;
const FAM17H_MSR_WA_3_BITS: u64 = 0x40_4040;
/// Per-thread CPUID feature override register; bit 42 advertises IBS.
const CPUID_EXT_FEATURES: u32 = 0xc001_1005;
const CPUID_EXT_FEATURES_IBS: u64 = 1 << 42;

pub(crate) struct Workarounds {
    enabled: bool,
    /// One lock per logical CPU; all siblings of a physical core share the
    /// lock anchored at their first sibling.
    locks: Vec<Mutex<()>>,
    /// Register values observed at startup, restored on unwind. The
    /// hardware resets these identically on every core, so one saved copy
    /// serves the whole system.
    saved_wa1: u64,
    saved_wa2: u64,
    saved_wa3: u64,
}

impl Workarounds {
    pub(crate) fn new(hw: &dyn Hardware, topology: &Topology, caps: Capabilities) -> Workarounds {
        let enabled = caps.contains(Capabilities::WA_FAM17H_ZN);
        let (saved_wa1, saved_wa2, saved_wa3) = if enabled {
            (
                hw.rdmsr(0, FAM17H_MSR_WA_1),
                hw.rdmsr(0, FAM17H_MSR_WA_2),
                hw.rdmsr(0, FAM17H_MSR_WA_3),
            )
        } else {
            (0, 0, 0)
        };
        Workarounds {
            enabled,
            locks: (0..topology.num_cpus()).map(|_| Mutex::new(())).collect(),
            saved_wa1,
            saved_wa2,
            saved_wa3,
        }
    }

    /// True if any sibling of `cpu` currently has op or fetch sampling
    /// enabled in hardware. Caller holds the core lock.
    fn core_has_active_channel(
        &self,
        hw: &dyn Hardware,
        topology: &Topology,
        cpu: usize,
    ) -> bool {
        topology.siblings(cpu).any(|sibling| {
            let op_ctl = hw.rdmsr(sibling, MSR_IBS_OP_CTL);
            let fetch_ctl = hw.rdmsr(sibling, MSR_IBS_FETCH_CTL);
            op_ctl & IBS_OP_EN != 0 || fetch_ctl & IBS_FETCH_EN != 0
        })
    }

    /// Flip the shared registers into the sampling-safe state. Must run
    /// before the enable bit is written; a no-op if a sibling channel
    /// already enabled sampling (and therefore the workaround).
    pub(crate) fn start_dynamic(&self, hw: &dyn Hardware, topology: &Topology, cpu: usize) {
        if !self.enabled {
            return;
        }
        let anchor = topology.first_sibling(cpu);
        let _guard = self.locks[anchor].lock().unwrap();

        if self.core_has_active_channel(hw, topology, cpu) {
            return;
        }
        let cur1 = hw.rdmsr(anchor, FAM17H_MSR_WA_1);
        hw.wrmsr(anchor, FAM17H_MSR_WA_1, cur1 | FAM17H_MSR_WA_1_BITS);
        let cur3 = hw.rdmsr(anchor, FAM17H_MSR_WA_3);
        hw.wrmsr(anchor, FAM17H_MSR_WA_3, cur3 & !FAM17H_MSR_WA_3_BITS);
        log::debug!("cpu {}: shared-register workaround engaged", cpu);
    }

    /// Undo [`start_dynamic`] once no channel on the physical core is
    /// enabled any more.
    ///
    /// [`start_dynamic`]: Workarounds::start_dynamic
    pub(crate) fn stop_dynamic(&self, hw: &dyn Hardware, topology: &Topology, cpu: usize) {
        if !self.enabled {
            return;
        }
        let anchor = topology.first_sibling(cpu);
        let _guard = self.locks[anchor].lock().unwrap();

        if self.core_has_active_channel(hw, topology, cpu) {
            return;
        }
        let cur1 = hw.rdmsr(anchor, FAM17H_MSR_WA_1);
        hw.wrmsr(
            anchor,
            FAM17H_MSR_WA_1,
            (cur1 & !FAM17H_MSR_WA_1_BITS) | self.saved_wa1,
        );
        let cur3 = hw.rdmsr(anchor, FAM17H_MSR_WA_3);
        hw.wrmsr(
            anchor,
            FAM17H_MSR_WA_3,
            (cur3 | FAM17H_MSR_WA_3_BITS) | self.saved_wa3,
        );
        log::debug!("cpu {}: shared-register workaround released", cpu);
    }

    /// One-time per-CPU setup: advertise IBS through the CPUID override
    /// and set the per-core configuration bits, with a flushing write.
    pub(crate) fn start_static(&self, hw: &dyn Hardware, topology: &Topology, cpu: usize) {
        if !self.enabled {
            return;
        }
        let cur = hw.rdmsr(cpu, CPUID_EXT_FEATURES);
        hw.wrmsr(cpu, CPUID_EXT_FEATURES, cur | CPUID_EXT_FEATURES_IBS);

        // The remaining registers are per physical core; only the anchor
        // thread applies them.
        let anchor = topology.first_sibling(cpu);
        if anchor != cpu {
            return;
        }
        let cur = hw.rdmsr(anchor, FAM17H_MSR_WA_2);
        hw.wrmsr_flush(anchor, FAM17H_MSR_WA_2, cur | FAM17H_MSR_WA_2_BITS);
    }

    /// Tear down [`start_static`].
    ///
    /// [`start_static`]: Workarounds::start_static
    pub(crate) fn stop_static(&self, hw: &dyn Hardware, topology: &Topology, cpu: usize) {
        if !self.enabled {
            return;
        }
        let anchor = topology.first_sibling(cpu);
        if anchor == cpu {
            let cur = hw.rdmsr(anchor, FAM17H_MSR_WA_2);
            hw.wrmsr_flush(
                anchor,
                FAM17H_MSR_WA_2,
                self.saved_wa2 | (cur & !FAM17H_MSR_WA_2_BITS),
            );
        }
        let cur = hw.rdmsr(cpu, CPUID_EXT_FEATURES);
        hw.wrmsr(cpu, CPUID_EXT_FEATURES, cur & !CPUID_EXT_FEATURES_IBS);
    }
}

/// Family 10h erratum 420 prelude: before disabling op sampling, force the
/// valid bit on and clear the maximum count, so the dangling interrupt the
/// erratum describes cannot wedge the core.
pub(crate) fn fam10h_err_420_prelude(hw: &dyn Hardware, cpu: usize) {
    let old = hw.rdmsr(cpu, MSR_IBS_OP_CTL);
    hw.wrmsr(cpu, MSR_IBS_OP_CTL, (old | IBS_OP_VAL) & !IBS_OP_MAX_CNT_OLD);
}
