//! The interrupt-context producer.
//!
//! Everything here runs synchronously inside the sample interrupt handler:
//! no sleeping, no allocation, no locks. Each pending sample is snapshotted
//! into a record, pushed into the channel's buffer (loss is counted, never
//! reported upward; there is no return path from interrupt context to a
//! reader), waiters are woken, and the channel is re-armed with a
//! re-randomised counter.
//!
//! Ordering within one CPU is strict: push, then wake, then re-arm, so a
//! freshly armed channel cannot fire again before the previous sample's
//! wakeup is issued.

use crate::caps::Capabilities;
use crate::channel::Channel;
use crate::control::{
    FetchCtl, OpCtl, MSR_IBS_BR_TARGET, MSR_IBS_DC_LIN_AD, MSR_IBS_DC_PHYS_AD, MSR_IBS_EXTD_CTL,
    MSR_IBS_FETCH_CTL, MSR_IBS_FETCH_LIN_AD, MSR_IBS_FETCH_PHYS_AD, MSR_IBS_OP_CTL,
    MSR_IBS_OP_DATA, MSR_IBS_OP_DATA2, MSR_IBS_OP_DATA3, MSR_IBS_OP_DATA4, MSR_IBS_OP_RIP,
};
use crate::hw::Hardware;
use crate::record::{FetchSample, OpSample};

/// Outcome of offering an interrupt to the sampling core.
///
/// The dispatcher must not claim an interrupt it did not cause: a
/// legitimate interrupt from another source would be suppressed and could
/// trip system-level spurious-interrupt safeguards further down the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmiStatus {
    /// No pending sample on this CPU; pass the interrupt on.
    NotHandled,
    /// This many pending samples (op and/or fetch) were consumed.
    Handled(u32),
}

/// Re-randomise the low four bits of the op counter start value.
///
/// Sampling every N-th op exactly would alias with loops whose length
/// divides N; scattering the start value breaks the correlation.
fn randomize_op_ctl(dev: &Channel, op_ctl: u64) -> u64 {
    let random_bits = u64::from(dev.next_random() & 0xf);
    (random_bits << 32) | (op_ctl & !(0xf_u64 << 32))
}

pub(crate) fn handle_op_event(hw: &dyn Hardware, dev: &Channel) {
    let cpu = dev.cpu();
    let caps = dev.caps();

    let mut sample = OpSample {
        op_ctl: hw.rdmsr(cpu, MSR_IBS_OP_CTL),
        op_rip: hw.rdmsr(cpu, MSR_IBS_OP_RIP),
        op_data: hw.rdmsr(cpu, MSR_IBS_OP_DATA),
        op_data2: hw.rdmsr(cpu, MSR_IBS_OP_DATA2),
        op_data3: hw.rdmsr(cpu, MSR_IBS_OP_DATA3),
        dc_lin_ad: hw.rdmsr(cpu, MSR_IBS_DC_LIN_AD),
        dc_phys_ad: hw.rdmsr(cpu, MSR_IBS_DC_PHYS_AD),
        ..Default::default()
    };
    if caps.contains(Capabilities::OP_DATA4) {
        sample.op_data4 = hw.rdmsr(cpu, MSR_IBS_OP_DATA4);
    }
    if caps.contains(Capabilities::BRN_TRGT) {
        sample.br_target = hw.rdmsr(cpu, MSR_IBS_BR_TARGET);
    }
    let task = hw.current_task();
    sample.tsc = hw.timestamp();
    sample.cr3 = task.cr3;
    sample.tid = task.tid;
    sample.pid = task.pid;
    sample.cpu = cpu as i32;
    sample.kern_mode = task.kern_mode as i32;

    if dev.buffer.try_push(sample.as_bytes()) {
        dev.wake_queues();
    }

    // Re-arm. The mirror is updated first so the next interrupt reads the
    // randomised value; no lock is needed, this CPU's handler is the only
    // writer while sampling is enabled.
    let ctl = randomize_op_ctl(dev, dev.ctl());
    dev.set_ctl(ctl);
    if caps.contains(Capabilities::WA_FAM15H_ERR_718) {
        // Erratum 718: the processor sets but never clears these bits.
        hw.wrmsr(cpu, MSR_IBS_OP_DATA3, 0);
    }
    hw.wrmsr(cpu, MSR_IBS_OP_CTL, ctl);
}

pub(crate) fn handle_fetch_event(hw: &dyn Hardware, dev: &Channel) {
    let cpu = dev.cpu();
    let caps = dev.caps();

    let mut sample = FetchSample {
        fetch_ctl: hw.rdmsr(cpu, MSR_IBS_FETCH_CTL),
        fetch_lin_ad: hw.rdmsr(cpu, MSR_IBS_FETCH_LIN_AD),
        fetch_phys_ad: hw.rdmsr(cpu, MSR_IBS_FETCH_PHYS_AD),
        ..Default::default()
    };
    if caps.contains(Capabilities::FETCH_CTL_EXTD) {
        sample.fetch_ctl_extd = hw.rdmsr(cpu, MSR_IBS_EXTD_CTL);
    }
    let task = hw.current_task();
    sample.tsc = hw.timestamp();
    sample.cr3 = task.cr3;
    sample.tid = task.tid;
    sample.pid = task.pid;
    sample.cpu = cpu as i32;
    sample.kern_mode = task.kern_mode as i32;

    if dev.buffer.try_push(sample.as_bytes()) {
        dev.wake_queues();
    }

    // The fetch valid bit reads as read-only but must be cleared before
    // the counter runs again; on Zen that takes zeroing the whole register
    // before writing the real control value back.
    hw.wrmsr(cpu, MSR_IBS_FETCH_CTL, 0);
    hw.wrmsr(cpu, MSR_IBS_FETCH_CTL, dev.ctl());
}

/// Check both flavors on `cpu` for a latched sample and service whatever
/// is pending. Runs in interrupt context.
pub(crate) fn handle_event(
    hw: &dyn Hardware,
    op_dev: &Channel,
    fetch_dev: &Channel,
    cpu: usize,
) -> NmiStatus {
    let mut handled = 0;

    let op_ctl = OpCtl::new(hw.rdmsr(cpu, MSR_IBS_OP_CTL), op_dev.op_cnt_ext());
    if op_ctl.valid() {
        handle_op_event(hw, op_dev);
        handled += 1;
    }

    let fetch_ctl = FetchCtl::new(hw.rdmsr(cpu, MSR_IBS_FETCH_CTL));
    if fetch_ctl.valid() {
        handle_fetch_event(hw, fetch_dev);
        handled += 1;
    }

    if handled == 0 {
        NmiStatus::NotHandled
    } else {
        NmiStatus::Handled(handled)
    }
}
