#![allow(missing_docs)]

//! In-memory hardware model.
//!
//! [`MockHardware`] implements [`Hardware`] over a plain MSR map, records
//! every register write and delay for later inspection, and offers
//! helpers to latch a pending sample the way the silicon would before an
//! interrupt fires. It is what the test suite (and any host-side
//! simulation) drives instead of ring-0 register access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::control::{
    IBS_FETCH_VAL, IBS_OP_VAL, MSR_IBS_DC_LIN_AD, MSR_IBS_FETCH_CTL, MSR_IBS_FETCH_LIN_AD,
    MSR_IBS_OP_CTL, MSR_IBS_OP_DATA, MSR_IBS_OP_RIP,
};
use crate::hw::{Hardware, TaskSnapshot};

/// One recorded register write, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrWrite {
    pub cpu: usize,
    pub msr: u32,
    pub value: u64,
    /// True if the write used the pipeline-flushing path.
    pub flushed: bool,
}

#[derive(Default)]
struct MsrFile {
    regs: std::collections::HashMap<(usize, u32), u64>,
    writes: Vec<MsrWrite>,
}

/// A deterministic, observable stand-in for the machine.
pub struct MockHardware {
    msrs: Mutex<MsrFile>,
    tsc: AtomicU64,
    delays_us: AtomicU64,
    task: Mutex<TaskSnapshot>,
}

impl Default for MockHardware {
    fn default() -> MockHardware {
        MockHardware::new()
    }
}

impl MockHardware {
    pub fn new() -> MockHardware {
        MockHardware {
            msrs: Mutex::new(MsrFile::default()),
            tsc: AtomicU64::new(1),
            delays_us: AtomicU64::new(0),
            task: Mutex::new(host_task()),
        }
    }

    /// Set the task snapshot returned for subsequent samples.
    pub fn set_task(&self, task: TaskSnapshot) {
        *self.task.lock().unwrap() = task;
    }

    /// Latch a pending op sample on `cpu`: populate the data registers and
    /// raise the valid bit, as the hardware does right before raising the
    /// sample interrupt.
    pub fn latch_op_sample(&self, cpu: usize, rip: u64, data: u64, lin_ad: u64) {
        let mut f = self.msrs.lock().unwrap();
        f.regs.insert((cpu, MSR_IBS_OP_RIP), rip);
        f.regs.insert((cpu, MSR_IBS_OP_DATA), data);
        f.regs.insert((cpu, MSR_IBS_DC_LIN_AD), lin_ad);
        let ctl = f.regs.entry((cpu, MSR_IBS_OP_CTL)).or_insert(0);
        *ctl |= IBS_OP_VAL;
    }

    /// Latch a pending fetch sample on `cpu`.
    pub fn latch_fetch_sample(&self, cpu: usize, lin_ad: u64) {
        let mut f = self.msrs.lock().unwrap();
        f.regs.insert((cpu, MSR_IBS_FETCH_LIN_AD), lin_ad);
        let ctl = f.regs.entry((cpu, MSR_IBS_FETCH_CTL)).or_insert(0);
        *ctl |= IBS_FETCH_VAL;
    }

    /// Every write performed so far, oldest first.
    pub fn writes(&self) -> Vec<MsrWrite> {
        self.msrs.lock().unwrap().writes.clone()
    }

    /// Writes targeting one register on one CPU, oldest first.
    pub fn writes_to(&self, cpu: usize, msr: u32) -> Vec<u64> {
        self.msrs
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.cpu == cpu && w.msr == msr)
            .map(|w| w.value)
            .collect()
    }

    /// Total microseconds spent in [`Hardware::delay_us`].
    pub fn delayed_us(&self) -> u64 {
        self.delays_us.load(Ordering::Relaxed)
    }
}

impl Hardware for MockHardware {
    fn rdmsr(&self, cpu: usize, msr: u32) -> u64 {
        *self
            .msrs
            .lock()
            .unwrap()
            .regs
            .get(&(cpu, msr))
            .unwrap_or(&0)
    }

    fn wrmsr(&self, cpu: usize, msr: u32, value: u64) {
        let mut f = self.msrs.lock().unwrap();
        f.regs.insert((cpu, msr), value);
        f.writes.push(MsrWrite {
            cpu,
            msr,
            value,
            flushed: false,
        });
    }

    fn wrmsr_flush(&self, cpu: usize, msr: u32, value: u64) {
        let mut f = self.msrs.lock().unwrap();
        f.regs.insert((cpu, msr), value);
        f.writes.push(MsrWrite {
            cpu,
            msr,
            value,
            flushed: true,
        });
    }

    fn delay_us(&self, us: u64) {
        self.delays_us.fetch_add(us, Ordering::Relaxed);
    }

    fn timestamp(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::Relaxed)
    }

    fn current_task(&self) -> TaskSnapshot {
        *self.task.lock().unwrap()
    }
}

/// Task snapshot describing the host process, so samples produced by the
/// mock carry plausible ids.
fn host_task() -> TaskSnapshot {
    TaskSnapshot {
        tid: host_tid(),
        pid: std::process::id() as i32,
        cr3: 0,
        kern_mode: false,
    }
}

#[cfg(target_os = "linux")]
fn host_tid() -> i32 {
    // No portable gettid in libc's safe surface; the raw syscall is stable.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn host_tid() -> i32 {
    std::process::id() as i32
}
