//! The seam between the sampling core and the machine.
//!
//! Everything the driver core does to the hardware goes through this
//! trait: model-specific register access, the short spin delay used by the
//! disable sequence, and snapshots of the clock and the interrupted task.
//! Production use supplies a privileged implementation; tests inject
//! [`MockHardware`].
//!
//! [`MockHardware`]: crate::mock::MockHardware

/// Metadata about the task running when a sample fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Thread id.
    pub tid: i32,
    /// Process id (thread group).
    pub pid: i32,
    /// Page table base register of the interrupted address space.
    pub cr3: u64,
    /// True if the sample interrupted kernel-mode execution.
    pub kern_mode: bool,
}

/// Register-level access to one machine.
///
/// Implementations must tolerate calls from the interrupt path: `rdmsr`
/// and `wrmsr` on the current CPU, `timestamp`, `current_task` and
/// `delay_us` may all execute in non-preemptible context and must not
/// block or allocate.
pub trait Hardware: Send + Sync {
    /// Read a model-specific register on the given CPU.
    fn rdmsr(&self, cpu: usize, msr: u32) -> u64;

    /// Write a model-specific register on the given CPU.
    fn wrmsr(&self, cpu: usize, msr: u32, value: u64);

    /// Write a model-specific register after flushing the pipeline and
    /// caches. Some workaround registers require the heavyweight write.
    fn wrmsr_flush(&self, cpu: usize, msr: u32, value: u64) {
        self.wrmsr(cpu, msr, value);
    }

    /// Spin for the given number of microseconds.
    ///
    /// The disable sequence leans on this to bound the window in which an
    /// in-flight interrupt can still arrive; the delay is a best-effort
    /// timing assumption inherited from the hardware erratum, not a proven
    /// bound.
    fn delay_us(&self, us: u64);

    /// Current value of the timestamp counter.
    fn timestamp(&self) -> u64;

    /// Snapshot of the task running on the current CPU.
    fn current_task(&self) -> TaskSnapshot;
}
