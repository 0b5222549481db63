//! Process-wide sampling context.
//!
//! The original driver kept its per-CPU device tables in globals; here the
//! whole thing is an explicit [`IbsContext`] value created at startup and
//! passed by reference, owning one op channel and one fetch channel per
//! possible CPU, the capability descriptor, the topology, and the
//! workaround state.

use std::sync::Arc;

use crate::caps::{Capabilities, Topology};
use crate::channel::Channel;
use crate::device::Device;
use crate::error::{new_error, Error, ErrorKind};
use crate::hw::Hardware;
use crate::interrupt::{handle_event, NmiStatus};
use crate::workarounds::Workarounds;
use crate::Flavor;

/// Default per-channel sample buffer size in bytes (256 pages).
pub const DEFAULT_BUFFER_SIZE: usize = 4096 << 8;

/// Owner of every sampling channel in the process, plus the capability,
/// topology and workaround state they share.
pub struct IbsContext {
    hw: Arc<dyn Hardware>,
    caps: Capabilities,
    topology: Topology,
    op: Vec<Channel>,
    fetch: Vec<Channel>,
    workarounds: Workarounds,
}

impl IbsContext {
    /// Build a context for every CPU in `topology`, with default-sized
    /// sample buffers.
    pub fn new(
        hw: Arc<dyn Hardware>,
        caps: Capabilities,
        topology: Topology,
    ) -> Result<IbsContext, Error> {
        IbsContext::with_buffer_size(hw, caps, topology, DEFAULT_BUFFER_SIZE)
    }

    /// [`new`], with an explicit initial buffer size per channel.
    ///
    /// [`new`]: IbsContext::new
    pub fn with_buffer_size(
        hw: Arc<dyn Hardware>,
        caps: Capabilities,
        topology: Topology,
        buffer_size: usize,
    ) -> Result<IbsContext, Error> {
        let num_cpus = topology.num_cpus();
        if num_cpus == 0 {
            return Err(new_error(ErrorKind::InvalidArgument));
        }

        let mut op = Vec::with_capacity(num_cpus);
        let mut fetch = Vec::with_capacity(num_cpus);
        for cpu in 0..num_cpus {
            op.push(Channel::new(cpu, Flavor::Op, caps, buffer_size)?);
            fetch.push(Channel::new(cpu, Flavor::Fetch, caps, buffer_size)?);
        }

        let workarounds = Workarounds::new(hw.as_ref(), &topology, caps);
        for cpu in 0..num_cpus {
            workarounds.start_static(hw.as_ref(), &topology, cpu);
        }

        Ok(IbsContext {
            hw,
            caps,
            topology,
            op,
            fetch,
            workarounds,
        })
    }

    /// Number of CPUs this context manages channels for.
    pub fn num_cpus(&self) -> usize {
        self.topology.num_cpus()
    }

    /// The capability descriptor supplied at construction.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub(crate) fn hw(&self) -> &dyn Hardware {
        self.hw.as_ref()
    }

    pub(crate) fn channel(&self, cpu: usize, flavor: Flavor) -> &Channel {
        match flavor {
            Flavor::Op => &self.op[cpu],
            Flavor::Fetch => &self.fetch[cpu],
        }
    }

    /// Claim the (cpu, flavor) channel for exclusive use.
    ///
    /// Restores default control values and empties the sample buffer, so a
    /// fresh consumer never sees a previous session's configuration or
    /// stale samples. Fails with `Busy` if another consumer holds the
    /// channel, `Unsupported` if this hardware lacks the flavor.
    pub fn open(&self, cpu: usize, flavor: Flavor) -> Result<Device<'_>, Error> {
        if cpu >= self.num_cpus() {
            return Err(new_error(ErrorKind::InvalidArgument));
        }
        if !self.caps.supports(flavor) {
            return Err(new_error(ErrorKind::Unsupported));
        }

        let dev = self.channel(cpu, flavor);
        dev.claim()?;

        let _guard = dev.ctl_lock.lock().unwrap();
        dev.set_defaults();
        dev.buffer.reset();
        Ok(Device::new(self, dev))
    }

    /// Offer a hardware sample interrupt on `cpu` to the sampling core.
    ///
    /// Called from the platform's interrupt dispatch; runs entirely in
    /// interrupt context. Returns [`NmiStatus::NotHandled`] when neither
    /// flavor has a sample latched so the caller can pass the interrupt
    /// down the chain.
    pub fn handle_interrupt(&self, cpu: usize) -> NmiStatus {
        if cpu >= self.num_cpus() {
            return NmiStatus::NotHandled;
        }
        handle_event(self.hw.as_ref(), &self.op[cpu], &self.fetch[cpu], cpu)
    }

    pub(crate) fn enable_channel(&self, dev: &Channel) {
        // Shared sibling registers must be in the workaround state before
        // the enable bit hits the hardware.
        self.workarounds
            .start_dynamic(self.hw(), &self.topology, dev.cpu());
        let msr = dev.flavor().ctl_msr();
        self.hw().wrmsr(dev.cpu(), msr, dev.ctl());
        log::debug!("cpu {} {:?}: sampling enabled", dev.cpu(), dev.flavor());
    }

    pub(crate) fn disable_channel(&self, dev: &Channel) {
        use crate::control::{IBS_OP_VAL, MSR_IBS_FETCH_CTL, MSR_IBS_OP_CTL};

        let cpu = dev.cpu();
        match dev.flavor() {
            Flavor::Op => {
                if self.caps.contains(Capabilities::WA_FAM10H_ERR_420) {
                    crate::workarounds::fam10h_err_420_prelude(self.hw(), cpu);
                }
                // A sample may already be latched with its valid bit set
                // while the interrupt is still in flight. Zeroing the
                // register outright would make that handler see
                // valid=false, mistake the interrupt for spurious, and
                // pass it down the chain. There is no atomic
                // read-modify-write on the register, so: force the valid
                // bit with everything else cleared, give the pending
                // interrupt a moment to arrive and be recognised as ours,
                // then fully clear. The fixed delay is an inherited
                // timing assumption, not a proven bound.
                self.hw().wrmsr(cpu, MSR_IBS_OP_CTL, IBS_OP_VAL);
                self.hw().delay_us(1);
                self.hw().wrmsr(cpu, MSR_IBS_OP_CTL, 0);
            }
            Flavor::Fetch => {
                self.hw().wrmsr(cpu, MSR_IBS_FETCH_CTL, 0);
            }
        }
        self.workarounds
            .stop_dynamic(self.hw(), &self.topology, cpu);
        log::debug!("cpu {} {:?}: sampling disabled", cpu, dev.flavor());
    }
}

impl Drop for IbsContext {
    fn drop(&mut self) {
        for cpu in 0..self.num_cpus() {
            self.workarounds
                .stop_static(self.hw.as_ref(), &self.topology, cpu);
        }
    }
}
