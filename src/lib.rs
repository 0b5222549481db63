#![warn(missing_docs)]

//! `ibs-rs` provides a safe abstraction for AMD Instruction-Based
//! Sampling (IBS).
//!
//! IBS is part of the CPU hardware: at a configurable interval it
//! captures a detailed snapshot of one micro-operation's retirement ("op"
//! samples) or one instruction fetch ("fetch" samples) — instruction
//! pointer, data addresses, cache and TLB outcomes, latencies — letting a
//! profiler attribute micro-architectural behaviour to individual
//! instructions rather than to whole counters.
//!
//! The heart of the crate is the per-CPU sampling channel: a hardware
//! interrupt handler (the producer — non-preemptible, forbidden from
//! blocking or allocating) appends fixed-size records to a lock-free ring
//! buffer, and ordinary blocking consumers drain it through
//! [`Device::read`] and [`Device::poll_wait`]. Overflow is never an
//! error: a full buffer counts the dropped sample and moves on.
//!
//! An [`IbsContext`] owns every channel plus the capability and topology
//! descriptors supplied by the platform layer. Register access goes
//! through the [`Hardware`] trait; [`MockHardware`] implements it over an
//! in-memory register file for tests and host-side simulation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibs::{Capabilities, IbsContext, MockHardware, SamplerConfig, MemorySink, Topology};
//!
//! let hw = Arc::new(MockHardware::new());
//! let caps = Capabilities::OP_SAMPLING | Capabilities::OP_CNT_EXT;
//! let ctx = IbsContext::new(hw, caps, Topology::flat(4))?;
//!
//! let mut sampler = SamplerConfig::default()
//!     .max_cnt(0x4000)
//!     .poll_threshold(16)
//!     .open(&ctx)?;
//! sampler.enable_all()?;
//!
//! let mut sink = MemorySink::default();
//! sampler.collect(&mut sink)?;
//! #
//! # Ok::<(), ibs::error::Error>(())
//! ```

pub mod error;

pub mod buffer;
pub mod caps;
pub mod channel;
pub mod control;
pub mod device;
pub mod hw;
pub mod mock;
pub mod record;
pub mod registry;
pub mod sampler;

mod interrupt;
mod workarounds;

pub use self::caps::{Capabilities, Topology};
pub use self::device::{Device, PollStatus};
pub use self::hw::{Hardware, TaskSnapshot};
pub use self::interrupt::NmiStatus;
pub use self::mock::MockHardware;
pub use self::record::{FetchSample, OpSample, FETCH_SAMPLE_VERSION, OP_SAMPLE_VERSION};
pub use self::registry::{IbsContext, DEFAULT_BUFFER_SIZE};
pub use self::sampler::{BinaryDump, MemorySink, SampleSink, Sampler, SamplerConfig};

/// The two kinds of sample a CPU can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Samples taken around retirement of a micro-operation.
    Op,
    /// Samples taken around an instruction-fetch event.
    Fetch,
}

impl Flavor {
    /// Size in bytes of one sample record of this flavor.
    pub fn entry_size(&self) -> usize {
        match self {
            Flavor::Op => record::OpSample::SIZE,
            Flavor::Fetch => record::FetchSample::SIZE,
        }
    }

    /// The control register driving this flavor.
    pub(crate) fn ctl_msr(&self) -> u32 {
        match self {
            Flavor::Op => control::MSR_IBS_OP_CTL,
            Flavor::Fetch => control::MSR_IBS_FETCH_CTL,
        }
    }
}
