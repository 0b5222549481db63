#![allow(missing_docs)]

//! One sampling channel: a (cpu, flavor) pair.
//!
//! A [`Channel`] bundles the sample buffer with the mirrored control word,
//! the single-open flag, the poll threshold and the wait queues. The
//! control word lives in an atomic, not under the control mutex: the
//! interrupt producer re-reads and re-randomises it while re-arming and
//! can never take a lock, so the mutex only serialises consumer-side
//! read-modify-write sequences against each other.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::SampleBuffer;
use crate::caps::Capabilities;
use crate::control::{FetchCtl, OpCtl, IBS_FETCH_EN, IBS_OP_EN};
use crate::error::{new_error, Error, ErrorKind};
use crate::Flavor;

/// Default op counter maximum (instructions between samples).
pub const DEFAULT_OP_MAX_CNT: u64 = 0x4000;
/// Default fetch counter maximum.
pub const DEFAULT_FETCH_MAX_CNT: u64 = 0x1000;
/// Seed for the per-channel counter-randomisation generator.
const LFSR_SEED: u16 = 0xf00d;

/// A queue of contexts waiting on buffer state.
///
/// The producer notifies without taking the mutex (it must not block), so
/// waiters bound each wait with a short timeout and re-check their
/// predicate; a missed notification costs one timeout tick, never a hang.
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    fn new() -> WaitQueue {
        WaitQueue {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    /// Block until notified or `timeout` elapses.
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap();
        let _ = self.cond.wait_timeout(guard, timeout).unwrap();
    }
}

pub struct Channel {
    pub(crate) buffer: SampleBuffer,

    /// Mirror of the control word programmed into the hardware.
    ctl: AtomicU64,
    /// Serialises consumer-side control mutation. Distinct from the buffer
    /// read lock; never taken from interrupt context.
    pub(crate) ctl_lock: Mutex<()>,

    flavor: Flavor,
    cpu: usize,
    caps: Capabilities,

    in_use: AtomicBool,
    cancelled: AtomicBool,
    poll_threshold: AtomicUsize,

    /// Producer-only LFSR state for op counter re-randomisation.
    rand_state: AtomicU16,

    pub(crate) readq: WaitQueue,
    pub(crate) pollq: WaitQueue,
}

impl Channel {
    pub(crate) fn new(
        cpu: usize,
        flavor: Flavor,
        caps: Capabilities,
        buffer_size: usize,
    ) -> Result<Channel, Error> {
        let buffer = SampleBuffer::new(buffer_size, flavor.entry_size())?;
        let dev = Channel {
            buffer,
            ctl: AtomicU64::new(0),
            ctl_lock: Mutex::new(()),
            flavor,
            cpu,
            caps,
            in_use: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            poll_threshold: AtomicUsize::new(1),
            rand_state: AtomicU16::new(LFSR_SEED),
            readq: WaitQueue::new(),
            pollq: WaitQueue::new(),
        };
        dev.set_defaults();
        Ok(dev)
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn caps(&self) -> Capabilities {
        self.caps
    }

    pub(crate) fn op_cnt_ext(&self) -> bool {
        self.caps.contains(Capabilities::OP_CNT_EXT)
    }

    /// Current control word mirror.
    pub(crate) fn ctl(&self) -> u64 {
        self.ctl.load(Ordering::Acquire)
    }

    pub(crate) fn set_ctl(&self, ctl: u64) {
        self.ctl.store(ctl, Ordering::Release);
    }

    /// Whether sampling is enabled, from the mirrored enable bit.
    pub fn enabled(&self) -> bool {
        let ctl = self.ctl();
        match self.flavor {
            Flavor::Op => ctl & IBS_OP_EN != 0,
            Flavor::Fetch => ctl & IBS_FETCH_EN != 0,
        }
    }

    /// Restore default control values: op sampling every `0x4000` ops
    /// counting ops (not cycles), fetch sampling every `0x1000` fetches
    /// with counter randomisation on, poll threshold of one sample.
    pub(crate) fn set_defaults(&self) {
        self.poll_threshold.store(1, Ordering::Relaxed);
        let ctl = match self.flavor {
            Flavor::Op => {
                let mut ctl = OpCtl::new(0, self.op_cnt_ext());
                ctl.set_cur_cnt(0);
                ctl.set_max_cnt(DEFAULT_OP_MAX_CNT);
                ctl.set_cnt_ctl(true);
                ctl.raw()
            }
            Flavor::Fetch => {
                let mut ctl = FetchCtl::new(0);
                ctl.set_rand_en(true);
                ctl.set_cnt(0);
                ctl.set_max_cnt(DEFAULT_FETCH_MAX_CNT);
                ctl.raw()
            }
        };
        self.set_ctl(ctl);
    }

    /// Claim exclusive use of the channel.
    pub(crate) fn claim(&self) -> Result<(), Error> {
        if self.in_use.swap(true, Ordering::AcqRel) {
            return Err(new_error(ErrorKind::Busy));
        }
        self.cancelled.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn release_claim(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub(crate) fn poll_threshold(&self) -> usize {
        self.poll_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_poll_threshold(&self, threshold: usize) {
        self.poll_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Advance the 16-bit LFSR and return its new value.
    ///
    /// Only the producer touches this state, one sample at a time, so a
    /// plain load/store pair is race-free by protocol.
    pub(crate) fn next_random(&self) -> u16 {
        let value = self.rand_state.load(Ordering::Relaxed);
        let bit = (value ^ (value >> 2) ^ (value >> 3) ^ (value >> 5)) & 1;
        let next = (value >> 1) | (bit << 15);
        self.rand_state.store(next, Ordering::Relaxed);
        next
    }

    /// Wake blocked readers, and pollers once the threshold is crossed.
    /// Called from producer context; must not block.
    pub(crate) fn wake_queues(&self) {
        self.readq.notify();
        if self.buffer.occupancy() >= self.poll_threshold() {
            self.pollq.notify();
        }
    }

    /// Cancel all in-progress blocking waits on this channel; they return
    /// `Interrupted`. Sticky until the channel is reopened.
    pub fn cancel_waiters(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.readq.notify();
        self.pollq.notify();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Block until the buffer has data, the channel is disabled, the wait
    /// is cancelled, or `deadline` passes.
    pub(crate) fn wait_readable(&self, deadline: Option<Instant>) -> Result<(), Error> {
        const TICK: Duration = Duration::from_millis(10);
        loop {
            if self.is_cancelled() {
                return Err(new_error(ErrorKind::Interrupted));
            }
            if self.buffer.occupancy() > 0 || !self.enabled() {
                return Ok(());
            }
            let tick = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(());
                    }
                    TICK.min(d - now)
                }
                None => TICK,
            };
            self.readq.wait_timeout(tick);
        }
    }
}
