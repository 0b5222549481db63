//! Per-channel consumer endpoint: read, poll and the control surface.
//!
//! [`Device`] is the user-facing handle over one claimed channel. The
//! numbered command constants and their semantics mirror the established
//! control interface byte for byte, so existing decoder and monitor
//! tooling keeps working: `SET_CUR_CNT` and `SET_CNT` deliberately alias
//! each other across flavors, `GET_LOST` reads and clears, `SET_*`
//! commands fail with `Busy` while sampling is enabled.

use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::control::{FetchCtl, OpCtl};
use crate::error::{new_error, Error, ErrorKind};
use crate::registry::IbsContext;
use crate::Flavor;

/// Activate sampling.
pub const IBS_ENABLE: u32 = 0x0;
/// Deactivate sampling; buffered samples stay readable.
pub const IBS_DISABLE: u32 = 0x1;
/// Set the op counter start value. On fetch channels, aliases `SET_CNT`.
pub const SET_CUR_CNT: u32 = 0x2;
/// Get the counter start value (not the live count).
pub const GET_CUR_CNT: u32 = 0x3;
/// Set the fetch counter value. On op channels, aliases `SET_CUR_CNT`.
pub const SET_CNT: u32 = 0x4;
/// Get the counter value.
pub const GET_CNT: u32 = 0x5;
/// Set the counter maximum (sampling period).
pub const SET_MAX_CNT: u32 = 0x6;
/// Get the counter maximum.
pub const GET_MAX_CNT: u32 = 0x7;
/// Op channels only: 1 counts dispatched ops, 0 counts cycles.
pub const SET_CNT_CTL: u32 = 0x8;
/// Get the op counter control value.
pub const GET_CNT_CTL: u32 = 0x9;
/// Fetch channels only: enable counter randomisation.
pub const SET_RAND_EN: u32 = 0xa;
/// Get the fetch randomisation enable value.
pub const GET_RAND_EN: u32 = 0xb;
/// Minimum buffered samples (records, not bytes) before poll reports
/// readiness.
pub const SET_POLL_SIZE: u32 = 0xc;
/// Get the poll threshold.
pub const GET_POLL_SIZE: u32 = 0xd;
/// Resize the sample buffer (bytes). Sampling must be disabled.
pub const SET_BUFFER_SIZE: u32 = 0xe;
/// Get the sample buffer size in bytes.
pub const GET_BUFFER_SIZE: u32 = 0xf;
/// Drop all buffered samples.
pub const RESET_BUFFER: u32 = 0x10;
/// Read and clear the dropped-sample counter.
pub const GET_LOST: u32 = 0xee;
/// Log the raw buffer state for diagnosis.
pub const DEBUG_BUFFER: u32 = 0xef;
/// Number of samples immediately available to read.
pub const FIONREAD: u32 = 0x541b;

/// Result of polling a channel for readable samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Occupancy has reached the poll threshold.
    Ready,
    /// Below threshold, channel still enabled; more samples may arrive.
    NotReady,
    /// Below threshold and the channel is disabled: nothing further will
    /// arrive, stop waiting.
    HangUp,
}

/// Exclusive handle to one sampling channel.
///
/// Dropping the handle disables sampling, restores defaults and empties
/// the buffer, then releases the channel for the next consumer.
pub struct Device<'a> {
    ctx: &'a IbsContext,
    dev: &'a Channel,
}

impl std::fmt::Debug for Device<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("cpu", &self.dev.cpu())
            .field("flavor", &self.dev.flavor())
            .finish_non_exhaustive()
    }
}

impl<'a> Device<'a> {
    pub(crate) fn new(ctx: &'a IbsContext, dev: &'a Channel) -> Device<'a> {
        Device { ctx, dev }
    }

    /// The CPU this device samples.
    pub fn cpu(&self) -> usize {
        self.dev.cpu()
    }

    /// The sample flavor this device carries.
    pub fn flavor(&self) -> Flavor {
        self.dev.flavor()
    }

    /// Whether sampling is currently enabled.
    pub fn enabled(&self) -> bool {
        self.dev.enabled()
    }

    /// Size of one sample record on this channel, in bytes.
    pub fn entry_size(&self) -> usize {
        self.dev.buffer.entry_size()
    }

    /// Drain buffered samples into `dest`.
    ///
    /// `dest` must hold at least one record and no more than the buffer
    /// size (`InvalidArgument` otherwise); the copy length rounds down to
    /// whole records. An empty buffer on a disabled channel returns
    /// `Ok(0)` — end of data, not an error. With `blocking` unset an empty
    /// buffer returns `WouldBlock`; otherwise the call suspends until
    /// samples arrive, the channel is disabled, or the wait is cancelled
    /// (`Interrupted` — retry).
    pub fn read(&self, dest: &mut [u8], blocking: bool) -> Result<usize, Error> {
        let entry_size = self.dev.buffer.entry_size();
        if dest.len() < entry_size || dest.len() > self.dev.buffer.size() {
            return Err(new_error(ErrorKind::InvalidArgument));
        }
        let count = dest.len() - dest.len() % entry_size;

        // A wakeup does not guarantee data: another reader may drain the
        // buffer first. Single-open makes that theoretical, but loop
        // anyway and re-check after every wait.
        loop {
            let n = self.dev.buffer.pop_into(&mut dest[..count]);
            if n > 0 {
                return Ok(n);
            }
            if !self.dev.enabled() {
                return Ok(0);
            }
            if !blocking {
                return Err(new_error(ErrorKind::WouldBlock));
            }
            self.dev.wait_readable(None)?;
        }
    }

    /// Non-blocking readiness check against the poll threshold.
    pub fn poll(&self) -> PollStatus {
        if self.dev.buffer.occupancy() >= self.dev.poll_threshold() {
            return PollStatus::Ready;
        }
        if !self.dev.enabled() {
            return PollStatus::HangUp;
        }
        PollStatus::NotReady
    }

    /// [`poll`], waiting up to `timeout` for the threshold to be crossed
    /// or the channel to hang up.
    ///
    /// [`poll`]: Device::poll
    pub fn poll_wait(&self, timeout: Duration) -> PollStatus {
        const TICK: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.poll();
            if status != PollStatus::NotReady || self.dev.is_cancelled() {
                return status;
            }
            let now = Instant::now();
            if now >= deadline {
                return PollStatus::NotReady;
            }
            self.dev.pollq.wait_timeout(TICK.min(deadline - now));
        }
    }

    /// Cancel blocked readers and pollers on this channel.
    pub fn cancel_waiters(&self) {
        self.dev.cancel_waiters();
    }

    /// Number of samples immediately available.
    pub fn occupancy(&self) -> usize {
        self.dev.buffer.occupancy()
    }

    /// Read and clear the dropped-sample counter.
    pub fn lost_and_clear(&self) -> usize {
        self.dev.buffer.lost_and_clear()
    }

    /// Activate sampling with the configured control values.
    pub fn enable(&self) -> Result<(), Error> {
        self.control(IBS_ENABLE, 0).map(|_| ())
    }

    /// Deactivate sampling; buffered samples stay readable until drained.
    pub fn disable(&self) -> Result<(), Error> {
        self.control(IBS_DISABLE, 0).map(|_| ())
    }

    /// Set the counter maximum (the sampling period).
    pub fn set_max_cnt(&self, max_cnt: u64) -> Result<(), Error> {
        self.control(SET_MAX_CNT, max_cnt).map(|_| ())
    }

    /// Set the poll readiness threshold, in samples.
    pub fn set_poll_threshold(&self, samples: u64) -> Result<(), Error> {
        self.control(SET_POLL_SIZE, samples).map(|_| ())
    }

    /// Issue a numbered control command.
    ///
    /// Unknown commands fail with `Unsupported`. Any `SET_*` command and
    /// `RESET_BUFFER` fail with `Busy` while sampling is enabled: control
    /// values and buffer geometry must never change underneath the
    /// interrupt producer.
    pub fn control(&self, cmd: u32, arg: u64) -> Result<u64, Error> {
        let dev = self.dev;

        // Lock-free commands first.
        match cmd {
            DEBUG_BUFFER => {
                dev.buffer.log_state(dev.cpu());
                return Ok(0);
            }
            GET_LOST => return Ok(dev.buffer.lost_and_clear() as u64),
            FIONREAD => return Ok(dev.buffer.occupancy() as u64),
            _ => {}
        }

        let _guard = dev.ctl_lock.lock().unwrap();

        if mutates_configuration(cmd) && dev.enabled() {
            return Err(new_error(ErrorKind::Busy));
        }

        match cmd {
            IBS_ENABLE => {
                match dev.flavor() {
                    Flavor::Op => {
                        let mut ctl = OpCtl::new(dev.ctl(), dev.op_cnt_ext());
                        ctl.set_enabled(true);
                        dev.set_ctl(ctl.raw());
                    }
                    Flavor::Fetch => {
                        let mut ctl = FetchCtl::new(dev.ctl());
                        ctl.set_enabled(true);
                        dev.set_ctl(ctl.raw());
                    }
                }
                self.ctx.enable_channel(dev);
                Ok(0)
            }
            IBS_DISABLE => {
                self.ctx.disable_channel(dev);
                match dev.flavor() {
                    Flavor::Op => {
                        let mut ctl = OpCtl::new(dev.ctl(), dev.op_cnt_ext());
                        ctl.set_enabled(false);
                        dev.set_ctl(ctl.raw());
                    }
                    Flavor::Fetch => {
                        let mut ctl = FetchCtl::new(dev.ctl());
                        ctl.set_enabled(false);
                        dev.set_ctl(ctl.raw());
                    }
                }
                // Readers blocked on an enabled-but-idle channel must
                // re-check and observe end-of-data.
                dev.readq.notify();
                dev.pollq.notify();
                Ok(0)
            }
            // The two counter commands are intentionally dual-purpose:
            // each flavor has one counter start field, and either command
            // addresses it.
            SET_CUR_CNT | SET_CNT => {
                match dev.flavor() {
                    Flavor::Op => {
                        let mut ctl = OpCtl::new(dev.ctl(), dev.op_cnt_ext());
                        ctl.set_cur_cnt(arg);
                        dev.set_ctl(ctl.raw());
                    }
                    Flavor::Fetch => {
                        let mut ctl = FetchCtl::new(dev.ctl());
                        ctl.set_cnt(arg);
                        dev.set_ctl(ctl.raw());
                    }
                }
                Ok(0)
            }
            GET_CUR_CNT | GET_CNT => Ok(match dev.flavor() {
                Flavor::Op => OpCtl::new(dev.ctl(), dev.op_cnt_ext()).cur_cnt(),
                Flavor::Fetch => FetchCtl::new(dev.ctl()).cnt(),
            }),
            SET_MAX_CNT => {
                match dev.flavor() {
                    Flavor::Op => {
                        let mut ctl = OpCtl::new(dev.ctl(), dev.op_cnt_ext());
                        ctl.set_max_cnt(arg);
                        dev.set_ctl(ctl.raw());
                    }
                    Flavor::Fetch => {
                        let mut ctl = FetchCtl::new(dev.ctl());
                        ctl.set_max_cnt(arg);
                        dev.set_ctl(ctl.raw());
                    }
                }
                Ok(0)
            }
            GET_MAX_CNT => Ok(match dev.flavor() {
                Flavor::Op => OpCtl::new(dev.ctl(), dev.op_cnt_ext()).max_cnt(),
                Flavor::Fetch => FetchCtl::new(dev.ctl()).max_cnt(),
            }),
            SET_CNT_CTL => {
                if dev.flavor() != Flavor::Op || arg > 1 {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                let mut ctl = OpCtl::new(dev.ctl(), dev.op_cnt_ext());
                ctl.set_cnt_ctl(arg == 1);
                dev.set_ctl(ctl.raw());
                Ok(0)
            }
            GET_CNT_CTL => {
                if dev.flavor() != Flavor::Op {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                Ok(OpCtl::new(dev.ctl(), dev.op_cnt_ext()).cnt_ctl() as u64)
            }
            SET_RAND_EN => {
                if dev.flavor() != Flavor::Fetch || arg > 1 {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                let mut ctl = FetchCtl::new(dev.ctl());
                ctl.set_rand_en(arg == 1);
                dev.set_ctl(ctl.raw());
                Ok(0)
            }
            GET_RAND_EN => {
                if dev.flavor() != Flavor::Fetch {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                Ok(FetchCtl::new(dev.ctl()).rand_en() as u64)
            }
            SET_POLL_SIZE => {
                let capacity = dev.buffer.capacity() as u64;
                if arg == 0 || arg >= capacity {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                dev.set_poll_threshold(arg as usize);
                Ok(0)
            }
            GET_POLL_SIZE => Ok(dev.poll_threshold() as u64),
            SET_BUFFER_SIZE => {
                let entry_size = dev.buffer.entry_size() as u64;
                if arg < entry_size {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                // No reallocation when the size is unchanged.
                if arg as usize == dev.buffer.size() {
                    dev.buffer.reset();
                    return Ok(0);
                }
                dev.buffer.realloc(arg as usize).map_err(|e| {
                    log::warn!(
                        "failed to set {:?} cpu {} buffer size to {}; leaving buffer unchanged",
                        dev.flavor(),
                        dev.cpu(),
                        arg
                    );
                    e
                })?;
                Ok(0)
            }
            GET_BUFFER_SIZE => Ok(dev.buffer.size() as u64),
            RESET_BUFFER => {
                dev.buffer.reset();
                Ok(0)
            }
            _ => Err(new_error(ErrorKind::Unsupported)),
        }
    }
}

/// Commands that mutate control values or buffer geometry, all of which
/// require sampling to be disabled.
fn mutates_configuration(cmd: u32) -> bool {
    matches!(
        cmd,
        SET_CUR_CNT
            | SET_CNT
            | SET_MAX_CNT
            | SET_CNT_CTL
            | SET_RAND_EN
            | SET_POLL_SIZE
            | SET_BUFFER_SIZE
            | RESET_BUFFER
    )
}

impl<'a> Drop for Device<'a> {
    fn drop(&mut self) {
        let _guard = self.dev.ctl_lock.lock().unwrap();
        self.ctx.disable_channel(self.dev);
        self.dev.set_defaults();
        self.dev.buffer.reset();
        self.dev.release_claim();
    }
}
