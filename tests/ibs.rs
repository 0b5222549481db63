//! Integration tests driving the whole stack through the in-memory
//! hardware model: claiming channels, enabling and disabling sampling,
//! servicing interrupts, and draining buffers from consumer threads.

use std::convert::TryInto;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ibs::control::{MSR_IBS_FETCH_CTL, MSR_IBS_OP_CTL};
use ibs::device;
use ibs::error::ErrorKind;
use ibs::{
    BinaryDump, Capabilities, FetchSample, Flavor, Hardware, IbsContext, MemorySink,
    MockHardware, NmiStatus, OpSample, PollStatus, SampleSink, SamplerConfig, TaskSnapshot,
    Topology,
};

const IBS_OP_EN: u64 = 1 << 17;
const IBS_OP_VAL: u64 = 1 << 18;
const IBS_FETCH_EN: u64 = 1 << 48;

fn default_caps() -> Capabilities {
    Capabilities::OP_SAMPLING
        | Capabilities::FETCH_SAMPLING
        | Capabilities::OP_CNT_EXT
        | Capabilities::BRN_TRGT
}

fn context(num_cpus: usize) -> (Arc<MockHardware>, IbsContext) {
    let _ = env_logger::builder().is_test(true).try_init();
    let hw = Arc::new(MockHardware::new());
    let ctx = IbsContext::new(hw.clone(), default_caps(), Topology::flat(num_cpus)).unwrap();
    (hw, ctx)
}

/// A context with room for exactly `slots` op samples per buffer (one
/// slot is always kept free to distinguish full from empty).
fn small_context(slots: usize) -> (Arc<MockHardware>, IbsContext) {
    let hw = Arc::new(MockHardware::new());
    let ctx = IbsContext::with_buffer_size(
        hw.clone(),
        default_caps(),
        Topology::flat(1),
        (slots + 1) * OpSample::SIZE,
    )
    .unwrap();
    (hw, ctx)
}

#[test]
fn test_open_is_exclusive() {
    let (_hw, ctx) = context(2);

    let dev = ctx.open(0, Flavor::Op).unwrap();
    assert_eq!(
        ctx.open(0, Flavor::Op).unwrap_err().kind(),
        &ErrorKind::Busy
    );

    // Same CPU, other flavor: independent channel.
    let _fetch = ctx.open(0, Flavor::Fetch).unwrap();
    let _other = ctx.open(1, Flavor::Op).unwrap();

    drop(dev);
    ctx.open(0, Flavor::Op).unwrap();
}

#[test]
fn test_open_validates_cpu_and_flavor() {
    let hw = Arc::new(MockHardware::new());
    let ctx = IbsContext::new(
        hw,
        Capabilities::OP_SAMPLING | Capabilities::OP_CNT_EXT,
        Topology::flat(2),
    )
    .unwrap();

    assert_eq!(
        ctx.open(2, Flavor::Op).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );
    assert_eq!(
        ctx.open(0, Flavor::Fetch).unwrap_err().kind(),
        &ErrorKind::Unsupported
    );
}

#[test]
fn test_op_sample_round_trip() {
    let (hw, ctx) = context(1);
    hw.set_task(TaskSnapshot {
        tid: 1234,
        pid: 1200,
        cr3: 0xabc000,
        kern_mode: false,
    });

    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();
    assert!(dev.enabled());

    hw.latch_op_sample(0, 0xffff_8000_1234_5678, 0x99, 0x7f00_dead_b000);
    assert_eq!(ctx.handle_interrupt(0), NmiStatus::Handled(1));
    assert_eq!(dev.occupancy(), 1);

    let mut buf = vec![0u8; OpSample::SIZE];
    let n = dev.read(&mut buf, false).unwrap();
    assert_eq!(n, OpSample::SIZE);

    let sample = OpSample::from_bytes(&buf).unwrap();
    assert_eq!(sample.op_rip, 0xffff_8000_1234_5678);
    assert_eq!(sample.op_data, 0x99);
    assert_eq!(sample.dc_lin_ad, 0x7f00_dead_b000);
    assert_ne!(sample.op_ctl & IBS_OP_VAL, 0);
    assert_eq!(sample.cpu, 0);
    assert_eq!(sample.tid, 1234);
    assert_eq!(sample.pid, 1200);
    assert_eq!(sample.cr3, 0xabc000);
    assert_eq!(sample.kern_mode, 0);
    assert_ne!(sample.tsc, 0);
}

#[test]
fn test_fetch_sample_round_trip_and_rearm() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Fetch).unwrap();
    dev.enable().unwrap();

    hw.latch_fetch_sample(0, 0x5555_0000);
    assert_eq!(ctx.handle_interrupt(0), NmiStatus::Handled(1));

    let mut buf = vec![0u8; FetchSample::SIZE];
    assert_eq!(dev.read(&mut buf, false).unwrap(), FetchSample::SIZE);
    let sample = FetchSample::from_bytes(&buf).unwrap();
    assert_eq!(sample.fetch_lin_ad, 0x5555_0000);

    // Re-arming clears the whole register before restoring the control
    // value, so the valid bit is guaranteed to drop.
    let writes = hw.writes_to(0, MSR_IBS_FETCH_CTL);
    let n = writes.len();
    assert_eq!(writes[n - 2], 0);
    assert_ne!(writes[n - 1] & IBS_FETCH_EN, 0);
}

#[test]
fn test_interrupt_without_pending_sample_is_not_claimed() {
    let (_hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    assert_eq!(ctx.handle_interrupt(0), NmiStatus::NotHandled);
    assert_eq!(ctx.handle_interrupt(7), NmiStatus::NotHandled);
}

#[test]
fn test_op_rearm_randomises_counter_bits() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    hw.latch_op_sample(0, 1, 2, 3);
    ctx.handle_interrupt(0);

    // First output of the 0xF00D-seeded generator is 0xF806; its low four
    // bits land in the hidden counter bits 35:32.
    let rearm = *hw.writes_to(0, MSR_IBS_OP_CTL).last().unwrap();
    assert_eq!((rearm >> 32) & 0xf, 0x6);
    assert_ne!(rearm & IBS_OP_EN, 0);
    assert_eq!(rearm & IBS_OP_VAL, 0);
}

#[test]
fn test_disable_writes_sentinel_before_clearing() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();
    dev.disable().unwrap();
    assert!(!dev.enabled());

    // The valid bit alone is written first, then zero after a short
    // delay, so an in-flight interrupt still sees a claimable sample.
    let writes = hw.writes_to(0, MSR_IBS_OP_CTL);
    let n = writes.len();
    assert_eq!(writes[n - 2], IBS_OP_VAL);
    assert_eq!(writes[n - 1], 0);
    assert!(hw.delayed_us() >= 1);
}

#[test]
fn test_read_returns_zero_after_disable_and_drain() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    hw.latch_op_sample(0, 1, 2, 3);
    ctx.handle_interrupt(0);
    dev.disable().unwrap();

    let mut buf = vec![0u8; OpSample::SIZE];
    assert_eq!(dev.read(&mut buf, false).unwrap(), OpSample::SIZE);
    // Drained and disabled: end of data, even for a blocking read.
    assert_eq!(dev.read(&mut buf, true).unwrap(), 0);
}

#[test]
fn test_nonblocking_read_on_empty_enabled_channel() {
    let (_hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    let mut buf = vec![0u8; OpSample::SIZE];
    assert_eq!(
        dev.read(&mut buf, false).unwrap_err().kind(),
        &ErrorKind::WouldBlock
    );
}

#[test]
fn test_read_validates_destination_length() {
    let (_hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();

    let mut small = vec![0u8; OpSample::SIZE - 1];
    assert_eq!(
        dev.read(&mut small, false).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );

    let size = dev.control(device::GET_BUFFER_SIZE, 0).unwrap() as usize;
    let mut huge = vec![0u8; size + 1];
    assert_eq!(
        dev.read(&mut huge, false).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );
}

#[test]
fn test_blocking_read_woken_by_producer() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(30));
            hw.latch_op_sample(0, 0x42, 0, 0);
            ctx.handle_interrupt(0);
        });

        let mut buf = vec![0u8; OpSample::SIZE];
        let n = dev.read(&mut buf, true).unwrap();
        assert_eq!(n, OpSample::SIZE);
        assert_eq!(OpSample::from_bytes(&buf).unwrap().op_rip, 0x42);
    });
}

#[test]
fn test_cancel_interrupts_blocking_read() {
    let (_hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();
    dev.cancel_waiters();

    let mut buf = vec![0u8; OpSample::SIZE];
    assert_eq!(
        dev.read(&mut buf, true).unwrap_err().kind(),
        &ErrorKind::Interrupted
    );
}

#[test]
fn test_poll_threshold() {
    let (hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.set_poll_threshold(2).unwrap();
    dev.enable().unwrap();

    assert_eq!(dev.poll(), PollStatus::NotReady);

    hw.latch_op_sample(0, 1, 0, 0);
    ctx.handle_interrupt(0);
    assert_eq!(dev.poll(), PollStatus::NotReady);

    hw.latch_op_sample(0, 2, 0, 0);
    ctx.handle_interrupt(0);
    assert_eq!(dev.poll(), PollStatus::Ready);
    assert_eq!(dev.poll_wait(Duration::from_millis(1)), PollStatus::Ready);

    // Below threshold on a disabled channel: nothing more is coming.
    let mut buf = vec![0u8; 2 * OpSample::SIZE];
    dev.read(&mut buf, false).unwrap();
    dev.disable().unwrap();
    assert_eq!(dev.poll(), PollStatus::HangUp);
    assert_eq!(dev.poll_wait(Duration::from_millis(1)), PollStatus::HangUp);
}

#[test]
fn test_full_buffer_counts_lost_samples() {
    let (hw, ctx) = small_context(3);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();

    for i in 0..5 {
        hw.latch_op_sample(0, i, 0, 0);
        assert_eq!(ctx.handle_interrupt(0), NmiStatus::Handled(1));
    }

    assert_eq!(dev.control(device::FIONREAD, 0).unwrap(), 3);
    assert_eq!(dev.control(device::GET_LOST, 0).unwrap(), 2);
    // Read-and-clear.
    assert_eq!(dev.control(device::GET_LOST, 0).unwrap(), 0);

    // The oldest samples survive; overflow drops the newcomers.
    let mut buf = vec![0u8; 3 * OpSample::SIZE];
    assert_eq!(dev.read(&mut buf, false).unwrap(), 3 * OpSample::SIZE);
    for (i, raw) in buf.chunks(OpSample::SIZE).enumerate() {
        assert_eq!(OpSample::from_bytes(raw).unwrap().op_rip, i as u64);
    }
}

#[test]
fn test_counter_commands_alias_across_flavors() {
    let (_hw, ctx) = context(1);

    // On an op channel both counter commands address the op counter
    // start value.
    let op = ctx.open(0, Flavor::Op).unwrap();
    op.control(device::SET_CNT, 0x120).unwrap();
    assert_eq!(op.control(device::GET_CUR_CNT, 0).unwrap(), 0x120);
    op.control(device::SET_CUR_CNT, 0x340).unwrap();
    assert_eq!(op.control(device::GET_CNT, 0).unwrap(), 0x340);

    let fetch = ctx.open(0, Flavor::Fetch).unwrap();
    fetch.control(device::SET_CUR_CNT, 0x56).unwrap();
    assert_eq!(fetch.control(device::GET_CNT, 0).unwrap(), 0x56);
}

#[test]
fn test_flavor_specific_commands_rejected_crosswise() {
    let (_hw, ctx) = context(1);
    let op = ctx.open(0, Flavor::Op).unwrap();
    let fetch = ctx.open(0, Flavor::Fetch).unwrap();

    assert_eq!(
        fetch.control(device::SET_CNT_CTL, 1).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );
    assert_eq!(
        op.control(device::SET_RAND_EN, 1).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );
    assert_eq!(
        op.control(device::SET_CNT_CTL, 2).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );
    assert_eq!(
        op.control(0x4242, 0).unwrap_err().kind(),
        &ErrorKind::Unsupported
    );
}

#[test]
fn test_configuration_frozen_while_enabled() {
    let (_hw, ctx) = context(1);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    let size = dev.control(device::GET_BUFFER_SIZE, 0).unwrap();
    dev.enable().unwrap();

    for &(cmd, arg) in &[
        (device::SET_MAX_CNT, 0x2000),
        (device::SET_CUR_CNT, 0x10),
        (device::SET_CNT_CTL, 0),
        (device::SET_POLL_SIZE, 4),
        (device::SET_BUFFER_SIZE, 8 * OpSample::SIZE as u64),
        (device::RESET_BUFFER, 0),
    ] {
        assert_eq!(
            dev.control(cmd, arg).unwrap_err().kind(),
            &ErrorKind::Busy,
            "command {:#x} must be rejected while enabled",
            cmd
        );
    }

    // Reads stay available, and the rejected resize left the buffer alone.
    assert_eq!(dev.control(device::GET_MAX_CNT, 0).unwrap(), 0x4000);
    assert_eq!(dev.control(device::GET_BUFFER_SIZE, 0).unwrap(), size);

    dev.disable().unwrap();
    dev.control(device::SET_MAX_CNT, 0x2000).unwrap();
    assert_eq!(dev.control(device::GET_MAX_CNT, 0).unwrap(), 0x2000);
}

#[test]
fn test_buffer_resize() {
    let (hw, ctx) = small_context(3);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    dev.enable().unwrap();
    hw.latch_op_sample(0, 1, 0, 0);
    ctx.handle_interrupt(0);
    dev.disable().unwrap();

    assert_eq!(
        dev.control(device::SET_BUFFER_SIZE, 1).unwrap_err().kind(),
        &ErrorKind::InvalidArgument
    );

    let new_size = 16 * OpSample::SIZE as u64;
    dev.control(device::SET_BUFFER_SIZE, new_size).unwrap();
    assert_eq!(dev.control(device::GET_BUFFER_SIZE, 0).unwrap(), new_size);
    // Resizing discards buffered samples.
    assert_eq!(dev.occupancy(), 0);
}

#[test]
fn test_drop_restores_defaults() {
    let (hw, ctx) = context(1);

    {
        let dev = ctx.open(0, Flavor::Op).unwrap();
        dev.set_max_cnt(0x123).unwrap();
        dev.set_poll_threshold(9).unwrap();
        dev.enable().unwrap();
        hw.latch_op_sample(0, 1, 0, 0);
        ctx.handle_interrupt(0);
    }

    // Dropping disabled the hardware and released the claim; the next
    // consumer starts from defaults with an empty buffer.
    assert_eq!(*hw.writes_to(0, MSR_IBS_OP_CTL).last().unwrap(), 0);
    let dev = ctx.open(0, Flavor::Op).unwrap();
    assert!(!dev.enabled());
    assert_eq!(dev.occupancy(), 0);
    assert_eq!(dev.control(device::GET_MAX_CNT, 0).unwrap(), 0x4000);
    assert_eq!(dev.control(device::GET_POLL_SIZE, 0).unwrap(), 1);
}

#[test]
fn test_fam17h_workaround_follows_last_channel_on_core() {
    const WA_1: u32 = 0xc001_1020;
    const WA_1_BITS: u64 = 0x40_0000_0000_0000;

    let hw = Arc::new(MockHardware::new());
    let caps = default_caps() | Capabilities::WA_FAM17H_ZN;
    // One physical core, two hyperthreads.
    let ctx = IbsContext::new(hw.clone(), caps, Topology::new(vec![0, 0])).unwrap();

    let dev0 = ctx.open(0, Flavor::Op).unwrap();
    let dev1 = ctx.open(1, Flavor::Op).unwrap();

    dev0.enable().unwrap();
    assert_eq!(hw.rdmsr(0, WA_1) & WA_1_BITS, WA_1_BITS);
    let writes_after_first = hw.writes_to(0, WA_1).len();

    // The sibling piggy-backs on the already-engaged workaround.
    dev1.enable().unwrap();
    assert_eq!(hw.writes_to(0, WA_1).len(), writes_after_first);

    // Releasing one channel leaves the shared state alone while the
    // sibling is still sampling.
    dev0.disable().unwrap();
    assert_eq!(hw.rdmsr(0, WA_1) & WA_1_BITS, WA_1_BITS);

    dev1.disable().unwrap();
    assert_eq!(hw.rdmsr(0, WA_1) & WA_1_BITS, 0);
}

#[test]
fn test_sampler_collects_into_memory_sink() {
    let (hw, ctx) = context(2);
    let mut sampler = SamplerConfig::default()
        .flavors(true, true)
        .poll_threshold(1)
        .poll_timeout(Duration::from_millis(10))
        .open(&ctx)
        .unwrap();
    sampler.enable_all().unwrap();

    hw.latch_op_sample(0, 0xa0, 0, 0);
    ctx.handle_interrupt(0);
    hw.latch_op_sample(1, 0xa1, 0, 0);
    hw.latch_fetch_sample(1, 0xb1);
    ctx.handle_interrupt(1);

    let mut sink = MemorySink::default();
    let collected = sampler.collect(&mut sink).unwrap();
    assert_eq!(collected, 3);
    assert_eq!(sink.op.len(), 2);
    assert_eq!(sink.fetch.len(), 1);
    assert_eq!(sink.fetch[0].fetch_lin_ad, 0xb1);

    let residue = sampler.finish(&mut sink).unwrap();
    assert_eq!(residue, 0);
}

#[test]
fn test_binary_dump_header_and_payload() {
    let mut dump = BinaryDump::new(Vec::new(), Flavor::Op).unwrap();
    let sample = OpSample {
        op_rip: 0x77,
        ..Default::default()
    };
    dump.write_op(&sample).unwrap();

    let bytes = dump.into_inner();
    assert_eq!(bytes.len(), 8 + OpSample::SIZE);
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
    assert_eq!(
        u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        OpSample::SIZE as u32
    );
    assert_eq!(OpSample::from_bytes(&bytes[8..]).unwrap(), sample);
}
