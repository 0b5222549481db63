//! High-level sample collection across many CPUs.
//!
//! [`Sampler`] drives a set of per-CPU devices: it applies one
//! configuration everywhere, enables and disables sampling as a group,
//! and drains ready buffers into a [`SampleSink`]. Output routing is a
//! trait rather than a pair of callbacks; [`BinaryDump`] streams raw
//! records behind a version header for offline decoding, and
//! [`MemorySink`] collects decoded samples for in-process consumers.

use std::io::Write;
use std::time::Duration;

use crate::device::{Device, PollStatus};
use crate::error::{error_with_cause, Error, ErrorKind};
use crate::record::{FetchSample, OpSample, FETCH_SAMPLE_VERSION, OP_SAMPLE_VERSION};
use crate::registry::IbsContext;
use crate::Flavor;

/// Where drained samples go.
pub trait SampleSink {
    /// Deliver one op sample.
    fn write_op(&mut self, sample: &OpSample) -> Result<(), Error>;
    /// Deliver one fetch sample.
    fn write_fetch(&mut self, sample: &FetchSample) -> Result<(), Error>;
}

/// Streams raw records to a writer, preceded by a header identifying the
/// flavor's struct layout version so decoders can select the right one.
pub struct BinaryDump<W: Write> {
    out: W,
}

impl<W: Write> BinaryDump<W> {
    /// Wrap `out` for records of the given flavor, writing the version
    /// header immediately.
    pub fn new(mut out: W, flavor: Flavor) -> Result<BinaryDump<W>, Error> {
        let version = match flavor {
            Flavor::Op => OP_SAMPLE_VERSION,
            Flavor::Fetch => FETCH_SAMPLE_VERSION,
        };
        let header = [version, flavor.entry_size() as u32];
        for word in &header {
            out.write_all(&word.to_le_bytes())
                .map_err(|e| error_with_cause(ErrorKind::Unknown, e))?;
        }
        Ok(BinaryDump { out })
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.out
            .write_all(bytes)
            .map_err(|e| error_with_cause(ErrorKind::Unknown, e))
    }
}

impl<W: Write> SampleSink for BinaryDump<W> {
    fn write_op(&mut self, sample: &OpSample) -> Result<(), Error> {
        self.write_bytes(sample.as_bytes())
    }

    fn write_fetch(&mut self, sample: &FetchSample) -> Result<(), Error> {
        self.write_bytes(sample.as_bytes())
    }
}

/// Collects decoded samples in memory.
#[derive(Default)]
pub struct MemorySink {
    /// Op samples, in arrival order per CPU.
    pub op: Vec<OpSample>,
    /// Fetch samples, in arrival order per CPU.
    pub fetch: Vec<FetchSample>,
}

impl SampleSink for MemorySink {
    fn write_op(&mut self, sample: &OpSample) -> Result<(), Error> {
        self.op.push(*sample);
        Ok(())
    }

    fn write_fetch(&mut self, sample: &FetchSample) -> Result<(), Error> {
        self.fetch.push(*sample);
        Ok(())
    }
}

/// Collection parameters applied uniformly to every opened device.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    op: bool,
    fetch: bool,
    cpus: Option<Vec<usize>>,
    max_cnt: u64,
    poll_threshold: u64,
    poll_timeout: Duration,
    read_on_timeout: bool,
}

impl Default for SamplerConfig {
    fn default() -> SamplerConfig {
        SamplerConfig {
            op: true,
            fetch: false,
            cpus: None,
            max_cnt: 0x3fff,
            poll_threshold: 64,
            poll_timeout: Duration::from_millis(1000),
            read_on_timeout: true,
        }
    }
}

impl SamplerConfig {
    /// Select which flavors to sample. Defaults to op only.
    pub fn flavors(self, op: bool, fetch: bool) -> Self {
        Self { op, fetch, ..self }
    }

    /// Restrict sampling to the given CPUs. Defaults to all CPUs.
    pub fn cpus(self, cpus: impl Into<Vec<usize>>) -> Self {
        Self {
            cpus: Some(cpus.into()),
            ..self
        }
    }

    /// Counter maximum: one sample roughly every `max_cnt` ops/fetches.
    pub fn max_cnt(self, max_cnt: u64) -> Self {
        Self { max_cnt, ..self }
    }

    /// Samples that must be buffered before a device reports ready.
    ///
    /// Larger thresholds mean fewer, bigger reads.
    pub fn poll_threshold(self, samples: u64) -> Self {
        Self {
            poll_threshold: samples,
            ..self
        }
    }

    /// How long one collection pass waits for a device to become ready.
    pub fn poll_timeout(self, timeout: Duration) -> Self {
        Self {
            poll_timeout: timeout,
            ..self
        }
    }

    /// Whether a collection pass that times out still attempts a
    /// non-blocking read, picking up below-threshold residue.
    pub fn read_on_timeout(self, yes: bool) -> Self {
        Self {
            read_on_timeout: yes,
            ..self
        }
    }

    /// Open the selected devices and build a [`Sampler`].
    pub fn open(self, ctx: &IbsContext) -> Result<Sampler<'_>, Error> {
        Sampler::new(ctx, self)
    }
}

/// A group of opened sampling devices draining to one sink.
pub struct Sampler<'a> {
    devices: Vec<Device<'a>>,
    config: SamplerConfig,
    scratch: Vec<u8>,
}

impl<'a> Sampler<'a> {
    fn new(ctx: &'a IbsContext, config: SamplerConfig) -> Result<Sampler<'a>, Error> {
        let cpus: Vec<usize> = match config.cpus {
            Some(ref list) => list.clone(),
            None => (0..ctx.num_cpus()).collect(),
        };

        let mut devices = Vec::new();
        for &cpu in &cpus {
            if config.op {
                devices.push(ctx.open(cpu, Flavor::Op)?);
            }
            if config.fetch {
                devices.push(ctx.open(cpu, Flavor::Fetch)?);
            }
        }

        for dev in &devices {
            dev.set_max_cnt(config.max_cnt)?;
            dev.set_poll_threshold(config.poll_threshold)?;
        }

        // One scratch region sized for the largest drain any device can
        // produce in a single read.
        let scratch_len = devices
            .iter()
            .map(|d| d.entry_size() * config.poll_threshold as usize)
            .max()
            .unwrap_or(0)
            .max(OpSample::SIZE);

        Ok(Sampler {
            devices,
            config,
            scratch: vec![0; scratch_len],
        })
    }

    /// The opened devices, in (cpu, flavor) order.
    pub fn devices(&self) -> &[Device<'a>] {
        &self.devices
    }

    /// Enable sampling on every opened device.
    pub fn enable_all(&self) -> Result<(), Error> {
        for dev in &self.devices {
            dev.enable()?;
        }
        Ok(())
    }

    /// Disable sampling on every opened device. Buffered samples remain
    /// readable until drained.
    pub fn disable_all(&self) -> Result<(), Error> {
        for dev in &self.devices {
            dev.disable()?;
        }
        Ok(())
    }

    /// Drain whatever is buffered on one device, without blocking.
    fn drain_device(
        dev: &Device<'a>,
        scratch: &mut [u8],
        sink: &mut dyn SampleSink,
    ) -> Result<usize, Error> {
        let entry_size = dev.entry_size();
        let mut total = 0;
        loop {
            let n = match dev.read(scratch, false) {
                Ok(0) => break, // disabled and fully drained
                Ok(n) => n,
                Err(ref e) if e.kind() == &ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            for raw in scratch[..n].chunks(entry_size) {
                match dev.flavor() {
                    Flavor::Op => sink.write_op(&OpSample::from_bytes(raw)?)?,
                    Flavor::Fetch => sink.write_fetch(&FetchSample::from_bytes(raw)?)?,
                }
            }
            total += n / entry_size;
        }
        Ok(total)
    }

    /// One collection pass: wait for each device to become ready (or time
    /// out, or hang up) and drain it into `sink`.
    ///
    /// Returns the number of samples delivered. A pass over disabled,
    /// fully drained devices returns 0, which callers use as the signal
    /// to stop.
    pub fn collect(&mut self, sink: &mut dyn SampleSink) -> Result<usize, Error> {
        let mut total = 0;
        for dev in &self.devices {
            let drain = match dev.poll_wait(self.config.poll_timeout) {
                PollStatus::Ready | PollStatus::HangUp => true,
                PollStatus::NotReady => self.config.read_on_timeout,
            };
            if drain {
                total += Self::drain_device(dev, &mut self.scratch, sink)?;
            }
        }
        Ok(total)
    }

    /// Disable everything and drain all residue into `sink`.
    pub fn finish(mut self, sink: &mut dyn SampleSink) -> Result<usize, Error> {
        self.disable_all()?;
        let mut total = 0;
        for dev in &self.devices {
            total += Self::drain_device(dev, &mut self.scratch, sink)?;
        }
        Ok(total)
    }
}
