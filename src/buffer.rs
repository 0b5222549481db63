//! Per-channel circular sample buffer.
//!
//! One [`SampleBuffer`] carries fixed-size binary records from a single
//! interrupt-context producer to user-context consumers. The producer side
//! ([`try_push`]) is lock-free: it may not block, allocate, or wait on any
//! lock a consumer could be holding while copying data out. The
//! producer/consumer handoff happens entirely through the atomic `wr`,
//! `rd` and `entries` counters; the consumer-side mutex only serialises
//! concurrent readers against each other and against buffer reallocation.
//!
//! The buffer deliberately holds at most `capacity - 1` records: the
//! producer refuses to advance the write index onto the read index, which
//! is what disambiguates a full buffer from an empty one without a lock.
//!
//! [`try_push`]: SampleBuffer::try_push

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{error_with_cause, new_error, Error, ErrorKind};

/// A lock-free single-producer circular buffer of fixed-size records.
#[derive(Debug)]
pub struct SampleBuffer {
    /// Backing byte region. Only ever swapped by `realloc`, which runs with
    /// the producer quiescent and the read lock held; all other access goes
    /// through raw pointers so producer and consumer never hold overlapping
    /// references.
    storage: UnsafeCell<Box<[u8]>>,

    entry_size: usize,
    size: AtomicUsize,
    capacity: AtomicUsize,

    /// Next slot the producer will write. Written only by the producer.
    wr: AtomicUsize,
    /// Next slot the consumer will read. Written only under `read_lock`.
    rd: AtomicUsize,
    /// Count of valid unread records.
    entries: AtomicUsize,
    /// Records dropped because the buffer was full.
    lost: AtomicUsize,

    /// Serialises consumers; never taken by the producer.
    read_lock: Mutex<()>,
}

// The raw-pointer copies in try_push/pop_into are disjoint by protocol:
// the producer only touches slots outside [rd, rd+entries) and publishes
// them with a release store, the consumer only reads slots covered by an
// acquire load of `entries`.
unsafe impl Send for SampleBuffer {}
unsafe impl Sync for SampleBuffer {}

fn alloc_region(size: usize) -> Result<Box<[u8]>, Error> {
    let mut region = Vec::new();
    region
        .try_reserve_exact(size)
        .map_err(|e| error_with_cause(ErrorKind::OutOfMemory, e))?;
    region.resize(size, 0);
    Ok(region.into_boxed_slice())
}

impl SampleBuffer {
    /// Allocate a buffer of `size` bytes holding records of `entry_size`
    /// bytes each.
    ///
    /// Fails with `InvalidArgument` if the buffer cannot hold at least one
    /// record, or `OutOfMemory` if the allocation fails.
    pub fn new(size: usize, entry_size: usize) -> Result<SampleBuffer, Error> {
        if entry_size == 0 || size < entry_size {
            return Err(new_error(ErrorKind::InvalidArgument));
        }
        let storage = alloc_region(size)?;
        Ok(SampleBuffer {
            storage: UnsafeCell::new(storage),
            entry_size,
            size: AtomicUsize::new(size),
            capacity: AtomicUsize::new(size / entry_size),
            wr: AtomicUsize::new(0),
            rd: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            lost: AtomicUsize::new(0),
            read_lock: Mutex::new(()),
        })
    }

    /// Drop all buffered records and zero the loss counter.
    ///
    /// Memory contents are left untouched. The caller must guarantee the
    /// producer is quiescent (sampling disabled); this is safe to call
    /// while a consumer holds the read lock, so it takes no lock itself.
    pub fn reset(&self) {
        self.wr.store(0, Ordering::Release);
        self.rd.store(0, Ordering::Release);
        self.entries.store(0, Ordering::Release);
        self.lost.store(0, Ordering::Release);
    }

    /// Append one record from interrupt context.
    ///
    /// Returns `true` if the record was stored and a wakeup is warranted.
    /// If the buffer is full the record is discarded, the loss counter is
    /// incremented and `false` is returned. Never blocks, never allocates,
    /// never takes a lock.
    pub fn try_push(&self, record: &[u8]) -> bool {
        debug_assert_eq!(record.len(), self.entry_size);

        let capacity = self.capacity.load(Ordering::Relaxed);
        let wr = self.wr.load(Ordering::Relaxed);
        let next = (wr + 1) % capacity;

        // Refusing to advance wr onto rd keeps one slot free and makes
        // full/empty distinguishable without locking.
        if next == self.rd.load(Ordering::Acquire) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        unsafe {
            let base = (*self.storage.get()).as_ptr() as *mut u8;
            ptr::copy_nonoverlapping(
                record.as_ptr(),
                base.add(wr * self.entry_size),
                self.entry_size,
            );
        }

        // Publish the slot before it becomes visible through the counters.
        self.wr.store(next, Ordering::Release);
        self.entries.fetch_add(1, Ordering::Release);
        true
    }

    /// Copy whole records out of the buffer into `dest`.
    ///
    /// The copy length is `dest.len()` rounded down to a multiple of the
    /// entry size and clamped to the current occupancy; a span that wraps
    /// past the end of the backing region is copied in two parts. Returns
    /// the number of bytes copied, 0 when no records are buffered.
    pub fn pop_into(&self, dest: &mut [u8]) -> usize {
        let _guard = self.read_lock.lock().unwrap();

        let avail = self.entries.load(Ordering::Acquire);
        let mut count = dest.len() - dest.len() % self.entry_size;
        count = count.min(avail * self.entry_size);
        if count == 0 {
            return 0;
        }

        let capacity = self.capacity.load(Ordering::Relaxed);
        let rd = self.rd.load(Ordering::Relaxed);

        unsafe {
            let base = (*self.storage.get()).as_ptr();
            let bytes_to_end = (capacity - rd) * self.entry_size;
            let first = count.min(bytes_to_end);
            ptr::copy_nonoverlapping(base.add(rd * self.entry_size), dest.as_mut_ptr(), first);
            if count > first {
                // Wrapped: finish the copy from the start of the region.
                ptr::copy_nonoverlapping(base, dest.as_mut_ptr().add(first), count - first);
            }
        }

        let entries_read = count / self.entry_size;
        self.rd
            .store((rd + entries_read) % capacity, Ordering::Release);
        self.entries.fetch_sub(entries_read, Ordering::Release);
        count
    }

    /// Number of complete unread records currently buffered.
    pub fn occupancy(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Read and zero the dropped-sample counter in one step.
    pub fn lost_and_clear(&self) -> usize {
        self.lost.swap(0, Ordering::AcqRel)
    }

    /// Buffer capacity in records. One slot is always kept free, so at
    /// most `capacity() - 1` records can be buffered.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Size of one record in bytes.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Replace the backing region with one of `new_size` bytes and reset
    /// all counters.
    ///
    /// The new region is allocated before the old one is released: on
    /// failure the existing buffer and its contents remain fully operable.
    /// The caller must guarantee the producer is quiescent.
    pub fn realloc(&self, new_size: usize) -> Result<(), Error> {
        if new_size < self.entry_size {
            return Err(new_error(ErrorKind::InvalidArgument));
        }
        let fresh = alloc_region(new_size)?;

        let _guard = self.read_lock.lock().unwrap();
        unsafe {
            *self.storage.get() = fresh;
        }
        self.size.store(new_size, Ordering::Relaxed);
        self.capacity
            .store(new_size / self.entry_size, Ordering::Relaxed);
        self.reset();
        Ok(())
    }

    /// Log the raw buffer state, for the diagnostic ioctl.
    pub(crate) fn log_state(&self, cpu: usize) {
        log::info!(
            "cpu {} buffer: {{ wr = {}; rd = {}; entries = {}; lost = {}; \
             capacity = {}; entry_size = {}; size = {}; }}",
            cpu,
            self.wr.load(Ordering::Relaxed),
            self.rd.load(Ordering::Relaxed),
            self.entries.load(Ordering::Relaxed),
            self.lost.load(Ordering::Relaxed),
            self.capacity(),
            self.entry_size,
            self.size(),
        );
    }
}
