#![allow(missing_docs)]

//! Fixed-layout binary sample records.
//!
//! These structs are the wire format between the interrupt-context producer
//! and user-space consumers: raw register snapshots followed by common task
//! metadata, laid out exactly as C would lay them out. A version constant
//! accompanies any persisted dump so a decoder can support historical
//! layouts.

use std::mem;
use std::slice;

use crate::error::{new_error, Error, ErrorKind};

/// Layout version of [`OpSample`].
pub const OP_SAMPLE_VERSION: u32 = 1;

/// Layout version of [`FetchSample`].
pub const FETCH_SAMPLE_VERSION: u32 = 1;

/// One op-flavor sample: a snapshot taken around retirement of a sampled
/// micro-operation.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpSample {
    pub op_ctl: u64,
    pub op_rip: u64,
    pub op_data: u64,
    pub op_data2: u64,
    pub op_data3: u64,
    pub op_data4: u64,
    pub dc_lin_ad: u64,
    pub dc_phys_ad: u64,
    pub br_target: u64,
    pub tsc: u64,
    pub cr3: u64,
    pub tid: i32,
    pub pid: i32,
    pub cpu: i32,
    pub kern_mode: i32,
}

/// One fetch-flavor sample: a snapshot taken around an instruction-fetch
/// event.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchSample {
    pub fetch_ctl: u64,
    pub fetch_ctl_extd: u64,
    pub fetch_lin_ad: u64,
    pub fetch_phys_ad: u64,
    pub tsc: u64,
    pub cr3: u64,
    pub tid: i32,
    pub pid: i32,
    pub cpu: i32,
    pub kern_mode: i32,
}

macro_rules! record_bytes {
    ($t:ty) => {
        impl $t {
            /// Size in bytes of one record, fixed at compile time.
            pub const SIZE: usize = mem::size_of::<$t>();

            /// View the record as raw bytes, ready to be copied into a
            /// sample buffer slot.
            pub fn as_bytes(&self) -> &[u8] {
                // Safe: repr(C), every field is a plain integer, and the
                // struct contains no padding (all u64 fields precede the
                // four i32 fields, keeping 8-byte alignment throughout).
                unsafe { slice::from_raw_parts(self as *const $t as *const u8, Self::SIZE) }
            }

            /// Decode one record from the start of `bytes`.
            ///
            /// Fails with `InvalidArgument` if fewer than [`Self::SIZE`]
            /// bytes are available.
            pub fn from_bytes(bytes: &[u8]) -> Result<$t, Error> {
                if bytes.len() < Self::SIZE {
                    return Err(new_error(ErrorKind::InvalidArgument));
                }
                // Safe: any bit pattern is a valid value for a struct of
                // plain integers; read_unaligned tolerates arbitrary
                // source alignment.
                Ok(unsafe { (bytes.as_ptr() as *const $t).read_unaligned() })
            }
        }
    };
}

record_bytes!(OpSample);
record_bytes!(FetchSample);
