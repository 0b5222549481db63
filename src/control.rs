#![allow(missing_docs)]

//! Control-word layout for the IBS fetch and op sampling registers.
//!
//! The count fields inside `IBS_OP_CTL` are not contiguous: the maximum
//! count straddles two bit ranges on Llano and later parts, and the low
//! four bits of both counters are hidden from software (they are zeroed or
//! randomised by the hardware). [`scatter_bits`]/[`gather_bits`] translate
//! between a densely packed quantity and its scattered register layout, so
//! the rest of the crate never touches raw bit positions.

/// IBS fetch control register.
pub const MSR_IBS_FETCH_CTL: u32 = 0xc001_1030;
pub(crate) const IBS_RAND_EN: u64 = 1 << 57;
pub(crate) const IBS_FETCH_VAL: u64 = 1 << 49;
pub(crate) const IBS_FETCH_EN: u64 = 1 << 48;
pub(crate) const IBS_FETCH_CNT: u64 = 0xffff << 16;
pub(crate) const IBS_FETCH_MAX_CNT: u64 = 0xffff;

/// IBS fetch linear address register.
pub const MSR_IBS_FETCH_LIN_AD: u32 = 0xc001_1031;
/// IBS fetch physical address register.
pub const MSR_IBS_FETCH_PHYS_AD: u32 = 0xc001_1032;

/// IBS op control register.
pub const MSR_IBS_OP_CTL: u32 = 0xc001_1033;
/// Family 10h layout of the op counter start value.
pub(crate) const IBS_OP_CUR_CNT_OLD: u64 = 0xfffff << 32;
/// Llano+ layout, excluding the four bits randomised by software.
pub(crate) const IBS_OP_CUR_CNT_23: u64 = 0x7ff_fff0 << 32;
pub(crate) const IBS_OP_MAX_CNT: u64 = 0x7f0_ffff;
pub(crate) const IBS_OP_MAX_CNT_OLD: u64 = 0xffff;
pub(crate) const IBS_OP_CNT_CTL: u64 = 1 << 19;
pub(crate) const IBS_OP_VAL: u64 = 1 << 18;
pub(crate) const IBS_OP_EN: u64 = 1 << 17;

/// IBS op sample data registers.
pub const MSR_IBS_OP_RIP: u32 = 0xc001_1034;
pub const MSR_IBS_OP_DATA: u32 = 0xc001_1035;
pub const MSR_IBS_OP_DATA2: u32 = 0xc001_1036;
pub const MSR_IBS_OP_DATA3: u32 = 0xc001_1037;
pub const MSR_IBS_DC_LIN_AD: u32 = 0xc001_1038;
pub const MSR_IBS_DC_PHYS_AD: u32 = 0xc001_1039;
/// Branch target address register (Llano+).
pub const MSR_IBS_BR_TARGET: u32 = 0xc001_103b;
/// Extended fetch control register (Carrizo+).
pub const MSR_IBS_EXTD_CTL: u32 = 0xc001_103c;
/// Op data 4 register (Carrizo and Stoney Ridge only).
pub const MSR_IBS_OP_DATA4: u32 = 0xc001_103d;

/// Scatter a densely packed quantity over the bit positions set in `fmt`.
///
/// The n-th lowest bit of `qty` lands at the position of the n-th lowest
/// set bit of `fmt`; all other result bits are zero.
pub fn scatter_bits(qty: u64, fmt: u64) -> u64 {
    let mut reg = 0;
    let mut qty_pos = 1u64;
    for i in 0..64 {
        let fmt_pos = 1u64 << i;
        if fmt & fmt_pos != 0 {
            if qty & qty_pos != 0 {
                reg |= fmt_pos;
            }
            qty_pos <<= 1;
        }
    }
    reg
}

/// Gather the bits of `reg` at the positions set in `fmt` into a densely
/// packed quantity. Inverse of [`scatter_bits`].
pub fn gather_bits(reg: u64, fmt: u64) -> u64 {
    let mut qty = 0;
    let mut qty_pos = 1u64;
    for i in 0..64 {
        let fmt_pos = 1u64 << i;
        if fmt & fmt_pos != 0 {
            if reg & fmt_pos != 0 {
                qty |= qty_pos;
            }
            qty_pos <<= 1;
        }
    }
    qty
}

/// View over an op-flavor control word.
///
/// The op counter fields moved and widened on Llano; `cnt_ext` selects
/// between the family 10h layout and the extended one.
#[derive(Debug, Clone, Copy)]
pub struct OpCtl {
    raw: u64,
    cnt_ext: bool,
}

impl OpCtl {
    pub fn new(raw: u64, cnt_ext: bool) -> OpCtl {
        OpCtl { raw, cnt_ext }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn enabled(&self) -> bool {
        self.raw & IBS_OP_EN != 0
    }

    pub fn set_enabled(&mut self, on: bool) {
        if on {
            self.raw |= IBS_OP_EN;
        } else {
            self.raw &= !IBS_OP_EN;
        }
    }

    pub fn valid(&self) -> bool {
        self.raw & IBS_OP_VAL != 0
    }

    fn cur_cnt_fmt(&self) -> u64 {
        if self.cnt_ext {
            IBS_OP_CUR_CNT_23
        } else {
            IBS_OP_CUR_CNT_OLD
        }
    }

    fn max_cnt_fmt(&self) -> u64 {
        if self.cnt_ext {
            IBS_OP_MAX_CNT
        } else {
            IBS_OP_MAX_CNT_OLD
        }
    }

    pub fn cur_cnt(&self) -> u64 {
        gather_bits(self.raw, self.cur_cnt_fmt())
    }

    pub fn set_cur_cnt(&mut self, cnt: u64) {
        let fmt = self.cur_cnt_fmt();
        self.raw = (self.raw & !fmt) | scatter_bits(cnt, fmt);
    }

    pub fn max_cnt(&self) -> u64 {
        gather_bits(self.raw, self.max_cnt_fmt())
    }

    pub fn set_max_cnt(&mut self, cnt: u64) {
        let fmt = self.max_cnt_fmt();
        self.raw = (self.raw & !fmt) | scatter_bits(cnt, fmt);
    }

    pub fn cnt_ctl(&self) -> bool {
        self.raw & IBS_OP_CNT_CTL != 0
    }

    pub fn set_cnt_ctl(&mut self, on: bool) {
        if on {
            self.raw |= IBS_OP_CNT_CTL;
        } else {
            self.raw &= !IBS_OP_CNT_CTL;
        }
    }
}

/// View over a fetch-flavor control word.
#[derive(Debug, Clone, Copy)]
pub struct FetchCtl {
    raw: u64,
}

impl FetchCtl {
    pub fn new(raw: u64) -> FetchCtl {
        FetchCtl { raw }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn enabled(&self) -> bool {
        self.raw & IBS_FETCH_EN != 0
    }

    pub fn set_enabled(&mut self, on: bool) {
        if on {
            self.raw |= IBS_FETCH_EN;
        } else {
            self.raw &= !IBS_FETCH_EN;
        }
    }

    pub fn valid(&self) -> bool {
        self.raw & IBS_FETCH_VAL != 0
    }

    pub fn cnt(&self) -> u64 {
        gather_bits(self.raw, IBS_FETCH_CNT)
    }

    pub fn set_cnt(&mut self, cnt: u64) {
        self.raw = (self.raw & !IBS_FETCH_CNT) | scatter_bits(cnt, IBS_FETCH_CNT);
    }

    pub fn max_cnt(&self) -> u64 {
        gather_bits(self.raw, IBS_FETCH_MAX_CNT)
    }

    pub fn set_max_cnt(&mut self, cnt: u64) {
        self.raw = (self.raw & !IBS_FETCH_MAX_CNT) | scatter_bits(cnt, IBS_FETCH_MAX_CNT);
    }

    pub fn rand_en(&self) -> bool {
        self.raw & IBS_RAND_EN != 0
    }

    pub fn set_rand_en(&mut self, on: bool) {
        if on {
            self.raw |= IBS_RAND_EN;
        } else {
            self.raw &= !IBS_RAND_EN;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scatter_contiguous() {
        assert_eq!(scatter_bits(0x4000, IBS_FETCH_MAX_CNT), 0x4000);
        assert_eq!(scatter_bits(0xbeef, IBS_FETCH_CNT), 0xbeef << 16);
    }

    #[test]
    fn test_scatter_split_field() {
        // IBS_OP_MAX_CNT covers bits 15:0 and 26:20; bit 16 of the packed
        // quantity must land at register bit 20.
        assert_eq!(scatter_bits(0x1_0000, IBS_OP_MAX_CNT), 1 << 20);
        assert_eq!(scatter_bits(0xffff, IBS_OP_MAX_CNT), 0xffff);
    }

    #[test]
    fn test_gather_inverts_scatter() {
        for fmt in &[IBS_OP_MAX_CNT, IBS_OP_CUR_CNT_23, IBS_FETCH_CNT] {
            for qty in &[0u64, 1, 0x4000, 0x71f3a] {
                let reg = scatter_bits(*qty, *fmt);
                let masked = qty & gather_bits(*fmt, *fmt);
                assert_eq!(gather_bits(reg, *fmt), masked);
            }
        }
    }

    #[test]
    fn test_op_ctl_accessors() {
        let mut ctl = OpCtl::new(0, true);
        ctl.set_max_cnt(0x4000);
        ctl.set_cnt_ctl(true);
        ctl.set_enabled(true);
        assert!(ctl.enabled());
        assert_eq!(ctl.max_cnt(), 0x4000);
        assert!(ctl.cnt_ctl());
        assert_eq!(ctl.cur_cnt(), 0);

        ctl.set_enabled(false);
        assert!(!ctl.enabled());
        // Disabling must not disturb the count fields.
        assert_eq!(ctl.max_cnt(), 0x4000);
    }

    #[test]
    fn test_op_ctl_old_layout() {
        let mut ctl = OpCtl::new(0, false);
        ctl.set_cur_cnt(0x1234);
        assert_eq!(ctl.raw() & IBS_OP_CUR_CNT_OLD, 0x1234 << 32);
        assert_eq!(ctl.cur_cnt(), 0x1234);
    }

    #[test]
    fn test_fetch_ctl_accessors() {
        let mut ctl = FetchCtl::new(0);
        ctl.set_rand_en(true);
        ctl.set_max_cnt(0x1000);
        assert!(ctl.rand_en());
        assert_eq!(ctl.max_cnt(), 0x1000);
        assert!(!ctl.valid());
        assert!(!ctl.enabled());
    }
}
