//! Capability descriptor and CPU topology inputs.
//!
//! Feature probing (CPUID decoding, family/model matching) happens outside
//! this crate; the results arrive here as a [`Capabilities`] set plus a
//! [`Topology`] describing which logical CPUs share a physical core. The
//! core consumes these without knowing how they were derived.

use bitflags::bitflags;

bitflags! {
    /// What the sampling hardware on a CPU supports, plus which erratum
    /// workarounds its family requires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Fetch sampling is implemented.
        const FETCH_SAMPLING = 1 << 0;
        /// Op sampling is implemented.
        const OP_SAMPLING = 1 << 1;
        /// The branch target address register is implemented (Llano+).
        const BRN_TRGT = 1 << 2;
        /// The op counters use the extended 27-bit layout (Llano+).
        const OP_CNT_EXT = 1 << 3;
        /// RIP-invalid checking is implemented.
        const RIP_INVALID_CHK = 1 << 4;
        /// Fused-branch micro-op indication is implemented.
        const OP_BRN_FUSE = 1 << 5;
        /// The extended fetch control register is implemented (Carrizo+).
        const FETCH_CTL_EXTD = 1 << 6;
        /// The op data 4 register is implemented (Carrizo, Stoney Ridge).
        const OP_DATA4 = 1 << 7;

        /// Family 10h erratum 420: the sampling engine may generate an
        /// interrupt that cannot be cleared; disabling needs a prelude.
        const WA_FAM10H_ERR_420 = 1 << 8;
        /// Family 15h erratum 718: some op data 3 bits are set but never
        /// cleared by the processor; scrub the register after each sample.
        const WA_FAM15H_ERR_718 = 1 << 9;
        /// Family 17h model 01h: sampling must be switched on through
        /// sibling-shared configuration registers before use.
        const WA_FAM17H_ZN = 1 << 10;
    }
}

impl Capabilities {
    /// Whether the given sampling flavor is available at all.
    pub fn supports(&self, flavor: crate::Flavor) -> bool {
        match flavor {
            crate::Flavor::Op => self.contains(Capabilities::OP_SAMPLING),
            crate::Flavor::Fetch => self.contains(Capabilities::FETCH_SAMPLING),
        }
    }
}

/// Mapping from logical CPU to the physical core it lives on.
///
/// Workarounds that touch sibling-shared registers serialise on the
/// physical core, so every register read-modify-write that is visible to a
/// hyperthread sibling is keyed through this table.
#[derive(Debug, Clone)]
pub struct Topology {
    core_of: Vec<usize>,
}

impl Topology {
    /// Build a topology from a per-CPU physical core id table.
    pub fn new(core_of: Vec<usize>) -> Topology {
        Topology { core_of }
    }

    /// A topology with no hyperthreading: every CPU is its own core.
    pub fn flat(num_cpus: usize) -> Topology {
        Topology {
            core_of: (0..num_cpus).collect(),
        }
    }

    /// Number of logical CPUs.
    pub fn num_cpus(&self) -> usize {
        self.core_of.len()
    }

    /// Physical core id of a logical CPU.
    pub fn physical_core(&self, cpu: usize) -> usize {
        self.core_of[cpu]
    }

    /// All logical CPUs sharing `cpu`'s physical core, including `cpu`.
    pub fn siblings(&self, cpu: usize) -> impl Iterator<Item = usize> + '_ {
        let core = self.core_of[cpu];
        self.core_of
            .iter()
            .enumerate()
            .filter(move |(_, c)| **c == core)
            .map(|(i, _)| i)
    }

    /// The lowest-numbered sibling of `cpu`; workaround state for the
    /// whole physical core is anchored on this CPU.
    pub fn first_sibling(&self, cpu: usize) -> usize {
        self.siblings(cpu).next().unwrap_or(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_topology() {
        let topo = Topology::flat(4);
        assert_eq!(topo.num_cpus(), 4);
        assert_eq!(topo.first_sibling(3), 3);
        assert_eq!(topo.siblings(2).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_smt_siblings() {
        // Two physical cores, two threads each: cpus 0/2 on core 0,
        // cpus 1/3 on core 1.
        let topo = Topology::new(vec![0, 1, 0, 1]);
        assert_eq!(topo.siblings(2).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(topo.first_sibling(3), 1);
        assert_eq!(topo.physical_core(3), 1);
    }
}
