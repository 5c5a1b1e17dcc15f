//! Register identifiers and register sets.
//!
//! Registers are already assigned when code is emitted, so this module only
//! names them: an [`AsmReg`] is a (bank, id) pair and a [`RegBitSet`] is a
//! per-bank bit mask used for callee-saved and argument register sets.

/// Maximum number of register banks supported (GP, FP, etc.).
pub const MAX_REGISTER_BANKS: usize = 4;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const GP_BANK: RegBank = 0;
    pub const FP_BANK: RegBank = 1;

    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self::new(Self::GP_BANK, id)
    }

    pub const fn fp(id: RegId) -> Self {
        Self::new(Self::FP_BANK, id)
    }

    pub const fn is_gp(&self) -> bool {
        self.bank == Self::GP_BANK
    }

    pub const fn is_fp(&self) -> bool {
        self.bank == Self::FP_BANK
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|&b| b == 0)
    }

    pub fn count(&self) -> u32 {
        self.banks.iter().map(|b| b.count_ones()).sum()
    }

    /// Registers in ascending (bank, id) order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        self.banks.iter().enumerate().flat_map(|(bank, &mask)| {
            (0..64u8)
                .filter(move |id| mask & (1u64 << id) != 0)
                .map(move |id| AsmReg::new(bank as RegBank, id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_iteration_order() {
        let set = RegBitSet::from_regs(&[AsmReg::gp(12), AsmReg::fp(0), AsmReg::gp(3)]);
        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![AsmReg::gp(3), AsmReg::gp(12), AsmReg::fp(0)]);
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn test_clear() {
        let mut set = RegBitSet::from_regs(&[AsmReg::gp(1)]);
        assert!(set.contains(AsmReg::gp(1)));
        set.clear(AsmReg::gp(1));
        assert!(set.is_empty());
    }
}
