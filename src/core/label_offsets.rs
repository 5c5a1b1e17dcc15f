//! Instruction-distance estimates between branches and their targets.
//!
//! Before emission the tracker numbers every instruction of the live blocks
//! (in code emitting order) and remembers the number of the instruction binding
//! each label. Branch encoders ask [`LabelOffsets::within_range`] whether a
//! target is close enough, counted in instructions, to try a short
//! encoding. The answer is only an estimate; if it turns out wrong the
//! assembler reports a range violation and the unit is re-emitted with the
//! tracker switched to conservative mode.

use hashbrown::HashMap;

use super::lir::{InstId, Label, Lir, LirOp};

#[derive(Debug, Clone, Default)]
pub struct LabelOffsets {
    label_positions: HashMap<Label, u32>,
    inst_positions: HashMap<InstId, u32>,
    conservative: bool,
}

impl LabelOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number all instructions of the live blocks in emitting order.
    pub fn build<O: LirOp>(lir: &Lir<O>) -> Self {
        let mut offsets = Self::new();
        let mut position = 0u32;
        for block in lir.emitted_blocks() {
            for inst in &block.ops {
                if let Some(label) = inst.op.bound_label() {
                    offsets.label_positions.insert(label, position);
                }
                offsets.inst_positions.insert(inst.id, position);
                position += 1;
            }
        }
        offsets
    }

    /// True only if both positions are known and strictly less than
    /// `max_distance` instructions apart. Always false in conservative mode.
    pub fn within_range(&self, from: InstId, label: Label, max_distance: u32) -> bool {
        if self.conservative {
            return false;
        }
        match (
            self.label_positions.get(&label),
            self.inst_positions.get(&from),
        ) {
            (Some(&label_pos), Some(&inst_pos)) => label_pos.abs_diff(inst_pos) < max_distance,
            _ => false,
        }
    }

    pub fn set_conservative(&mut self) {
        self.conservative = true;
    }

    pub fn is_conservative(&self) -> bool {
        self.conservative
    }

    pub fn label_position(&self, label: Label) -> Option<u32> {
        self.label_positions.get(&label).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lir::InsertPoint;
    use crate::x64::ops::X64Op;

    #[test]
    fn test_distances_skip_deleted_blocks() {
        let mut lir: Lir<X64Op> = Lir::new("offsets");
        let b0 = lir.add_block();
        let b1 = lir.add_block();
        let b2 = lir.add_block();
        let nop = lir.push(InsertPoint::Block(b0), X64Op::Nop(1)).unwrap();
        lir.push(InsertPoint::Block(b1), X64Op::Nop(1));
        lir.push(InsertPoint::Block(b1), X64Op::Nop(1));
        lir.delete_block(b1);

        let b2_label = lir.block_label(b2).unwrap();
        let mut offsets = LabelOffsets::build(&lir);
        // b0: label, nop; b2: label
        assert_eq!(offsets.label_position(b2_label), Some(2));
        assert!(offsets.within_range(nop, b2_label, 2));
        assert!(!offsets.within_range(nop, b2_label, 1));

        offsets.set_conservative();
        assert!(offsets.is_conservative());
        assert!(!offsets.within_range(nop, b2_label, 16));
    }

    #[test]
    fn test_distances_follow_emitting_order() {
        let mut lir: Lir<X64Op> = Lir::new("offsets");
        let b0 = lir.add_block();
        let b1 = lir.add_block();
        let b2 = lir.add_block();
        let b3 = lir.add_block();
        let nop = lir.push(InsertPoint::Block(b0), X64Op::Nop(1)).unwrap();
        for _ in 0..4 {
            lir.push(InsertPoint::Block(b1), X64Op::Nop(1));
        }
        lir.delete_block(b2);
        lir.set_code_emitting_order(vec![b0, b3, b2, b1]);

        let offsets = LabelOffsets::build(&lir);
        let b3_label = lir.block_label(b3).unwrap();
        let b1_label = lir.block_label(b1).unwrap();
        // b0: label, nop; b3: label; b1: label, 4 nops
        assert_eq!(offsets.label_position(b3_label), Some(2));
        assert_eq!(offsets.label_position(b1_label), Some(3));
        assert!(offsets.within_range(nop, b3_label, 2));
    }

    #[test]
    fn test_slow_path_labels_are_unknown() {
        let mut lir: Lir<X64Op> = Lir::new("offsets");
        let b0 = lir.add_block();
        let slow = lir.add_slow_path(None);
        let jump = lir.push(InsertPoint::Block(b0), X64Op::Halt).unwrap();
        let offsets = LabelOffsets::build(&lir);
        let label = lir.slow_path_label(slow).unwrap();
        assert_eq!(offsets.label_position(label), None);
        assert!(!offsets.within_range(jump, label, u32::MAX));
    }
}
