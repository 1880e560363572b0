//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, manages
//! forward jumps that need patching, tracks source locations for the side
//! table, and runs the final cell-promotion pass that rewrites accesses to
//! captured local slots into cell accesses.

use super::{
    code::{Code, ConstPool, Constant, LocationEntry},
    op::Opcode,
};
use crate::source::Pos;

/// Label for a forward jump that needs patching.
///
/// Stores the bytecode offset of the jump opcode; pass it to
/// [`CodeBuilder::patch_jump`] once the target is known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(usize);

/// Builder for one code unit.
#[derive(Debug, Default)]
pub(crate) struct CodeBuilder {
    bytecode: Vec<u8>,
    consts: ConstPool,
    /// Instruction start offsets in emission order, for the cell-promotion
    /// pass (it must walk instruction boundaries, not raw bytes).
    instruction_offsets: Vec<usize>,
    locations: Vec<LocationEntry>,
    current_location: Pos,
    last_recorded: Pos,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source position recorded for subsequent instructions.
    pub fn set_location(&mut self, pos: Pos) {
        if pos.is_some() {
            self.current_location = pos;
        }
    }

    fn start_instruction(&mut self) {
        self.instruction_offsets.push(self.bytecode.len());
        if self.current_location != self.last_recorded && self.current_location.is_some() {
            self.locations.push(LocationEntry {
                offset: u32::try_from(self.bytecode.len()).expect("bytecode length exceeds u32"),
                pos: self.current_location,
            });
            self.last_recorded = self.current_location;
        }
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
    }

    /// Emits an instruction with an i8 operand.
    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand.to_ne_bytes()[0]);
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    /// Emits a forward jump with a placeholder offset.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0_i16.to_le_bytes());
        label
    }

    /// Patches a forward jump to land at the current offset.
    ///
    /// The offset is relative to the position after the jump's operand.
    ///
    /// # Panics
    /// Panics if the distance exceeds the i16 operand range; functions
    /// large enough to hit this are rejected earlier by the compiler's
    /// size diagnostics.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let raw = i64::try_from(target).expect("offset fits i64") - i64::try_from(label.0).expect("offset fits i64") - 3;
        let offset = i16::try_from(raw).expect("jump offset exceeds i16 range");
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to a known target offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let current = self.bytecode.len();
        let raw = i64::try_from(target).expect("offset fits i64") - (i64::try_from(current).expect("offset fits i64") + 3);
        let offset = i16::try_from(raw).expect("jump offset exceeds i16 range");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
    }

    /// Current bytecode offset; record this before emitting a loop body to
    /// target it with a backward jump.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool, deduplicating by value.
    /// Returns `None` when the pool overflows its operand range.
    #[must_use]
    pub fn add_const(&mut self, constant: Constant) -> Option<u16> {
        self.consts.add(constant)
    }

    /// Rewrites local accesses to the given slots into cell accesses.
    ///
    /// Runs once, after a function body is fully compiled and its captured
    /// slots are known. The rewrite swaps opcode bytes only, so lengths,
    /// jump targets, and the location table are unaffected.
    pub fn promote_cell_slots(&mut self, cell_slots: &[u16]) {
        if cell_slots.is_empty() {
            return;
        }
        for &ip in &self.instruction_offsets {
            let op = Opcode::decode(self.bytecode[ip]);
            let replacement = match op {
                Opcode::LoadLocal => Opcode::LoadLocalCell,
                Opcode::StoreLocal => Opcode::StoreLocalCell,
                _ => continue,
            };
            let slot = u16::from(self.bytecode[ip + 1]);
            if cell_slots.contains(&slot) {
                self.bytecode[ip] = replacement as u8;
            }
        }
    }

    /// Finishes the unit.
    #[must_use]
    pub fn build(self) -> Code {
        Code::new(self.bytecode, self.consts, self.locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Pop);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadNil as u8, Opcode::Pop as u8]);
    }

    #[test]
    fn emit_u16_is_little_endian() {
        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::LoadConst, 0x1234);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::LoadConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn forward_jump_patches_relative_offset() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::LoadNil);
        builder.patch_jump(jump);
        builder.emit(Opcode::Return);
        let code = builder.build();
        // Jump at 0, operand ends at 3, target 5: offset 2.
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::Jump as u8,
                2,
                0,
                Opcode::LoadNil as u8,
                Opcode::LoadNil as u8,
                Opcode::Return as u8,
            ]
        );
    }

    #[test]
    fn backward_jump() {
        let mut builder = CodeBuilder::new();
        let start = builder.current_offset();
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Pop);
        builder.emit_jump_to(Opcode::Jump, start);
        let code = builder.build();
        let expected = (-5_i16).to_le_bytes();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadNil as u8,
                Opcode::Pop as u8,
                Opcode::Jump as u8,
                expected[0],
                expected[1],
            ]
        );
    }

    #[test]
    fn cell_promotion_rewrites_only_matching_slots() {
        let mut builder = CodeBuilder::new();
        builder.emit_u8(Opcode::LoadLocal, 0);
        builder.emit_u8(Opcode::StoreLocal, 1);
        builder.emit_u8(Opcode::LoadLocal, 1);
        // An unrelated instruction whose operand byte happens to be 1.
        builder.emit_u8(Opcode::Call, 1);
        builder.promote_cell_slots(&[1]);
        let code = builder.build();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::LoadLocal as u8,
                0,
                Opcode::StoreLocalCell as u8,
                1,
                Opcode::LoadLocalCell as u8,
                1,
                Opcode::Call as u8,
                1,
            ]
        );
    }

    #[test]
    fn locations_record_changes_only() {
        let mut set = crate::source::FileSet::new();
        let id = set.add_file("t.toy", "abc".to_owned());
        let p0 = set.pos(id, 0);
        let p2 = set.pos(id, 2);
        let mut builder = CodeBuilder::new();
        builder.set_location(p0);
        builder.emit(Opcode::LoadNil);
        builder.emit(Opcode::Pop);
        builder.set_location(p2);
        builder.emit(Opcode::Return);
        let code = builder.build();
        assert_eq!(code.position_at(0), p0);
        assert_eq!(code.position_at(1), p0);
        assert_eq!(code.position_at(2), p2);
    }
}
