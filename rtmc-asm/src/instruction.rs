use core::fmt;

use crate::Opcode;

/// A single bytecode instruction.
///
/// Operands are raw little-endian words; their interpretation is fixed by the
/// opcode (addresses, pool indices, sizes). In debug builds the source line
/// and column the instruction was generated from are carried along; release
/// builds zero both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    /// Dispatched opcode.
    pub opcode: Opcode,
    /// Raw operand words.
    pub operands: Vec<u32>,
    /// One-based source line, zero when unknown or stripped.
    pub line: u32,
    /// One-based source column, zero when unknown or stripped.
    pub column: u32,
}

impl Instruction {
    /// Create an instruction without source position.
    pub fn new(opcode: Opcode, operands: Vec<u32>) -> Self {
        Self {
            opcode,
            operands,
            line: 0,
            column: 0,
        }
    }

    /// Attach a source position.
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    /// Whether the operand count matches what the opcode expects.
    pub fn is_well_formed(&self) -> bool {
        match self.opcode.operand_count() {
            Some(count) => self.operands.len() == count,
            None => true,
        }
    }
}

impl From<Opcode> for Instruction {
    fn from(opcode: Opcode) -> Self {
        Self::new(opcode, Vec::new())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for operand in &self.operands {
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_disassembly_shape() {
        let instr = Instruction::new(Opcode::Call, vec![17, 2]);
        assert_eq!(instr.to_string(), "CALL 17 2");
        assert_eq!(Instruction::from(Opcode::Ret).to_string(), "RET");
    }

    #[test]
    fn operand_arity_check() {
        assert!(Instruction::new(Opcode::Jump, vec![3]).is_well_formed());
        assert!(!Instruction::new(Opcode::Jump, vec![]).is_well_formed());
        // SYSCALL accepts any operand count.
        assert!(Instruction::new(Opcode::Syscall, vec![1, 2, 3]).is_well_formed());
    }
}
