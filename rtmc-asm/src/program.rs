use core::fmt;
use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::Instruction;

/// Compilation mode recorded in a program.
///
/// Debug programs carry per-instruction source positions and `COMMENT`
/// annotations; release programs strip both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompileMode {
    /// Keep source positions and annotations.
    #[default]
    Debug,
    /// Strip positions and annotations.
    Release,
}

/// A constant-pool entry.
///
/// Pool deduplication compares integers and strings by value and floats by
/// bit pattern, so `0.0` and `-0.0` occupy distinct slots while a repeated
/// `NaN` payload does not.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstValue {
    /// Signed integer; encoded on disk as its 32-bit two's complement.
    Int(i64),
    /// Single-precision float.
    Float(f32),
    /// UTF-8 string.
    Str(String),
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// A complete compiled program: every pool and table the VM needs, plus the
/// linear instruction stream. Immutable once generation finishes.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BytecodeProgram {
    /// Constant pool, indexed by `LOAD_CONST`.
    pub constants: Vec<ConstValue>,
    /// String pool, indexed by the debug and message opcodes.
    pub strings: Vec<String>,
    /// Function name to entry instruction index, in declaration order.
    pub functions: IndexMap<String, u32>,
    /// Global symbol name to address, in declaration order.
    pub symbols: IndexMap<String, u32>,
    /// Struct name to field byte offsets, for the VM's introspection.
    pub struct_layouts: IndexMap<String, IndexMap<String, u32>>,
    /// The instruction stream.
    pub instructions: Vec<Instruction>,
    /// Mode the program was compiled in.
    pub mode: CompileMode,
    /// Instruction index to source line, populated in debug mode.
    pub debug_info: BTreeMap<u32, u32>,
}

impl BytecodeProgram {
    /// Intern a constant, reusing an existing pool slot when the value is
    /// already present.
    pub fn add_constant(&mut self, value: ConstValue) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| *c == value) {
            return index as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// Intern a string, reusing an existing pool slot when present.
    pub fn add_string(&mut self, string: &str) -> u32 {
        if let Some(index) = self.strings.iter().position(|s| s == string) {
            return index as u32;
        }
        self.strings.push(string.to_owned());
        (self.strings.len() - 1) as u32
    }

    /// Textual dump of every pool, table and instruction.
    pub fn disassemble(&self) -> String {
        use fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "=== CONSTANTS ===");
        for (i, constant) in self.constants.iter().enumerate() {
            let _ = writeln!(out, "{i:4}: {constant}");
        }

        let _ = writeln!(out, "\n=== STRINGS ===");
        for (i, string) in self.strings.iter().enumerate() {
            let _ = writeln!(out, "{i:4}: {string:?}");
        }

        let _ = writeln!(out, "\n=== FUNCTIONS ===");
        for (name, address) in &self.functions {
            let _ = writeln!(out, "{name}: {address}");
        }

        let _ = writeln!(out, "\n=== SYMBOLS ===");
        for (name, address) in &self.symbols {
            let _ = writeln!(out, "{name}: {address}");
        }

        let _ = writeln!(out, "\n=== STRUCTS ===");
        for (name, fields) in &self.struct_layouts {
            let _ = writeln!(out, "{name}:");
            for (field, offset) in fields {
                let _ = writeln!(out, "  {field}: {offset}");
            }
        }

        let _ = writeln!(out, "\n=== BYTECODE ===");
        for (i, instruction) in self.instructions.iter().enumerate() {
            let _ = writeln!(out, "{i:4}: {instruction}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_dedup_is_by_value() {
        let mut program = BytecodeProgram::default();
        let a = program.add_constant(ConstValue::Int(5));
        let b = program.add_constant(ConstValue::Int(5));
        let c = program.add_constant(ConstValue::Int(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn float_dedup_is_by_bit_pattern() {
        let mut program = BytecodeProgram::default();
        let pos = program.add_constant(ConstValue::Float(0.0));
        let neg = program.add_constant(ConstValue::Float(-0.0));
        assert_ne!(pos, neg);

        let nan_a = program.add_constant(ConstValue::Float(f32::NAN));
        let nan_b = program.add_constant(ConstValue::Float(f32::NAN));
        assert_eq!(nan_a, nan_b);
    }

    #[test]
    fn int_and_float_never_share_a_slot() {
        let mut program = BytecodeProgram::default();
        let int = program.add_constant(ConstValue::Int(1));
        let float = program.add_constant(ConstValue::Float(1.0));
        assert_ne!(int, float);
    }

    #[test]
    fn disassembly_lists_every_section() {
        use crate::Opcode;

        let mut program = BytecodeProgram::default();
        program.add_constant(ConstValue::Int(7));
        program.add_string("hello");
        program.functions.insert("main".into(), 0);
        program.symbols.insert("x".into(), 3);
        program
            .instructions
            .push(Instruction::new(Opcode::LoadConst, vec![0]));

        let text = program.disassemble();
        assert!(text.contains("=== CONSTANTS ==="));
        assert!(text.contains("\"hello\""));
        assert!(text.contains("main: 0"));
        assert!(text.contains("x: 3"));
        assert!(text.contains("0: LOAD_CONST 0"));
    }
}
