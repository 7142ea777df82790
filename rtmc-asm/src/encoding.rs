//! The `.vmb` on-disk program format.
//!
//! Little-endian throughout:
//!
//! ```text
//! +--------------------+------------------------------------------+
//! | Magic "MINICRTOS"  | 9 bytes                                  |
//! | Version            | u32 = 1                                  |
//! | Constant pool      | u32 count, then per entry:               |
//! |                    |   u8 tag; 0 -> u32 int, 1 -> f32 bits,   |
//! |                    |   2 -> u16 len + UTF-8 bytes             |
//! | String pool        | u32 count, then u16 len + UTF-8 each     |
//! | Symbol table       | u32 count, then u16 len + name + u32 addr|
//! | Function table     | same layout as the symbol table          |
//! | Struct layouts     | u32 count, then per struct:              |
//! |                    |   u16 len + name, u32 field count,       |
//! |                    |   per field u16 len + name + u32 offset  |
//! | Instructions       | u32 count, then per instruction:         |
//! |                    |   u8 opcode, u8 operand count,           |
//! |                    |   operand count x u32                    |
//! +--------------------+------------------------------------------+
//! ```
//!
//! Source positions and `debug_info` are not part of the format; a program
//! read back carries zeroed positions and reports [`CompileMode::Release`].

use std::io::{self, Read, Write};

use indexmap::IndexMap;

use crate::{BytecodeProgram, CompileMode, ConstValue, Instruction, Opcode};

/// File magic, the first nine bytes of every `.vmb` file.
pub const MAGIC: [u8; 9] = *b"MINICRTOS";

/// Current format version.
pub const VERSION: u32 = 1;

/// Failures while decoding a `.vmb` stream.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// Underlying stream failure, including truncation.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The stream does not start with [`MAGIC`].
    #[error("invalid bytecode file: bad magic header")]
    BadMagic,
    /// The version word is not [`VERSION`].
    #[error("unsupported bytecode version: {0}")]
    UnsupportedVersion(u32),
    /// A constant-pool entry carries an unknown type tag.
    #[error("unknown constant tag: {0}")]
    UnknownConstTag(u8),
    /// An instruction byte is not a known opcode.
    #[error(transparent)]
    UnknownOpcode(#[from] crate::InvalidOpcode),
    /// A pooled name or string is not valid UTF-8.
    #[error("malformed UTF-8 in pooled string")]
    InvalidUtf8,
}

/// Serialize a program to a `.vmb` stream.
pub fn write_program<W: Write>(program: &BytecodeProgram, w: &mut W) -> io::Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;

    w.write_all(&(program.constants.len() as u32).to_le_bytes())?;
    for constant in &program.constants {
        match constant {
            ConstValue::Int(v) => {
                w.write_all(&[0u8])?;
                w.write_all(&(*v as u32).to_le_bytes())?;
            }
            ConstValue::Float(v) => {
                w.write_all(&[1u8])?;
                w.write_all(&v.to_bits().to_le_bytes())?;
            }
            ConstValue::Str(v) => {
                w.write_all(&[2u8])?;
                write_short_str(w, v)?;
            }
        }
    }

    w.write_all(&(program.strings.len() as u32).to_le_bytes())?;
    for string in &program.strings {
        write_short_str(w, string)?;
    }

    write_address_table(w, &program.symbols)?;
    write_address_table(w, &program.functions)?;

    w.write_all(&(program.struct_layouts.len() as u32).to_le_bytes())?;
    for (name, fields) in &program.struct_layouts {
        write_short_str(w, name)?;
        w.write_all(&(fields.len() as u32).to_le_bytes())?;
        for (field, offset) in fields {
            write_short_str(w, field)?;
            w.write_all(&offset.to_le_bytes())?;
        }
    }

    w.write_all(&(program.instructions.len() as u32).to_le_bytes())?;
    for instruction in &program.instructions {
        w.write_all(&[instruction.opcode.into(), instruction.operands.len() as u8])?;
        for operand in &instruction.operands {
            w.write_all(&operand.to_le_bytes())?;
        }
    }

    Ok(())
}

/// Deserialize a program from a `.vmb` stream.
pub fn read_program<R: Read>(r: &mut R) -> Result<BytecodeProgram, EncodingError> {
    let mut magic = [0u8; 9];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(EncodingError::BadMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(EncodingError::UnsupportedVersion(version));
    }

    let constant_count = read_u32(r)?;
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let constant = match tag[0] {
            0 => ConstValue::Int(read_u32(r)? as i32 as i64),
            1 => ConstValue::Float(f32::from_bits(read_u32(r)?)),
            2 => ConstValue::Str(read_short_str(r)?),
            tag => return Err(EncodingError::UnknownConstTag(tag)),
        };
        constants.push(constant);
    }

    let string_count = read_u32(r)?;
    let mut strings = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        strings.push(read_short_str(r)?);
    }

    let symbols = read_address_table(r)?;
    let functions = read_address_table(r)?;

    let struct_count = read_u32(r)?;
    let mut struct_layouts = IndexMap::new();
    for _ in 0..struct_count {
        let name = read_short_str(r)?;
        let field_count = read_u32(r)?;
        let mut fields = IndexMap::new();
        for _ in 0..field_count {
            let field = read_short_str(r)?;
            let offset = read_u32(r)?;
            fields.insert(field, offset);
        }
        struct_layouts.insert(name, fields);
    }

    let instruction_count = read_u32(r)?;
    let mut instructions = Vec::with_capacity(instruction_count as usize);
    for _ in 0..instruction_count {
        let mut head = [0u8; 2];
        r.read_exact(&mut head)?;
        let opcode = Opcode::try_from(head[0])?;
        let mut operands = Vec::with_capacity(head[1] as usize);
        for _ in 0..head[1] {
            operands.push(read_u32(r)?);
        }
        instructions.push(Instruction::new(opcode, operands));
    }

    Ok(BytecodeProgram {
        constants,
        strings,
        functions,
        symbols,
        struct_layouts,
        instructions,
        mode: CompileMode::Release,
        debug_info: Default::default(),
    })
}

/// Serialize to an in-memory buffer.
pub fn to_bytes(program: &BytecodeProgram) -> Vec<u8> {
    let mut buf = Vec::new();
    write_program(program, &mut buf).expect("writing to a Vec cannot fail");
    buf
}

/// Deserialize from an in-memory buffer.
pub fn from_bytes(bytes: &[u8]) -> Result<BytecodeProgram, EncodingError> {
    read_program(&mut io::Cursor::new(bytes))
}

fn write_short_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u16).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn write_address_table<W: Write>(
    w: &mut W,
    table: &IndexMap<String, u32>,
) -> io::Result<()> {
    w.write_all(&(table.len() as u32).to_le_bytes())?;
    for (name, address) in table {
        write_short_str(w, name)?;
        w.write_all(&address.to_le_bytes())?;
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_short_str<R: Read>(r: &mut R) -> Result<String, EncodingError> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u16::from_le_bytes(len) as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)
}

fn read_address_table<R: Read>(
    r: &mut R,
) -> Result<IndexMap<String, u32>, EncodingError> {
    let count = read_u32(r)?;
    let mut table = IndexMap::new();
    for _ in 0..count {
        let name = read_short_str(r)?;
        let address = read_u32(r)?;
        table.insert(name, address);
    }
    Ok(table)
}
