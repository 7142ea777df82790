use indexmap::IndexMap;
use quickcheck_macros::quickcheck;
use rstest::rstest;

use crate::{
    encoding::{self, EncodingError, MAGIC},
    BytecodeProgram, CompileMode, ConstValue, Instruction, Opcode,
};

fn sample_program() -> BytecodeProgram {
    let mut program = BytecodeProgram {
        mode: CompileMode::Release,
        ..Default::default()
    };

    program.add_constant(ConstValue::Int(42));
    program.add_constant(ConstValue::Float(2.5));
    program.add_constant(ConstValue::Str("blink".into()));
    program.add_string("Result: {}");

    program.symbols.insert("counter".into(), 0);
    program.symbols.insert("Q".into(), 1);
    program.functions.insert("main".into(), 0);
    program.functions.insert("worker".into(), 9);

    let mut fields = IndexMap::new();
    fields.insert("a".into(), 0);
    fields.insert("b".into(), 4);
    program.struct_layouts.insert("Pair".into(), fields);

    program.instructions = vec![
        Instruction::new(Opcode::LoadConst, vec![0]),
        Instruction::new(Opcode::StoreVar, vec![0]),
        Instruction::new(Opcode::Jump, vec![4]),
        Instruction::from(Opcode::Nop),
        Instruction::from(Opcode::Halt),
    ];

    program
}

#[test]
fn round_trip_preserves_everything() {
    let program = sample_program();
    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).unwrap();
    assert_eq!(decoded, program);
}

#[test]
fn header_is_magic_then_version() {
    let bytes = encoding::to_bytes(&sample_program());
    assert_eq!(&bytes[..9], &MAGIC);
    assert_eq!(&bytes[9..13], &1u32.to_le_bytes());
}

#[test]
fn bad_magic_is_rejected() {
    let mut bytes = encoding::to_bytes(&sample_program());
    bytes[0] = b'X';
    assert!(matches!(
        encoding::from_bytes(&bytes),
        Err(EncodingError::BadMagic)
    ));
}

#[test]
fn unsupported_version_is_rejected() {
    let mut bytes = encoding::to_bytes(&sample_program());
    bytes[9..13].copy_from_slice(&7u32.to_le_bytes());
    assert!(matches!(
        encoding::from_bytes(&bytes),
        Err(EncodingError::UnsupportedVersion(7))
    ));
}

#[test]
fn truncated_stream_is_an_io_error() {
    let bytes = encoding::to_bytes(&sample_program());
    assert!(matches!(
        encoding::from_bytes(&bytes[..bytes.len() - 2]),
        Err(EncodingError::Io(_))
    ));
}

#[rstest]
#[case(ConstValue::Int(0))]
#[case(ConstValue::Int(-1))]
#[case(ConstValue::Int(i32::MAX as i64))]
#[case(ConstValue::Int(i32::MIN as i64))]
#[case(ConstValue::Float(0.25))]
#[case(ConstValue::Float(f32::INFINITY))]
#[case(ConstValue::Str(String::new()))]
#[case(ConstValue::Str("µ-controller".into()))]
fn constant_entries_round_trip(#[case] constant: ConstValue) {
    let mut program = BytecodeProgram {
        mode: CompileMode::Release,
        ..Default::default()
    };
    program.constants.push(constant.clone());

    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).unwrap();
    assert_eq!(decoded.constants, vec![constant]);
}

#[quickcheck]
fn qc_int_constants_round_trip(value: i32) -> bool {
    let mut program = BytecodeProgram::default();
    program.constants.push(ConstValue::Int(value as i64));
    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).unwrap();
    decoded.constants == vec![ConstValue::Int(value as i64)]
}

#[quickcheck]
fn qc_instruction_operands_round_trip(operands: Vec<u32>) -> bool {
    let operands: Vec<u32> = operands.into_iter().take(255).collect();
    let mut program = BytecodeProgram::default();
    program
        .instructions
        .push(Instruction::new(Opcode::Syscall, operands.clone()));
    let decoded = encoding::from_bytes(&encoding::to_bytes(&program)).unwrap();
    decoded.instructions[0].operands == operands
}
