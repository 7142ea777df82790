//! Instruction set and on-disk bytecode format of the RT-Micro-C VM.
//!
//! This crate is the only contract between the compiler and the virtual
//! machine: the compiler produces a [`BytecodeProgram`], the VM consumes one,
//! and the `.vmb` encoding in [`encoding`] moves programs between processes.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod consts;
mod instruction;
mod opcode;
mod program;

pub mod encoding;

#[cfg(test)]
mod encoding_tests;

pub use consts::*;
pub use instruction::Instruction;
pub use opcode::{InvalidOpcode, Opcode};
pub use program::{BytecodeProgram, CompileMode, ConstValue};
