//! RTMC virtual machine.
//!
//! A stack-based interpreter over [`rtmc_asm::BytecodeProgram`] with a
//! threaded task scheduler, bounded message queues with receive timeouts,
//! counting semaphores and a simulated peripheral set (GPIO, timers, ADC,
//! UART, SPI, I²C).
//!
//! Each task runs in its own worker thread and owns its program counter,
//! operand stack and call stack; memory, the task table, queues, semaphores
//! and the hardware simulator are shared behind a single lock taken once
//! per executed opcode. Opcodes are individually atomic; composite
//! read-modify-write sequences are not, and programs guard them with
//! semaphores.

#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod error;
mod executor;
mod hardware;
mod machine;
mod memory;
mod output;
mod queue;
mod task;
mod value;

pub use error::VmError;
pub use hardware::HardwareSimulator;
pub use machine::Machine;
pub use memory::Memory;
pub use output::{CaptureSink, OutputSink, StdoutSink};
pub use queue::{MessageQueue, Semaphore, QUEUE_CAPACITY};
pub use task::{Task, TaskState};
pub use value::Value;
