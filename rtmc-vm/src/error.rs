//! Runtime error taxonomy.
//!
//! A `VmError` terminates the task that raised it; other tasks keep
//! running. The failure is logged with the task name and program counter by
//! the task's executor.

/// Runtime failures of one executing task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: u32 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("invalid constant index {0}")]
    InvalidConstant(u32),
    #[error("invalid string index {0}")]
    InvalidString(u32),
    #[error("invalid message queue id {0}")]
    InvalidQueue(u32),
    #[error("invalid semaphore handle {0}")]
    InvalidSemaphore(u32),
    #[error("null pointer dereference")]
    NullPointer,
    #[error("dereference of unmapped address {0}")]
    InvalidPointer(u32),
    #[error("{kind} {id} not initialized")]
    UninitializedPeripheral { kind: &'static str, id: i64 },
    #[error("GPIO {pin} not configured as output")]
    NotAnOutput { pin: i64 },
    #[error("operation requires an integer value")]
    IntegerExpected,
    #[error("malformed instruction at pc {pc}")]
    MalformedInstruction { pc: u32 },
    #[error("program has no 'main' function")]
    NoMain,
}
