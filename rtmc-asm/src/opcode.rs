use core::fmt;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::FromRepr,
    strum::Display,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
/// Instruction opcodes of the RT-Micro-C virtual machine.
///
/// The discriminants are the on-disk `u8` values of the `.vmb` instruction
/// stream; the ordering is stable and must never be rearranged.
///
/// Most RTOS/hardware opcodes take their arguments from the operand stack and
/// carry no instruction operands. The exceptions are listed per opcode.
pub enum Opcode {
    /// Unconditional jump. Operand: target instruction index.
    Jump = 0x00,
    /// Pop a condition; jump to the operand target if it is truthy.
    JumpifTrue = 0x01,
    /// Pop a condition; jump to the operand target if it is falsy.
    JumpifFalse = 0x02,
    /// Call a function. Operands: function address, parameter count.
    ///
    /// Pops `count` arguments, saves the current parameter cells, installs
    /// the arguments at the parameter segment and transfers control.
    Call = 0x03,
    /// Return from the current function, restoring the caller's parameter
    /// cells. With an empty call stack, ends the task.
    Ret = 0x04,

    /// Push a constant-pool entry. Operand: pool index.
    LoadConst = 0x05,
    /// Push the value of a variable. Operand: compile-time address.
    LoadVar = 0x06,
    /// Pop a value into a variable. Operand: compile-time address.
    StoreVar = 0x07,
    /// Push a struct field. Operands: base address, byte offset.
    LoadStructMember = 0x08,
    /// Pop a value into a struct field. Operands: base address, byte offset.
    StoreStructMember = 0x09,
    /// Push a bit-field value. Operands: base address, byte offset,
    /// bit offset, bit width. A base of [`crate::STACK_BASE_SENTINEL`]
    /// means the base address is popped from the stack.
    LoadStructMemberBit = 0x0a,
    /// Pop a value into a bit-field. Operands as for
    /// [`Opcode::LoadStructMemberBit`].
    StoreStructMemberBit = 0x0b,
    /// Push the runtime address of a variable. Operand: compile-time address.
    LoadAddr = 0x0c,
    /// Pop an address and push the value stored there.
    LoadDeref = 0x0d,
    /// Pop a value, pop an address, store the value at the address.
    StoreDeref = 0x0e,

    /// Pop two values, push their sum.
    Add = 0x0f,
    /// Pop two values, push their difference.
    Sub = 0x10,
    /// Pop two values, push their product.
    Mul = 0x11,
    /// Pop two values, push their quotient. Division by zero is a runtime
    /// error that terminates the task.
    Div = 0x12,
    /// Pop two values, push the remainder. Modulo by zero is a runtime error.
    Mod = 0x13,
    /// Pop two integers, push their bitwise/logical conjunction.
    And = 0x14,
    /// Pop two integers, push their bitwise/logical disjunction.
    Or = 0x15,
    /// Pop one value, push its logical negation (0 or 1).
    Not = 0x16,
    /// Pop two integers, push their exclusive or.
    Xor = 0x17,

    /// Pop two values, push 1 if equal else 0.
    Eq = 0x18,
    /// Pop two values, push 1 if not equal else 0.
    Neq = 0x19,
    /// Pop two values, push 1 if `a < b` else 0.
    Lt = 0x1a,
    /// Pop two values, push 1 if `a <= b` else 0.
    Lte = 0x1b,
    /// Pop two values, push 1 if `a > b` else 0.
    Gt = 0x1c,
    /// Pop two values, push 1 if `a >= b` else 0.
    Gte = 0x1d,

    /// Reserve a scalar cell. Operand: size in bytes.
    AllocVar = 0x1e,
    /// Release a scalar cell. Operand: address.
    FreeVar = 0x1f,
    /// Reserve a struct region. Operand: size in bytes.
    AllocStruct = 0x20,
    /// Frame bookkeeping marker at function entry. Operand: frame size.
    AllocFrame = 0x21,
    /// Delete every local cell of the executing frame. Operand: frame size.
    /// This is the only mechanism that ends local lifetimes.
    FreeFrame = 0x22,
    /// Allocate array storage from the runtime heap and push the base
    /// address. Operands: element size, element count.
    AllocArray = 0x23,
    /// Pop index and base, push the element. Operand: element size.
    LoadArrayElem = 0x24,
    /// Pop value, index and base, store the element. Operand: element size.
    StoreArrayElem = 0x25,
    /// Initialize a global cell at load time. Operands: address,
    /// constant-pool index of the initial value, const flag.
    GlobalVarDeclare = 0x26,

    /// Pop function address, task id, priority, core and stack size; create
    /// and start a task.
    RtosCreateTask = 0x27,
    /// Pop a task id and mark the task deleted.
    RtosDeleteTask = 0x28,
    /// Pop a millisecond count and block the task for that long.
    RtosDelayMs = 0x29,
    /// Create a counting semaphore (1/1) and push its handle.
    RtosSemaphoreCreate = 0x2a,
    /// Pop timeout and handle; push 1 if the semaphore was taken within the
    /// timeout, else 0.
    RtosSemaphoreTake = 0x2b,
    /// Pop a handle and release the semaphore.
    RtosSemaphoreGive = 0x2c,
    /// Cooperative scheduling point.
    RtosYield = 0x2d,
    /// Pop a task id and suspend the task.
    RtosSuspendTask = 0x2e,
    /// Pop a task id and resume a suspended task.
    RtosResumeTask = 0x2f,

    /// Construct a message queue at load time. Operands: queue id,
    /// string-pool index of the element type name.
    MsgDeclare = 0x30,
    /// Pop a payload and append it to the queue. Operand: queue id.
    MsgSend = 0x31,
    /// Pop a timeout in milliseconds and receive from the queue; pushes the
    /// message, or -1 on expiry. Operand: queue id.
    MsgRecv = 0x32,

    /// Pop mode and pin; configure a GPIO pin.
    HwGpioInit = 0x33,
    /// Pop value and pin; drive an output pin.
    HwGpioSet = 0x34,
    /// Pop a pin and push its level.
    HwGpioGet = 0x35,
    /// Pop frequency, mode and timer id; configure a timer.
    HwTimerInit = 0x36,
    /// Pop a timer id and start it.
    HwTimerStart = 0x37,
    /// Pop a timer id and stop it.
    HwTimerStop = 0x38,
    /// Pop duty and timer id; set the PWM duty cycle.
    HwTimerSetPwmDuty = 0x39,
    /// Pop a channel and configure it for conversion.
    HwAdcInit = 0x3a,
    /// Pop a channel and push a 12-bit sample.
    HwAdcRead = 0x3b,
    /// Pop length and buffer address; transmit bytes over UART.
    HwUartWrite = 0x3c,
    /// Pop length, receive address and transmit address; run an SPI
    /// full-duplex transfer.
    HwSpiTransfer = 0x3d,
    /// Pop data and device address; write one I2C byte.
    HwI2cWrite = 0x3e,
    /// Pop register and device address; push one I2C byte.
    HwI2cRead = 0x3f,

    /// Pop a string-pool index and print the string.
    DbgPrint = 0x40,
    /// Formatted print. Operands: format sentinel (always 0), argument
    /// count. Pops the arguments, then the format-string pool index.
    DbgPrintf = 0x41,
    /// Debugger breakpoint marker.
    DbgBreakpoint = 0x42,
    /// Reserved system-call escape. Variable operands.
    Syscall = 0x43,
    /// Stop the executing task.
    Halt = 0x44,
    /// No operation.
    Nop = 0x45,
    /// Debug-mode annotation. Operand: string-pool index of the text.
    /// Ignored at runtime.
    Comment = 0x46,
}

impl Opcode {
    /// Number of instruction operands the opcode expects, or `None` for the
    /// variable-operand [`Opcode::Syscall`].
    pub const fn operand_count(&self) -> Option<usize> {
        let count = match self {
            Self::Jump
            | Self::JumpifTrue
            | Self::JumpifFalse
            | Self::LoadConst
            | Self::LoadVar
            | Self::StoreVar
            | Self::LoadAddr
            | Self::AllocVar
            | Self::FreeVar
            | Self::AllocStruct
            | Self::AllocFrame
            | Self::FreeFrame
            | Self::LoadArrayElem
            | Self::StoreArrayElem
            | Self::MsgSend
            | Self::MsgRecv
            | Self::Comment => 1,

            Self::Call
            | Self::LoadStructMember
            | Self::StoreStructMember
            | Self::AllocArray
            | Self::MsgDeclare
            | Self::DbgPrintf => 2,

            Self::GlobalVarDeclare => 3,

            Self::LoadStructMemberBit | Self::StoreStructMemberBit => 4,

            Self::Syscall => return None,

            _ => 0,
        };
        Some(count)
    }

    /// Whether the opcode rewrites the program counter itself. Every other
    /// opcode advances the counter by one after executing.
    pub const fn transfers_control(&self) -> bool {
        matches!(
            self,
            Self::Jump | Self::JumpifTrue | Self::JumpifFalse | Self::Call | Self::Ret
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcode(byte))
    }
}

/// The byte does not map to any known opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid opcode byte 0x{0:02x}")]
pub struct InvalidOpcode(pub u8);

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl fmt::LowerHex for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&(*self as u8), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_byte_round_trip() {
        for op in Opcode::iter() {
            let byte = op as u8;
            assert_eq!(Opcode::try_from(byte).unwrap(), op);
        }

        let last = Opcode::iter().last().unwrap() as u8;
        for byte in (last + 1)..=255 {
            assert!(Opcode::try_from(byte).is_err());
        }
    }

    #[test]
    fn opcode_names_match_wire_spelling() {
        assert_eq!(Opcode::JumpifFalse.to_string(), "JUMPIF_FALSE");
        assert_eq!(Opcode::RtosSemaphoreTake.to_string(), "RTOS_SEMAPHORE_TAKE");
        assert_eq!(Opcode::HwTimerSetPwmDuty.to_string(), "HW_TIMER_SET_PWM_DUTY");
        assert_eq!(Opcode::DbgPrintf.to_string(), "DBG_PRINTF");
    }

    #[test]
    fn control_transfer_set_is_exact() {
        let transfers: Vec<Opcode> =
            Opcode::iter().filter(Opcode::transfers_control).collect();
        assert_eq!(
            transfers,
            vec![
                Opcode::Jump,
                Opcode::JumpifTrue,
                Opcode::JumpifFalse,
                Opcode::Call,
                Opcode::Ret,
            ]
        );
    }
}
