//! Address-space layout shared by the bytecode generator and the VM.

/// First address of the global variable segment.
pub const GLOBAL_BASE: u32 = 0;

/// First address of the parameter segment of the executing frame.
///
/// Compile-time addresses in `[PARAM_BASE, LOCAL_BASE)` are parameter slots;
/// `CALL`/`RET` save and restore the cells so nested calls cannot clobber a
/// caller's own parameters.
pub const PARAM_BASE: u32 = 10_000;

/// First address of the local variable segment at call depth zero.
pub const LOCAL_BASE: u32 = 20_000;

/// Address distance between the local segments of adjacent call depths.
pub const FRAME_STRIDE: u32 = 1_000;

/// First address handed out by the runtime array allocator. Above every
/// static segment any program can address.
pub const HEAP_BASE: u32 = 1_000_000;

/// Base-address operand meaning "the base address is on the operand stack"
/// for the bit-field load/store instructions. Address 0 is a valid global,
/// so the sentinel sits at the top of the address range instead.
pub const STACK_BASE_SENTINEL: u32 = u32::MAX;

/// Timeout value emitted for an argument-less `recv()`; close enough to
/// seventeen minutes to behave as a blocking receive.
pub const RECV_BLOCKING_SENTINEL: i64 = 999_999;
