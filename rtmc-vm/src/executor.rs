//! Per-task execution.
//!
//! Every task worker owns a `TaskContext`: program counter, operand stack,
//! call stack and call depth. The shared material is touched under the
//! machine's single lock, once per opcode; blocking operations (delays,
//! empty-queue receives, semaphore waits) sleep with the lock released and
//! poll at millisecond granularity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rtmc_asm::{
    Instruction, Opcode, FRAME_STRIDE, HEAP_BASE, LOCAL_BASE, PARAM_BASE,
    STACK_BASE_SENTINEL,
};

use crate::{
    machine::{constant_value, spawn_worker, Shared},
    Task, TaskState, Value, VmError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

struct CallFrame {
    return_pc: u32,
    /// Parameter cells as they were before the call: address and previous
    /// content (`None` when the cell did not exist).
    saved_params: Vec<(u32, Option<Value>)>,
}

pub(crate) struct TaskContext {
    shared: Arc<Shared>,
    task_id: u32,
    name: String,
    pc: u32,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    call_depth: u32,
    running: bool,
}

impl TaskContext {
    pub fn new(shared: Arc<Shared>, task_id: u32, name: String, entry: u32) -> Self {
        Self {
            shared,
            task_id,
            name,
            pc: entry,
            stack: Vec::new(),
            frames: Vec::new(),
            call_depth: 0,
            running: true,
        }
    }

    /// The worker body: fetch, dispatch, advance, until the task ends.
    pub fn run(mut self) {
        tracing::info!(task = %self.name, "task running");

        loop {
            if !self.running {
                break;
            }

            match self.observed_state() {
                None | Some(TaskState::Deleted) => break,
                Some(TaskState::Suspended) => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
                _ => {}
            }

            let Some(instruction) =
                self.shared.program.instructions.get(self.pc as usize).cloned()
            else {
                break;
            };

            if self.shared.trace {
                tracing::trace!(
                    task = %self.name,
                    pc = self.pc,
                    instruction = %instruction,
                    depth = self.stack.len(),
                    "exec"
                );
            }

            match self.step(&instruction) {
                Ok(()) => {
                    if !instruction.opcode.transfers_control() {
                        self.pc += 1;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        task = %self.name,
                        pc = self.pc,
                        error = %err,
                        "task terminated by runtime error"
                    );
                    break;
                }
            }
        }

        let mut state = self.shared.state.lock().expect("vm state lock");
        if let Some(task) = state.tasks.get_mut(&self.task_id) {
            task.state = TaskState::Deleted;
        }
        tracing::info!(task = %self.name, "task finished");
    }

    fn observed_state(&self) -> Option<TaskState> {
        let state = self.shared.state.lock().expect("vm state lock");
        state.tasks.get(&self.task_id).map(|t| t.state)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or(VmError::StackUnderflow { pc: self.pc })
    }

    /// Remap a compile-time address by the live call depth. Globals and
    /// parameter slots are used as-is; each call depth gets its own band of
    /// local addresses. Heap addresses are absolute.
    fn map_addr(&self, address: u32) -> u32 {
        if address < LOCAL_BASE || address >= HEAP_BASE {
            address
        } else {
            LOCAL_BASE + self.call_depth * FRAME_STRIDE + (address - LOCAL_BASE)
        }
    }

    fn operand(&self, instruction: &Instruction, index: usize) -> Result<u32, VmError> {
        instruction
            .operands
            .get(index)
            .copied()
            .ok_or(VmError::MalformedInstruction { pc: self.pc })
    }

    fn string_at(&self, index: i64) -> Result<String, VmError> {
        self.shared
            .program
            .strings
            .get(index as usize)
            .cloned()
            .ok_or(VmError::InvalidString(index as u32))
    }

    fn step(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        use Opcode::*;

        match instruction.opcode {
            Jump => {
                self.pc = self.operand(instruction, 0)?;
            }
            JumpifTrue => {
                let target = self.operand(instruction, 0)?;
                let condition = self.pop()?;
                self.pc = if condition.truthy() { target } else { self.pc + 1 };
            }
            JumpifFalse => {
                let target = self.operand(instruction, 0)?;
                let condition = self.pop()?;
                self.pc = if condition.truthy() { self.pc + 1 } else { target };
            }
            Call => self.call(instruction)?,
            Ret => self.ret()?,

            LoadConst => {
                let index = self.operand(instruction, 0)?;
                if index as usize >= self.shared.program.constants.len() {
                    return Err(VmError::InvalidConstant(index));
                }
                let value = constant_value(&self.shared.program, index);
                self.push(value);
            }
            LoadVar => {
                let address = self.map_addr(self.operand(instruction, 0)?);
                let value = self.with_state(|state| state.memory.read(address));
                self.push(value);
            }
            StoreVar => {
                let address = self.map_addr(self.operand(instruction, 0)?);
                let value = self.pop()?;
                self.with_state(|state| state.memory.write(address, value));
            }
            LoadStructMember => {
                let base = self.map_addr(self.operand(instruction, 0)?);
                let offset = self.operand(instruction, 1)?;
                let value = self.with_state(|state| state.memory.read(base + offset));
                self.push(value);
            }
            StoreStructMember => {
                let base = self.map_addr(self.operand(instruction, 0)?);
                let offset = self.operand(instruction, 1)?;
                let value = self.pop()?;
                self.with_state(|state| state.memory.write(base + offset, value));
            }
            LoadStructMemberBit => {
                let address = self.bit_field_address(instruction)?;
                let bit_offset = self.operand(instruction, 2)?;
                let width = self.operand(instruction, 3)?;
                let word = self
                    .with_state(|state| state.memory.read(address))
                    .as_int()?;
                let mask = (1i64 << width) - 1;
                self.push(Value::Int((word >> bit_offset) & mask));
            }
            StoreStructMemberBit => {
                let value = self.pop()?.as_int()?;
                let address = self.bit_field_address(instruction)?;
                let bit_offset = self.operand(instruction, 2)?;
                let width = self.operand(instruction, 3)?;
                let mask = (1i64 << width) - 1;
                self.with_state(|state| {
                    let word = match state.memory.read(address) {
                        Value::Int(w) => w,
                        Value::Float(f) => i64::from(f.to_bits()),
                    };
                    let cleared = word & !(mask << bit_offset);
                    let updated = cleared | ((value & mask) << bit_offset);
                    state.memory.write(address, Value::Int(updated));
                });
            }
            LoadAddr => {
                let address = self.map_addr(self.operand(instruction, 0)?);
                self.push(Value::Int(i64::from(address)));
            }
            LoadDeref => {
                let address = self.pop()?.as_int()?;
                if address == 0 {
                    return Err(VmError::NullPointer);
                }
                let address = address as u32;
                let value = self.with_state(|state| {
                    state
                        .memory
                        .contains(address)
                        .then(|| state.memory.read(address))
                });
                self.push(value.ok_or(VmError::InvalidPointer(address))?);
            }
            StoreDeref => {
                let value = self.pop()?;
                let address = self.pop()?.as_int()?;
                if address == 0 {
                    return Err(VmError::NullPointer);
                }
                self.with_state(|state| state.memory.write(address as u32, value));
            }

            Add => self.binary(Value::add)?,
            Sub => self.binary(Value::sub)?,
            Mul => self.binary(Value::mul)?,
            Div => self.binary(Value::div)?,
            Mod => self.binary(Value::rem)?,
            And => self.bitwise(|a, b| a & b)?,
            Or => self.bitwise(|a, b| a | b)?,
            Xor => self.bitwise(|a, b| a ^ b)?,
            Not => {
                let value = self.pop()?;
                self.push(Value::Int(i64::from(!value.truthy())));
            }
            Eq => self.comparison(|o| o == core::cmp::Ordering::Equal)?,
            Neq => self.comparison(|o| o != core::cmp::Ordering::Equal)?,
            Lt => self.comparison(|o| o == core::cmp::Ordering::Less)?,
            Lte => self.comparison(|o| o != core::cmp::Ordering::Greater)?,
            Gt => self.comparison(|o| o == core::cmp::Ordering::Greater)?,
            Gte => self.comparison(|o| o != core::cmp::Ordering::Less)?,

            AllocVar | AllocStruct => {
                let size = self.operand(instruction, 0)?;
                let base = self.heap_alloc(size.max(1), 1);
                self.push(Value::Int(i64::from(base)));
            }
            FreeVar => {
                let address = self.operand(instruction, 0)?;
                self.with_state(|state| state.memory.remove(address));
            }
            AllocFrame => {}
            FreeFrame => {
                let size = self.operand(instruction, 0)?;
                let base = LOCAL_BASE + self.call_depth * FRAME_STRIDE;
                self.with_state(|state| state.memory.remove_range(base, base + size));
            }
            AllocArray => {
                let element_size = self.operand(instruction, 0)?.max(1);
                let count = self.operand(instruction, 1)?;
                let base = self.heap_alloc(element_size, count);
                self.push(Value::Int(i64::from(base)));
            }
            LoadArrayElem => {
                let element_size = self.operand(instruction, 0)?.max(1);
                let index = self.pop()?.as_int()?;
                let base = self.pop()?.as_int()?;
                let address = (base + index * i64::from(element_size)) as u32;
                let value = self.with_state(|state| {
                    if element_size == 1 {
                        Value::Int(i64::from(state.memory.read_byte(address)))
                    } else {
                        state.memory.read(address)
                    }
                });
                self.push(value);
            }
            StoreArrayElem => {
                let element_size = self.operand(instruction, 0)?.max(1);
                let value = self.pop()?;
                let index = self.pop()?.as_int()?;
                let base = self.pop()?.as_int()?;
                let address = (base + index * i64::from(element_size)) as u32;
                self.with_state(|state| {
                    if element_size == 1 {
                        match value.as_int() {
                            Ok(v) => state.memory.write_byte(address, v as u8),
                            Err(_) => state.memory.write(address, value),
                        }
                    } else {
                        state.memory.write(address, value);
                    }
                });
            }
            GlobalVarDeclare => {
                let address = self.operand(instruction, 0)?;
                let index = self.operand(instruction, 1)?;
                let value = constant_value(&self.shared.program, index);
                self.with_state(|state| state.memory.write(address, value));
            }

            RtosCreateTask => self.create_task()?,
            RtosDeleteTask => {
                let id = self.pop()?.as_int()? as u32;
                self.with_state(|state| {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.state = TaskState::Deleted;
                        tracing::info!(task = %task.name, id, "task deleted");
                    } else {
                        tracing::warn!(id, "delete of unknown task");
                    }
                });
            }
            RtosDelayMs => {
                let ms = self.pop()?.as_int()?.max(0) as u64;
                std::thread::sleep(Duration::from_millis(ms));
            }
            RtosSemaphoreCreate => {
                let id = self.with_state(|state| {
                    let id = state.next_semaphore;
                    state.next_semaphore += 1;
                    state.semaphores.insert(id, crate::Semaphore::new(id));
                    tracing::info!(id, "semaphore created");
                    id
                });
                self.push(Value::Int(i64::from(id)));
            }
            RtosSemaphoreTake => self.semaphore_take()?,
            RtosSemaphoreGive => {
                let handle = self.pop()?.as_int()? as u32;
                let known = self.with_state(|state| {
                    state.semaphores.get_mut(&handle).map(|s| s.give())
                });
                match known {
                    Some(true) => {}
                    Some(false) => tracing::warn!(handle, "semaphore already at max count"),
                    None => return Err(VmError::InvalidSemaphore(handle)),
                }
            }
            RtosYield => {
                std::thread::sleep(POLL_INTERVAL);
            }
            RtosSuspendTask => {
                let id = self.pop()?.as_int()? as u32;
                self.with_state(|state| {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.state = TaskState::Suspended;
                        tracing::info!(id, "task suspended");
                    }
                });
            }
            RtosResumeTask => {
                let id = self.pop()?.as_int()? as u32;
                self.with_state(|state| {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        if task.state == TaskState::Suspended {
                            task.state = TaskState::Ready;
                            tracing::info!(id, "task resumed");
                        }
                    }
                });
            }

            MsgDeclare => {
                let id = self.operand(instruction, 0)?;
                let type_index = self.operand(instruction, 1)?;
                let element_type = self
                    .shared
                    .program
                    .strings
                    .get(type_index as usize)
                    .cloned()
                    .unwrap_or_else(|| "int".to_owned());
                self.with_state(|state| {
                    state
                        .queues
                        .entry(id)
                        .or_insert_with(|| crate::MessageQueue::new(id, &element_type));
                });
            }
            MsgSend => {
                let id = self.operand(instruction, 0)?;
                let payload = self.pop()?;
                let sent = self.with_state(|state| {
                    state.queues.get_mut(&id).map(|queue| queue.send(payload))
                });
                match sent {
                    Some(true) => {}
                    Some(false) => {
                        tracing::warn!(queue = id, "message queue full, dropping message")
                    }
                    None => return Err(VmError::InvalidQueue(id)),
                }
            }
            MsgRecv => self.msg_recv(instruction)?,

            HwGpioInit => {
                let mode = self.pop()?.as_int()?;
                let pin = self.pop()?.as_int()?;
                self.with_state(|state| state.hardware.gpio_init(pin, mode));
            }
            HwGpioSet => {
                let value = self.pop()?.as_int()?;
                let pin = self.pop()?.as_int()?;
                self.try_state(|state| state.hardware.gpio_set(pin, value))?;
            }
            HwGpioGet => {
                let pin = self.pop()?.as_int()?;
                let level = self.try_state(|state| state.hardware.gpio_get(pin))?;
                self.push(Value::Int(level));
            }
            HwTimerInit => {
                let frequency = self.pop()?.as_int()?;
                let mode = self.pop()?.as_int()?;
                let id = self.pop()?.as_int()?;
                self.with_state(|state| state.hardware.timer_init(id, mode, frequency));
            }
            HwTimerStart => {
                let id = self.pop()?.as_int()?;
                self.try_state(|state| state.hardware.timer_start(id))?;
            }
            HwTimerStop => {
                let id = self.pop()?.as_int()?;
                self.try_state(|state| state.hardware.timer_stop(id))?;
            }
            HwTimerSetPwmDuty => {
                let duty = self.pop()?.as_int()?;
                let id = self.pop()?.as_int()?;
                self.try_state(|state| state.hardware.timer_set_pwm_duty(id, duty))?;
            }
            HwAdcInit => {
                let channel = self.pop()?.as_int()?;
                self.with_state(|state| state.hardware.adc_init(channel));
            }
            HwAdcRead => {
                let channel = self.pop()?.as_int()?;
                let sample = self.try_state(|state| state.hardware.adc_read(channel))?;
                self.push(Value::Int(sample));
            }
            HwUartWrite => {
                let length = self.pop()?.as_int()?.max(0) as u32;
                let base = self.pop()?.as_int()? as u32;
                self.with_state(|state| {
                    let data: Vec<u8> =
                        (0..length).map(|i| state.memory.read_byte(base + i)).collect();
                    state.hardware.uart_write(data);
                });
            }
            HwSpiTransfer => {
                let length = self.pop()?.as_int()?.max(0) as u32;
                let rx_base = self.pop()?.as_int()? as u32;
                let tx_base = self.pop()?.as_int()? as u32;
                self.with_state(|state| {
                    let tx: Vec<u8> =
                        (0..length).map(|i| state.memory.read_byte(tx_base + i)).collect();
                    let rx = state.hardware.spi_transfer(tx);
                    for (i, byte) in rx.into_iter().enumerate() {
                        state.memory.write_byte(rx_base + i as u32, byte);
                    }
                });
            }
            HwI2cWrite => {
                let data = self.pop()?.as_int()?;
                let address = self.pop()?.as_int()?;
                self.with_state(|state| state.hardware.i2c_write(address, data));
            }
            HwI2cRead => {
                let register = self.pop()?.as_int()?;
                let address = self.pop()?.as_int()?;
                let value =
                    self.with_state(|state| state.hardware.i2c_read(address, register));
                self.push(Value::Int(value));
            }

            DbgPrint => {
                let index = self.pop()?.as_int()?;
                let text = self.string_at(index)?;
                self.shared.output.print(&text);
            }
            DbgPrintf => self.printf(instruction)?,
            DbgBreakpoint => {
                tracing::info!(task = %self.name, pc = self.pc, "breakpoint");
            }
            Syscall => {
                tracing::debug!(task = %self.name, pc = self.pc, "SYSCALL is reserved");
            }
            Halt => {
                self.running = false;
            }
            Nop | Comment => {}
        }

        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut crate::machine::SharedState) -> R) -> R {
        let mut state = self.shared.state.lock().expect("vm state lock");
        f(&mut state)
    }

    fn try_state<R>(
        &self,
        f: impl FnOnce(&mut crate::machine::SharedState) -> Result<R, VmError>,
    ) -> Result<R, VmError> {
        let mut state = self.shared.state.lock().expect("vm state lock");
        f(&mut state)
    }

    fn binary(
        &mut self,
        op: fn(Value, Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = op(a, b)?;
        self.push(result);
        Ok(())
    }

    fn bitwise(&mut self, op: fn(i64, i64) -> i64) -> Result<(), VmError> {
        let b = self.pop()?.as_int()?;
        let a = self.pop()?.as_int()?;
        self.push(Value::Int(op(a, b)));
        Ok(())
    }

    fn comparison(
        &mut self,
        accept: fn(core::cmp::Ordering) -> bool,
    ) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(Value::Int(i64::from(accept(a.compare(b)))));
        Ok(())
    }

    fn bit_field_address(&mut self, instruction: &Instruction) -> Result<u32, VmError> {
        let base = self.operand(instruction, 0)?;
        let byte_offset = self.operand(instruction, 1)?;
        if base == STACK_BASE_SENTINEL {
            // The address was computed onto the stack and is absolute.
            Ok(self.pop()?.as_int()? as u32 + byte_offset)
        } else {
            Ok(self.map_addr(base) + byte_offset)
        }
    }

    fn heap_alloc(&self, element_size: u32, count: u32) -> u32 {
        self.with_state(|state| {
            let base = state.heap_next;
            state.heap_next += (element_size * count).max(1);
            for i in 0..count {
                state.memory.write(base + i * element_size, Value::Int(0));
            }
            base
        })
    }

    fn call(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let target = self.operand(instruction, 0)?;
        let count = self.operand(instruction, 1)? as usize;

        // Arguments were pushed left to right; popping reverses them.
        let mut arguments = Vec::with_capacity(count);
        for _ in 0..count {
            arguments.push(self.pop()?);
        }
        arguments.reverse();

        let mut saved_params = Vec::with_capacity(count);
        self.with_state(|state| {
            for (i, argument) in arguments.iter().enumerate() {
                let address = PARAM_BASE + i as u32;
                let previous = state
                    .memory
                    .contains(address)
                    .then(|| state.memory.read(address));
                saved_params.push((address, previous));
                state.memory.write(address, *argument);
            }
        });

        self.frames.push(CallFrame {
            return_pc: self.pc + 1,
            saved_params,
        });
        self.call_depth += 1;
        self.pc = target;
        Ok(())
    }

    fn ret(&mut self) -> Result<(), VmError> {
        match self.frames.pop() {
            Some(frame) => {
                self.with_state(|state| {
                    for (address, previous) in frame.saved_params {
                        match previous {
                            Some(value) => state.memory.write(address, value),
                            None => state.memory.remove(address),
                        }
                    }
                });
                self.call_depth -= 1;
                self.pc = frame.return_pc;
            }
            None => self.running = false,
        }
        Ok(())
    }

    fn create_task(&mut self) -> Result<(), VmError> {
        let entry = self.pop()?.as_int()? as u32;
        let identity = self.pop()?.as_int()?;
        let priority = self.pop()?.as_int()? as u32;
        let core = self.pop()?.as_int()? as u32;
        let stack_size = self.pop()?.as_int()? as u32;

        // The identity slot carries the task id from `StartTask` or a task
        // name string index from `RTOS_CREATE_TASK`.
        let (id, name) = match self.shared.program.strings.get(identity as usize) {
            Some(name) => (identity as u32, name.clone()),
            None => (identity as u32, format!("Task-{identity}")),
        };

        self.with_state(|state| {
            state
                .tasks
                .insert(id, Task::new(id, &name, entry, stack_size, priority, core));
        });
        tracing::info!(task = %name, id, entry, priority, core, "task created");

        spawn_worker(Arc::clone(&self.shared), id, name, entry);
        Ok(())
    }

    fn semaphore_take(&mut self) -> Result<(), VmError> {
        let timeout = self.pop()?.as_int()?;
        let handle = self.pop()?.as_int()? as u32;

        let deadline = Instant::now() + Duration::from_millis(timeout.max(0) as u64);
        loop {
            let taken = self.with_state(|state| {
                state.semaphores.get_mut(&handle).map(|s| s.take())
            });
            match taken {
                None => return Err(VmError::InvalidSemaphore(handle)),
                Some(true) => {
                    self.push(Value::Int(1));
                    return Ok(());
                }
                Some(false) if Instant::now() >= deadline => {
                    self.push(Value::Int(0));
                    return Ok(());
                }
                Some(false) => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn msg_recv(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let id = self.operand(instruction, 0)?;
        let timeout_ms = self.pop()?.as_int()?.max(0) as u64;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let received = self.with_state(|state| {
                state.queues.get_mut(&id).map(|queue| queue.receive())
            });
            match received {
                None => return Err(VmError::InvalidQueue(id)),
                Some(Some(message)) => {
                    self.push(message);
                    return Ok(());
                }
                Some(None) if Instant::now() >= deadline => {
                    self.push(Value::Int(-1));
                    return Ok(());
                }
                Some(None) => {
                    // Receivers unblock if their task is deleted meanwhile.
                    if matches!(self.observed_state(), None | Some(TaskState::Deleted)) {
                        self.running = false;
                        self.push(Value::Int(-1));
                        return Ok(());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn printf(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let count = self.operand(instruction, 1)? as usize;

        let mut arguments = Vec::with_capacity(count);
        for _ in 0..count {
            arguments.push(self.pop()?);
        }
        arguments.reverse();

        let format_index = self.pop()?.as_int()?;
        let template = self.string_at(format_index)?;

        // Numbered placeholders first, then positional `{}` in order.
        let mut text = template;
        for (i, argument) in arguments.iter().enumerate() {
            let placeholder = format!("{{{i}}}");
            if text.contains(&placeholder) {
                text = text.replace(&placeholder, &argument.to_string());
            }
        }
        let mut next = 0;
        while let Some(at) = text.find("{}") {
            if next >= arguments.len() {
                break;
            }
            text.replace_range(at..at + 2, &arguments[next].to_string());
            next += 1;
        }

        self.shared.output.print(&text);
        Ok(())
    }
}
