//! Program loading, the shared material and the worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rtmc_asm::{BytecodeProgram, Opcode, HEAP_BASE};

use crate::{
    executor::TaskContext,
    output::{OutputSink, StdoutSink},
    HardwareSimulator, Memory, MessageQueue, Semaphore, Task, Value, VmError,
};

/// Everything a task can observe or mutate besides its own execution
/// context. One lock, taken once per executed opcode.
pub(crate) struct SharedState {
    pub memory: Memory,
    pub tasks: HashMap<u32, Task>,
    pub semaphores: HashMap<u32, Semaphore>,
    pub queues: HashMap<u32, MessageQueue>,
    pub hardware: HardwareSimulator,
    pub next_semaphore: u32,
    pub heap_next: u32,
}

pub(crate) struct Shared {
    pub program: BytecodeProgram,
    pub state: Mutex<SharedState>,
    pub workers: Mutex<Vec<JoinHandle<()>>>,
    pub output: Arc<dyn OutputSink>,
    pub trace: bool,
}

/// The virtual machine: a loaded program plus its runtime state.
pub struct Machine {
    shared: Arc<Shared>,
}

const MAIN_TASK_ID: u32 = 0;
const MAIN_PRIORITY: u32 = 5;
const MAIN_STACK: u32 = 1024;

impl Machine {
    /// Load a program with the default stdout sink.
    pub fn new(program: BytecodeProgram) -> Result<Self, VmError> {
        Self::with_output(program, Arc::new(StdoutSink))
    }

    /// Load a program, routing debug prints into `output`.
    pub fn with_output(
        program: BytecodeProgram,
        output: Arc<dyn OutputSink>,
    ) -> Result<Self, VmError> {
        let main_entry = program
            .functions
            .get("main")
            .copied()
            .ok_or(VmError::NoMain)?;

        let mut state = SharedState {
            memory: Memory::new(),
            tasks: HashMap::new(),
            semaphores: HashMap::new(),
            queues: HashMap::new(),
            hardware: HardwareSimulator::new(),
            next_semaphore: 0,
            heap_next: HEAP_BASE,
        };

        // Load-time walk: globals get their initial values, queues are
        // constructed. The init stream sits ahead of any function and is
        // never executed as code.
        for instruction in &program.instructions {
            match instruction.opcode {
                Opcode::GlobalVarDeclare => {
                    if let [address, const_index, _is_const] = instruction.operands[..] {
                        let value = constant_value(&program, const_index);
                        state.memory.write(address, value);
                    }
                }
                Opcode::MsgDeclare => {
                    if let [id, type_index] = instruction.operands[..] {
                        let element_type = program
                            .strings
                            .get(type_index as usize)
                            .map(String::as_str)
                            .unwrap_or("int");
                        state.queues.insert(id, MessageQueue::new(id, element_type));
                    }
                }
                _ => {}
            }
        }

        state.tasks.insert(
            MAIN_TASK_ID,
            Task::new(MAIN_TASK_ID, "main", main_entry, MAIN_STACK, MAIN_PRIORITY, 0),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                program,
                state: Mutex::new(state),
                workers: Mutex::new(Vec::new()),
                output,
                trace: false,
            }),
        })
    }

    /// Enable per-instruction tracing at `trace!` level.
    pub fn with_trace(mut self, trace: bool) -> Self {
        // The machine owns the only Arc until `run` spawns workers.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.trace = trace;
        }
        self
    }

    /// Run until every task worker has finished.
    pub fn run(&self) {
        let entry = {
            let state = self.shared.state.lock().expect("vm state lock");
            state.tasks[&MAIN_TASK_ID].entry
        };
        spawn_worker(Arc::clone(&self.shared), MAIN_TASK_ID, "main".into(), entry);

        tracing::info!("VM running, waiting for tasks to complete");
        loop {
            let handle = {
                let mut workers = self.shared.workers.lock().expect("worker lock");
                workers.pop()
            };
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
        tracing::info!("VM execution finished");
    }

    /// Number of live memory cells in `[start, end)`; test observability.
    pub fn cells_in_range(&self, start: u32, end: u32) -> usize {
        self.shared
            .state
            .lock()
            .expect("vm state lock")
            .memory
            .cells_in_range(start, end)
    }

    /// Read a memory cell; test observability.
    pub fn read_memory(&self, address: u32) -> Value {
        self.shared
            .state
            .lock()
            .expect("vm state lock")
            .memory
            .read(address)
    }

    /// Observed level of a GPIO pin.
    pub fn gpio_level(&self, pin: i64) -> Option<i64> {
        self.shared
            .state
            .lock()
            .expect("vm state lock")
            .hardware
            .gpio_level(pin)
    }

    /// Snapshot of the task table.
    pub fn tasks(&self) -> Vec<Task> {
        self.shared
            .state
            .lock()
            .expect("vm state lock")
            .tasks
            .values()
            .cloned()
            .collect()
    }
}

pub(crate) fn constant_value(program: &BytecodeProgram, index: u32) -> Value {
    match program.constants.get(index as usize) {
        Some(rtmc_asm::ConstValue::Int(v)) => Value::Int(*v),
        Some(rtmc_asm::ConstValue::Float(v)) => Value::Float(*v),
        _ => Value::Int(0),
    }
}

/// Start a worker thread executing from `entry` in its own context, and
/// register the handle so [`Machine::run`] can join it.
pub(crate) fn spawn_worker(shared: Arc<Shared>, task_id: u32, name: String, entry: u32) {
    let context = TaskContext::new(Arc::clone(&shared), task_id, name.clone(), entry);
    let handle = std::thread::Builder::new()
        .name(format!("rtmc-task-{name}"))
        .spawn(move || context.run())
        .expect("spawn task worker");
    shared.workers.lock().expect("worker lock").push(handle);
    tracing::info!(task = %name, task_id, entry, "started task worker");
}
