//! A reference interpreter for LIR.
//!
//! It runs a module at any point of the pipeline, so the result of running
//! the freshly built IR can be compared against the result of running the
//! optimized IR. Machine state is modeled loosely: a physical register
//! file, a word-addressed memory holding the stack, the globals, the static
//! strings and a bump-allocated heap. Virtual registers are private to each
//! activation. Runtime library calls are recorded instead of performed.

use hashbrown::HashMap;
use thiserror::Error;
use tracing::trace;

use crate::{
    index::{Index, IndexVec},
    middle::lir::{
        BinaryOperator, BlockId, Callee, DataSymbol, FunctionId, GlobalId, Instruction, Memory,
        Module, Operand, PhysicalRegister, Register, RegisterId, RuntimeFunction, StaticStringId,
        Storage, UnaryOperator, operand::WORD_SIZE,
    },
};

const GLOBAL_BASE: i64 = 0x1000;
const STRING_BASE: i64 = 0x10_0000;
const HEAP_BASE: i64 = 0x1000_0000;
const STACK_TOP: i64 = 0x7fff_0000;

/// Activations deeper than this abort the run instead of overflowing the
/// host stack
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error("execution did not finish within the instruction budget")]
    OutOfFuel,

    #[error("call depth exceeded {MAX_CALL_DEPTH}")]
    CallDepthExceeded,

    #[error("division by zero in `{0}`")]
    DivisionByZero(String),

    #[error("register {register:?} of `{function}` was read before being written")]
    UndefinedRegister {
        function: String,
        register: RegisterId,
    },

    #[error("`{0}` writes to a read-only location")]
    ReadOnlyWrite(String),

    #[error("control reached the end of block {block:?} in `{function}`")]
    FellThrough { function: String, block: BlockId },

    #[error("the module has no entry function")]
    NoEntry,
}

/// A call into the runtime library, with the values of its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub function: RuntimeFunction,
    pub arguments: Vec<i64>,
}

/// Everything a run of the program makes observable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub return_value: i64,
    pub events: Vec<RuntimeEvent>,
    /// Final value of every global, in declaration order
    pub globals: Vec<i64>,
}

/// Runs the module's entry function (or `main` if there is none) with at
/// most `fuel` instructions
pub fn run_module(module: &Module, fuel: u64) -> Result<Execution, InterpretError> {
    let entry = module
        .entry
        .or_else(|| module.function_by_name("main"))
        .ok_or(InterpretError::NoEntry)?;

    let mut machine = Machine::new(module, fuel);
    machine.call(entry, 0)?;

    let globals = machine
        .global_addresses
        .iter()
        .map(|address| machine.read_word(*address))
        .collect();

    Ok(Execution {
        return_value: machine.register(PhysicalRegister::RETURN),
        events: machine.events,
        globals,
    })
}

struct Machine<'m> {
    module: &'m Module,
    fuel: u64,
    registers: HashMap<PhysicalRegister, i64>,
    memory: HashMap<i64, i64>,
    heap_top: i64,
    global_addresses: IndexVec<GlobalId, i64>,
    string_addresses: IndexVec<StaticStringId, i64>,
    events: Vec<RuntimeEvent>,
}

/// Virtual registers of one activation
struct Frame {
    function: FunctionId,
    values: HashMap<RegisterId, i64>,
}

impl<'m> Machine<'m> {
    fn new(module: &'m Module, fuel: u64) -> Self {
        let global_addresses = module
            .globals
            .indices()
            .map(|global| GLOBAL_BASE + global.index() as i64 * WORD_SIZE)
            .collect();

        let mut memory = HashMap::new();
        let mut string_addresses = IndexVec::new();
        let mut next = STRING_BASE;

        for string in module.static_strings.iter() {
            let bytes = string.value.as_bytes();
            string_addresses.push(next);
            memory.insert(next, bytes.len() as i64);

            // Length word, then the bytes and the terminating zero, padded
            // to whole words
            next += WORD_SIZE + (bytes.len() as i64 + 1 + WORD_SIZE - 1) / WORD_SIZE * WORD_SIZE;
        }

        let mut registers = HashMap::new();
        registers.insert(PhysicalRegister::Rsp, STACK_TOP);
        registers.insert(PhysicalRegister::Rbp, STACK_TOP);

        Self {
            module,
            fuel,
            registers,
            memory,
            heap_top: HEAP_BASE,
            global_addresses,
            string_addresses,
            events: Vec::new(),
        }
    }

    fn register(&self, register: PhysicalRegister) -> i64 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn read_word(&self, address: i64) -> i64 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    fn push_word(&mut self, value: i64) {
        let rsp = self.register(PhysicalRegister::Rsp) - WORD_SIZE;
        self.registers.insert(PhysicalRegister::Rsp, rsp);
        self.memory.insert(rsp, value);
    }

    fn pop_word(&mut self) -> i64 {
        let rsp = self.register(PhysicalRegister::Rsp);
        self.registers.insert(PhysicalRegister::Rsp, rsp + WORD_SIZE);
        self.read_word(rsp)
    }

    fn allocate(&mut self, size: i64) -> i64 {
        let address = self.heap_top;
        let words = size.max(WORD_SIZE).saturating_add(WORD_SIZE - 1) / WORD_SIZE;
        self.heap_top = self.heap_top.wrapping_add(words.wrapping_mul(WORD_SIZE));
        address
    }

    fn function_name(&self, frame: &Frame) -> String {
        self.module.functions[frame.function].name.value().to_owned()
    }

    fn symbol_address(&self, symbol: DataSymbol) -> i64 {
        match symbol {
            DataSymbol::Global(global) => self.global_addresses[global],
            DataSymbol::StaticString(string) => self.string_addresses[string],
        }
    }

    fn address(&self, frame: &Frame, memory: &Memory) -> Result<i64, InterpretError> {
        let register = |register: Register| match register {
            Register::Virtual(id) => self.virtual_value(frame, id),
            Register::Physical(physical) => Ok(self.register(physical)),
        };

        let mut address = memory.offset;

        if let Some(symbol) = memory.symbol {
            address = address.wrapping_add(self.symbol_address(symbol));
        }

        if let Some(base) = memory.base {
            address = address.wrapping_add(register(base)?);
        }

        if let Some(index) = memory.index {
            address = address.wrapping_add(register(index)?.wrapping_mul(memory.scale as i64));
        }

        Ok(address)
    }

    fn virtual_value(&self, frame: &Frame, register: RegisterId) -> Result<i64, InterpretError> {
        frame
            .values
            .get(&register)
            .copied()
            .ok_or_else(|| InterpretError::UndefinedRegister {
                function: self.function_name(frame),
                register,
            })
    }

    fn read(&self, frame: &Frame, storage: &Storage) -> Result<i64, InterpretError> {
        match storage {
            Storage::Virtual(register) => self.virtual_value(frame, *register),
            Storage::Physical(register) => Ok(self.register(*register)),
            Storage::Memory(memory) => Ok(self.read_word(self.address(frame, memory)?)),
            Storage::Global(global) => Ok(self.read_word(self.global_addresses[*global])),
            Storage::StaticString(string) => Ok(self.string_addresses[*string]),
        }
    }

    fn value(&self, frame: &Frame, operand: &Operand) -> Result<i64, InterpretError> {
        match operand {
            Operand::Immediate(value) => Ok(*value),
            Operand::Storage(storage) => self.read(frame, storage),
        }
    }

    fn write(&mut self, frame: &mut Frame, storage: &Storage, value: i64) -> Result<(), InterpretError> {
        match storage {
            Storage::Virtual(register) => {
                frame.values.insert(*register, value);
            }
            Storage::Physical(register) => {
                self.registers.insert(*register, value);
            }
            Storage::Memory(memory) => {
                let address = self.address(frame, memory)?;
                self.memory.insert(address, value);
            }
            Storage::Global(global) => {
                self.memory.insert(self.global_addresses[*global], value);
            }
            Storage::StaticString(_) => {
                return Err(InterpretError::ReadOnlyWrite(self.function_name(frame)));
            }
        }

        Ok(())
    }

    fn call(&mut self, function: FunctionId, depth: usize) -> Result<(), InterpretError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(InterpretError::CallDepthExceeded);
        }

        let module = self.module;
        let body = &module.functions[function];

        // Return address, then the caller's frame pointer
        self.push_word(0);
        self.push_word(self.register(PhysicalRegister::Rbp));
        self.registers
            .insert(PhysicalRegister::Rbp, self.register(PhysicalRegister::Rsp));

        let frame_words = body
            .argument_limit
            .saturating_sub(PhysicalRegister::ARGUMENTS.len())
            + body.temporary_count;
        let rsp = self.register(PhysicalRegister::Rsp) - frame_words as i64 * WORD_SIZE;
        self.registers.insert(PhysicalRegister::Rsp, rsp);

        let mut frame = Frame {
            function,
            values: HashMap::new(),
        };

        trace!(function = %body.name, depth, "enter");

        let mut previous: Option<BlockId> = None;
        let mut block = body.entry;

        'blocks: loop {
            self.enter_phis(&mut frame, block, previous)?;

            for (_, instruction) in body.instructions_in(block) {
                if self.fuel == 0 {
                    return Err(InterpretError::OutOfFuel);
                }
                self.fuel -= 1;

                match instruction {
                    Instruction::Phi { .. } => {}
                    Instruction::Jump { destination } => {
                        previous = Some(block);
                        block = *destination;
                        continue 'blocks;
                    }
                    Instruction::Branch {
                        condition,
                        positive,
                        negative,
                        ..
                    } => {
                        let taken = self.read(&frame, condition)? != 0;
                        previous = Some(block);
                        block = if taken { *positive } else { *negative };
                        continue 'blocks;
                    }
                    Instruction::Return { value } => {
                        if let Some(value) = value {
                            let value = self.value(&frame, value)?;
                            self.registers.insert(PhysicalRegister::RETURN, value);
                        }

                        self.registers
                            .insert(PhysicalRegister::Rsp, self.register(PhysicalRegister::Rbp));
                        let rbp = self.pop_word();
                        self.registers.insert(PhysicalRegister::Rbp, rbp);
                        self.pop_word();

                        return Ok(());
                    }
                    other => self.execute(&mut frame, other, depth)?,
                }
            }

            return Err(InterpretError::FellThrough {
                function: body.name.value().to_owned(),
                block,
            });
        }
    }

    /// Assigns all phis of `block` at once from the values flowing in along
    /// the edge from `previous`
    fn enter_phis(
        &mut self,
        frame: &mut Frame,
        block: BlockId,
        previous: Option<BlockId>,
    ) -> Result<(), InterpretError> {
        let module = self.module;
        let body = &module.functions[frame.function];

        let Some(previous) = previous else {
            return Ok(());
        };

        let mut assignments = Vec::new();

        for phi in body.phis(block) {
            if let Instruction::Phi {
                destination,
                sources,
            } = body.instruction(phi)
                && let Some(source) = sources.iter().find(|s| s.block == previous)
            {
                assignments.push((*destination, self.value(frame, &source.value)?));
            }
        }

        for (destination, value) in assignments {
            self.write(frame, &destination, value)?;
        }

        Ok(())
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        instruction: &Instruction,
        depth: usize,
    ) -> Result<(), InterpretError> {
        match instruction {
            Instruction::HeapAlloc { destination, size } => {
                let size = self.value(frame, size)?;
                let address = self.allocate(size);
                self.write(frame, destination, address)
            }
            Instruction::BinaryOperation {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let lhs = self.value(frame, lhs)?;
                let rhs = self.value(frame, rhs)?;

                let result = match operator {
                    BinaryOperator::Add => lhs.wrapping_add(rhs),
                    BinaryOperator::Subtract => lhs.wrapping_sub(rhs),
                    BinaryOperator::Multiply => lhs.wrapping_mul(rhs),
                    BinaryOperator::Divide | BinaryOperator::Modulo if rhs == 0 => {
                        return Err(InterpretError::DivisionByZero(self.function_name(frame)));
                    }
                    BinaryOperator::Divide => lhs.wrapping_div(rhs),
                    BinaryOperator::Modulo => lhs.wrapping_rem(rhs),
                    BinaryOperator::ShiftLeft => lhs.wrapping_shl((rhs & 63) as u32),
                    BinaryOperator::ShiftRight => lhs.wrapping_shr((rhs & 63) as u32),
                    BinaryOperator::BitwiseAnd => lhs & rhs,
                    BinaryOperator::BitwiseOr => lhs | rhs,
                    BinaryOperator::BitwiseXor => lhs ^ rhs,
                };

                self.write(frame, destination, result)
            }
            Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let lhs = self.value(frame, lhs)?;
                let rhs = self.value(frame, rhs)?;
                self.write(frame, destination, operator.evaluate(lhs, rhs) as i64)
            }
            Instruction::UnaryOperation {
                operator,
                destination,
                operand,
            } => {
                let value = self.value(frame, operand)?;

                let result = match operator {
                    UnaryOperator::Negate => value.wrapping_neg(),
                    UnaryOperator::BitwiseNot => !value,
                    UnaryOperator::LogicalNot => (value == 0) as i64,
                    UnaryOperator::Positive => value,
                };

                self.write(frame, destination, result)
            }
            Instruction::Move {
                destination,
                source,
            } => {
                let value = self.value(frame, source)?;
                self.write(frame, destination, value)
            }
            Instruction::Load {
                destination,
                source,
            } => {
                let value = self.read_word(self.address(frame, source)?);
                self.write(frame, destination, value)
            }
            Instruction::Store {
                destination,
                source,
            } => {
                let value = self.value(frame, source)?;
                self.write(frame, &Storage::Memory(*destination), value)
            }
            Instruction::Lea {
                destination,
                source,
            } => {
                let address = self.address(frame, source)?;
                self.write(frame, destination, address)
            }
            Instruction::Push { source } => {
                let value = self.value(frame, source)?;
                self.push_word(value);
                Ok(())
            }
            Instruction::Pop { destination } => {
                let value = self.pop_word();
                self.write(frame, destination, value)
            }
            Instruction::FunctionCall { callee, arguments } => match callee {
                Callee::Function(function) => self.call(*function, depth + 1),
                Callee::Runtime(runtime) => {
                    let arguments = arguments
                        .iter()
                        .map(|argument| self.read(frame, argument))
                        .collect::<Result<Vec<_>, _>>()?;

                    let result = match runtime {
                        RuntimeFunction::Malloc => {
                            self.allocate(arguments.first().copied().unwrap_or(0))
                        }
                        _ => 0,
                    };

                    self.events.push(RuntimeEvent {
                        function: *runtime,
                        arguments,
                    });
                    self.registers.insert(PhysicalRegister::RETURN, result);

                    Ok(())
                }
            },
            Instruction::Phi { .. }
            | Instruction::Jump { .. }
            | Instruction::Branch { .. }
            | Instruction::Return { .. } => Ok(()),
        }
    }
}
