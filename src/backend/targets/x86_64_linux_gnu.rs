use hashbrown::{HashMap, HashSet};
use indoc::formatdoc;
use itertools::Itertools;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::{
    backend::{
        CodegenOptions,
        assemblers::x86_64::{Assembler, PhysicalRegister},
        coloring::{Coloring, Location},
        targets::CodeGenerator,
    },
    error::IrError,
    index::IndexVec,
    middle::lir::{
        self, BinaryOperator, BlockId, Callee, CompareOperator, DataSymbol, FunctionId, GlobalId,
        Instruction, Memory, Operand, Register, RegisterId, RuntimeFunction, StaticStringId,
        Storage, UnaryOperator, operand::WORD_SIZE,
    },
};

pub struct CodeGeneratorX86_64LinuxGnu;

impl CodeGenerator for CodeGeneratorX86_64LinuxGnu {
    fn translate_to_asm(
        &self,
        module: &lir::Module,
        colorings: &IndexVec<FunctionId, Coloring>,
        options: &CodegenOptions,
    ) -> Result<String, IrError> {
        let mut namer = Namer::new(module);
        let mut assembler = Assembler::new();

        let entry = module
            .entry
            .map(|id| namer.block(module, id, module.functions[id].entry));
        let globals = module
            .globals
            .indices()
            .map(|id| namer.global(module, id))
            .collect_vec();
        let strings = module
            .static_strings
            .indices()
            .map(|id| namer.string(id))
            .collect_vec();

        let exports = entry
            .iter()
            .chain(&globals)
            .chain(&strings)
            .map(|label| format!("global {label}"))
            .join("\n");

        assembler.push_line(formatdoc! {"
            default rel

            {exports}

            extern {externs}",
            exports = exports,
            externs = RuntimeFunction::iter().join(", ")
        });

        if !globals.is_empty() {
            assembler.blank_line();
            assembler.section(".DATA_common align=8 noexecute");
            assembler.blank_line();

            for label in &globals {
                assembler.push_line(format!("{label}: dq 0"));
            }
        }

        if !strings.is_empty() {
            assembler.blank_line();
            assembler.section(".DATA_cstring align=1 noexecute");
            assembler.blank_line();

            for (label, string) in strings.iter().zip(module.static_strings.iter()) {
                assembler.label(label);
                assembler.emit(format!("dq {}", string.value.len()));
                assembler.emit(format!(
                    "db {} ; {}",
                    string
                        .value
                        .bytes()
                        .map(|b| b.to_string())
                        .chain(["0".to_owned()])
                        .join(", "),
                    string.value.escape_default()
                ));
            }
        }

        assembler.blank_line();
        assembler.section(".TEXT align=16 execute");
        assembler.blank_line();

        let empty = Coloring::default();

        for (id, function) in module.functions.enumerate() {
            let coloring = colorings.get(id).unwrap_or(&empty);

            FunctionEmitter::new(module, id, coloring, options, &mut namer, &mut assembler)
                .emit()?;

            assembler.blank_line();
            assembler.push_line("ALIGN   16");
            assembler.blank_line();

            debug!(function = %function.name, "emitted function");
        }

        Ok(assembler.into_output())
    }
}

/// Hands out `name_N` labels. The counter is shared by everything named
/// through one namer, and every entity keeps the first name it was given.
struct Namer {
    counts: HashMap<String, usize>,
    globals: IndexVec<GlobalId, Option<String>>,
    strings: IndexVec<StaticStringId, Option<String>>,
    blocks: IndexVec<FunctionId, IndexVec<BlockId, Option<String>>>,
    registers: IndexVec<FunctionId, IndexVec<RegisterId, Option<String>>>,
}

fn unique_name(counts: &mut HashMap<String, usize>, slot: &mut Option<String>, base: &str) -> String {
    slot.get_or_insert_with(|| {
        let count = counts.entry(base.to_owned()).or_insert(0);
        *count += 1;
        format!("{base}_{count}")
    })
    .clone()
}

impl Namer {
    fn new(module: &lir::Module) -> Self {
        Self {
            counts: HashMap::new(),
            globals: IndexVec::from_elem_n(None, module.globals.len()),
            strings: IndexVec::from_elem_n(None, module.static_strings.len()),
            blocks: module
                .functions
                .iter()
                .map(|f| IndexVec::from_elem_n(None, f.blocks.len()))
                .collect(),
            registers: module
                .functions
                .iter()
                .map(|f| IndexVec::from_elem_n(None, f.registers.len()))
                .collect(),
        }
    }

    fn global(&mut self, module: &lir::Module, id: GlobalId) -> String {
        let global = &module.globals[id];
        let base = global.label.unwrap_or(global.name);

        unique_name(&mut self.counts, &mut self.globals[id], base.value())
    }

    fn string(&mut self, id: StaticStringId) -> String {
        unique_name(&mut self.counts, &mut self.strings[id], "str")
    }

    fn block(&mut self, module: &lir::Module, function: FunctionId, block: BlockId) -> String {
        let base = module.functions[function].blocks[block].name;

        unique_name(&mut self.counts, &mut self.blocks[function][block], base.value())
    }

    fn register(&mut self, function: &lir::Function, id: FunctionId, register: RegisterId) -> String {
        let base = function.registers[register]
            .hint
            .map_or("t", |hint| hint.value());

        unique_name(&mut self.counts, &mut self.registers[id][register], base)
    }
}

/// An instruction operand after coloring
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Register {
        name: String,
        physical: Option<PhysicalRegister>,
    },
    Memory(String),
    Immediate(i64),
    /// Address of a labeled datum. Only `lea` can produce it.
    Address(String),
}

impl Value {
    fn physical(register: PhysicalRegister) -> Self {
        Self::Register {
            name: register.to_string(),
            physical: Some(register),
        }
    }

    fn is_register(&self) -> bool {
        matches!(self, Self::Register { .. })
    }

    fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Register { name, .. } => f.write_str(name),
            Value::Memory(memory) => f.write_str(memory),
            Value::Immediate(value) => write!(f, "{value}"),
            Value::Address(label) => write!(f, "[{label}]"),
        }
    }
}

fn fits_in_32_bits(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

fn jump_mnemonic(operator: CompareOperator) -> &'static str {
    match operator {
        CompareOperator::Equal => "je",
        CompareOperator::NotEqual => "jne",
        CompareOperator::Less => "jl",
        CompareOperator::LessEqual => "jle",
        CompareOperator::Greater => "jg",
        CompareOperator::GreaterEqual => "jge",
    }
}

fn set_mnemonic(operator: CompareOperator) -> &'static str {
    match operator {
        CompareOperator::Equal => "sete",
        CompareOperator::NotEqual => "setne",
        CompareOperator::Less => "setl",
        CompareOperator::LessEqual => "setle",
        CompareOperator::Greater => "setg",
        CompareOperator::GreaterEqual => "setge",
    }
}

struct FunctionEmitter<'a> {
    module: &'a lir::Module,
    id: FunctionId,
    function: &'a lir::Function,
    coloring: &'a Coloring,
    options: &'a CodegenOptions,
    namer: &'a mut Namer,
    assembler: &'a mut Assembler,
    frame_size: i64,
    /// Comparison results read by something other than a branch. Only
    /// those are written to their destination; branches use the flags.
    materialized: HashSet<RegisterId>,
    /// Whether `r11` already holds a value for the current instruction
    scratch_taken: bool,
}

impl<'a> FunctionEmitter<'a> {
    fn new(
        module: &'a lir::Module,
        id: FunctionId,
        coloring: &'a Coloring,
        options: &'a CodegenOptions,
        namer: &'a mut Namer,
        assembler: &'a mut Assembler,
    ) -> Self {
        let function = &module.functions[id];

        let words = function.argument_limit.saturating_sub(PhysicalRegister::ARGUMENTS.len())
            + function.temporary_count
            + coloring.slot_count();

        let materialized = function
            .all_instructions()
            .into_iter()
            .map(|i| function.instruction(i))
            .filter(|i| !matches!(i, Instruction::Branch { .. }))
            .flat_map(|i| i.used_registers())
            .collect();

        Self {
            module,
            id,
            function,
            coloring,
            options,
            namer,
            assembler,
            frame_size: words as i64 * WORD_SIZE,
            materialized,
            scratch_taken: false,
        }
    }

    fn emit(mut self) -> Result<(), IrError> {
        let function = self.function;
        let order = function.reverse_postorder();

        for (position, block) in order.iter().copied().enumerate() {
            let next = order.get(position + 1).copied();

            let label = self.label(block);
            self.assembler.label(label);

            if block == function.entry {
                self.prologue();
            }

            for (_, instruction) in function.instructions_in(block) {
                self.scratch_taken = false;

                if self.options.annotate {
                    self.assembler
                        .comment(strip_ansi_escapes::strip_str(instruction.to_string()));
                }

                self.lower(block, instruction, next)?;
            }

            self.assembler.blank_line();
        }

        Ok(())
    }

    fn prologue(&mut self) {
        self.assembler.unary("push", "rbp");
        self.assembler.instruction("mov", "rbp", "rsp");

        if self.frame_size != 0 {
            self.assembler
                .instruction("sub", "rsp", &self.frame_size.to_string());
        }
    }

    fn epilogue(&mut self) {
        if self.frame_size != 0 {
            self.assembler
                .instruction("add", "rsp", &self.frame_size.to_string());
        }

        self.assembler.unary("pop", "rbp");
    }

    fn invalid(&self, mnemonic: &'static str) -> IrError {
        IrError::InvalidOperand {
            function: self.function.name.value().to_owned(),
            mnemonic,
        }
    }

    fn label(&mut self, block: BlockId) -> String {
        self.namer.block(self.module, self.id, block)
    }

    /// Claims `r11` for the current instruction
    fn scratch(&mut self, mnemonic: &'static str) -> Result<Value, IrError> {
        if self.scratch_taken {
            return Err(self.invalid(mnemonic));
        }

        self.scratch_taken = true;
        Ok(Value::physical(PhysicalRegister::SCRATCH))
    }

    fn register(&mut self, register: RegisterId) -> Value {
        match self.coloring.location(register) {
            Some(Location::Register(physical)) => Value::physical(physical),
            Some(Location::Slot(slot)) => {
                let words = self.function.temporary_count as i64 + slot as i64 + 1;
                Value::Memory(format!("qword [rbp-{}]", words * WORD_SIZE))
            }
            None => Value::Register {
                name: self.namer.register(self.function, self.id, register),
                physical: None,
            },
        }
    }

    fn address_register(&mut self, register: Register) -> Result<String, IrError> {
        match register {
            Register::Physical(physical) => Ok(physical.to_string()),
            Register::Virtual(id) => match self.register(id) {
                Value::Memory(_) => Err(IrError::SpilledAddressRegister {
                    function: self.function.name.value().to_owned(),
                    register: id,
                }),
                value => Ok(value.to_string()),
            },
        }
    }

    /// `[symbol+base+index*scale+offset]` without the absent parts
    fn address(&mut self, memory: &Memory) -> Result<String, IrError> {
        let mut parts = Vec::new();

        match memory.symbol {
            Some(DataSymbol::Global(global)) => parts.push(self.namer.global(self.module, global)),
            Some(DataSymbol::StaticString(string)) => parts.push(self.namer.string(string)),
            None => {}
        }

        if let Some(base) = memory.base {
            parts.push(self.address_register(base)?);
        }

        if let Some(index) = memory.index {
            let index = self.address_register(index)?;

            parts.push(match memory.scale {
                1 => index,
                scale => format!("{index}*{scale}"),
            });
        }

        let mut address = parts.join("+");

        match memory.offset {
            0 if !address.is_empty() => {}
            offset if address.is_empty() => address = offset.to_string(),
            offset if offset > 0 => address.push_str(&format!("+{offset}")),
            offset => address.push_str(&offset.to_string()),
        }

        Ok(format!("[{address}]"))
    }

    fn storage(&mut self, storage: Storage) -> Result<Value, IrError> {
        match storage {
            Storage::Virtual(register) => Ok(self.register(register)),
            Storage::Physical(physical) => Ok(Value::physical(physical)),
            Storage::Memory(memory) => Ok(Value::Memory(format!("qword {}", self.address(&memory)?))),
            Storage::Global(_) => Err(IrError::UnresolvedGlobal {
                function: self.function.name.value().to_owned(),
            }),
            Storage::StaticString(string) => Ok(Value::Address(self.namer.string(string))),
        }
    }

    fn operand(&mut self, operand: Operand) -> Result<Value, IrError> {
        match operand {
            Operand::Immediate(value) => Ok(Value::Immediate(value)),
            Operand::Storage(storage) => self.storage(storage),
        }
    }

    fn destination(&mut self, storage: Storage, mnemonic: &'static str) -> Result<Value, IrError> {
        match self.storage(storage)? {
            Value::Address(_) => Err(self.invalid(mnemonic)),
            value => Ok(value),
        }
    }

    /// Puts addresses and immediates wider than 32 bits into `r11` so the
    /// value can be the second operand of an instruction
    fn source(&mut self, value: Value, mnemonic: &'static str) -> Result<Value, IrError> {
        match value {
            Value::Address(label) => {
                let scratch = self.scratch(mnemonic)?;
                self.assembler
                    .instruction("lea", &scratch.to_string(), &format!("[{label}]"));
                Ok(scratch)
            }
            Value::Immediate(value) if !fits_in_32_bits(value) => {
                let scratch = self.scratch(mnemonic)?;
                self.assembler
                    .instruction("mov", &scratch.to_string(), &value.to_string());
                Ok(scratch)
            }
            other => Ok(other),
        }
    }

    /// `destination = value`, skipping copies onto itself
    fn copy(&mut self, destination: &Value, value: Value) -> Result<(), IrError> {
        if *destination == value {
            return Ok(());
        }

        let destination_text = destination.to_string();

        match value {
            Value::Address(label) if destination.is_register() => {
                self.assembler
                    .instruction("lea", &destination_text, &format!("[{label}]"));
            }
            Value::Immediate(immediate) if destination.is_register() => {
                self.assembler
                    .instruction("mov", &destination_text, &immediate.to_string());
            }
            Value::Memory(_) if destination.is_memory() => {
                let scratch = self.scratch("mov")?;
                self.assembler
                    .instruction("mov", &scratch.to_string(), &value.to_string());
                self.assembler
                    .instruction("mov", &destination_text, &scratch.to_string());
            }
            value => {
                let source = self.source(value, "mov")?;
                self.assembler
                    .instruction("mov", &destination_text, &source.to_string());
            }
        }

        Ok(())
    }

    fn lower(
        &mut self,
        block: BlockId,
        instruction: &Instruction,
        next: Option<BlockId>,
    ) -> Result<(), IrError> {
        match instruction {
            Instruction::Move {
                destination,
                source,
            } => {
                let destination = self.destination(*destination, "mov")?;
                let source = self.operand(*source)?;
                self.copy(&destination, source)
            }
            Instruction::Load {
                destination,
                source,
            } => {
                let destination = self.destination(*destination, "mov")?;
                let source = self.storage(Storage::Memory(*source))?;
                self.copy(&destination, source)
            }
            Instruction::Store {
                destination,
                source,
            } => {
                let destination = self.storage(Storage::Memory(*destination))?;
                let source = self.operand(*source)?;
                self.copy(&destination, source)
            }
            Instruction::Lea {
                destination,
                source,
            } => {
                let destination = self.destination(*destination, "lea")?;
                let address = self.address(source)?;

                if destination.is_register() {
                    self.assembler
                        .instruction("lea", &destination.to_string(), &address);
                    Ok(())
                } else {
                    let scratch = self.scratch("lea")?;
                    self.assembler
                        .instruction("lea", &scratch.to_string(), &address);
                    self.copy(&destination, scratch)
                }
            }
            Instruction::HeapAlloc { destination, size } => {
                let size = self.operand(*size)?;
                self.copy(&Value::physical(PhysicalRegister::Rdi), size)?;
                self.assembler
                    .unary("call", &RuntimeFunction::Malloc.to_string());

                let destination = self.destination(*destination, "mov")?;
                self.copy(&destination, Value::physical(PhysicalRegister::RETURN))
            }
            Instruction::BinaryOperation {
                operator,
                destination,
                lhs,
                rhs,
            } => match operator {
                BinaryOperator::Divide | BinaryOperator::Modulo => {
                    self.divide(*operator, *destination, *lhs, *rhs)
                }
                BinaryOperator::ShiftLeft => self.shift("shl", *destination, *lhs, *rhs),
                BinaryOperator::ShiftRight => self.shift("sar", *destination, *lhs, *rhs),
                BinaryOperator::Add => self.arithmetic("add", true, *destination, *lhs, *rhs),
                BinaryOperator::Subtract => self.arithmetic("sub", false, *destination, *lhs, *rhs),
                BinaryOperator::Multiply => self.arithmetic("imul", true, *destination, *lhs, *rhs),
                BinaryOperator::BitwiseAnd => self.arithmetic("and", true, *destination, *lhs, *rhs),
                BinaryOperator::BitwiseOr => self.arithmetic("or", true, *destination, *lhs, *rhs),
                BinaryOperator::BitwiseXor => self.arithmetic("xor", true, *destination, *lhs, *rhs),
            },
            Instruction::UnaryOperation {
                operator,
                destination,
                operand,
            } => {
                let mnemonic = match operator {
                    UnaryOperator::Negate => "neg",
                    UnaryOperator::BitwiseNot => "not",
                    UnaryOperator::LogicalNot | UnaryOperator::Positive => {
                        return Err(IrError::UnloweredOperator(*operator));
                    }
                };

                let destination = self.destination(*destination, mnemonic)?;
                let operand = self.operand(*operand)?;
                let work = match destination.is_register() {
                    true => destination.clone(),
                    false => self.scratch(mnemonic)?,
                };

                self.copy(&work, operand)?;
                self.assembler.unary(mnemonic, &work.to_string());
                self.copy(&destination, work)
            }
            Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => self.compare(*operator, *destination, *lhs, *rhs),
            Instruction::Branch {
                operator,
                positive,
                negative,
                ..
            } => {
                // Fall through wherever possible
                let (operator, target, otherwise) = if Some(*positive) == next {
                    (operator.inverse(), *negative, None)
                } else if Some(*negative) == next {
                    (*operator, *positive, None)
                } else {
                    (*operator, *positive, Some(*negative))
                };

                let target = self.label(target);
                self.assembler.unary(jump_mnemonic(operator), &target);

                if let Some(otherwise) = otherwise {
                    let otherwise = self.label(otherwise);
                    self.assembler.unary("jmp", &otherwise);
                }

                Ok(())
            }
            Instruction::Jump { destination } => {
                if Some(*destination) != next {
                    let label = self.label(*destination);
                    self.assembler.unary("jmp", &label);
                }

                Ok(())
            }
            Instruction::Return { value } => {
                if let Some(value) = value {
                    let value = self.operand(*value)?;
                    self.copy(&Value::physical(PhysicalRegister::RETURN), value)?;
                }

                self.epilogue();
                self.assembler.emit("ret");
                Ok(())
            }
            Instruction::FunctionCall { callee, .. } => {
                let label = match callee {
                    Callee::Function(function) => {
                        let entry = self.module.functions[*function].entry;
                        self.namer.block(self.module, *function, entry)
                    }
                    Callee::Runtime(runtime) => runtime.to_string(),
                };

                self.assembler.unary("call", &label);
                Ok(())
            }
            Instruction::Push { source } => {
                let source = self.operand(*source)?;
                let source = self.source(source, "push")?;
                self.assembler.unary("push", &source.to_string());
                Ok(())
            }
            Instruction::Pop { destination } => {
                let destination = self.destination(*destination, "pop")?;
                self.assembler.unary("pop", &destination.to_string());
                Ok(())
            }
            Instruction::Phi { .. } => Err(IrError::PhiAfterDestruction {
                function: self.function.name.value().to_owned(),
                block,
            }),
        }
    }

    /// Two-operand forms. The result is computed in the destination when it
    /// is a register the right hand side does not live in, in `r11`
    /// otherwise.
    fn arithmetic(
        &mut self,
        mnemonic: &'static str,
        commutative: bool,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), IrError> {
        let destination = self.destination(destination, mnemonic)?;
        let mut lhs = self.operand(lhs)?;
        let mut rhs = self.operand(rhs)?;

        let constant = |v: &Value| matches!(v, Value::Immediate(_) | Value::Address(_));

        if commutative
            && ((constant(&lhs) && !constant(&rhs)) || (rhs == destination && lhs != destination))
        {
            std::mem::swap(&mut lhs, &mut rhs);
        }

        let work = if destination.is_register() && (rhs != destination || lhs == destination) {
            destination.clone()
        } else {
            self.scratch(mnemonic)?
        };

        self.copy(&work, lhs)?;
        let rhs = self.source(rhs, mnemonic)?;
        self.assembler
            .instruction(mnemonic, &work.to_string(), &rhs.to_string());

        self.copy(&destination, work)
    }

    /// `idiv` divides `rdx:rax`, leaving the quotient in `rax` and the
    /// remainder in `rdx`
    fn divide(
        &mut self,
        operator: BinaryOperator,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), IrError> {
        let rax = Value::physical(PhysicalRegister::Rax);
        let rdx = Value::physical(PhysicalRegister::Rdx);

        let destination = self.destination(destination, "idiv")?;
        let lhs = self.operand(lhs)?;
        let mut divisor = self.operand(rhs)?;

        if matches!(divisor, Value::Immediate(_) | Value::Address(_))
            || divisor == rax
            || divisor == rdx
        {
            let scratch = self.scratch("idiv")?;
            self.copy(&scratch, divisor)?;
            divisor = scratch;
        }

        self.copy(&rax, lhs)?;
        self.assembler.emit("cqo");
        self.assembler.unary("idiv", &divisor.to_string());

        let result = match operator {
            BinaryOperator::Modulo => rdx,
            _ => rax,
        };

        self.copy(&destination, result)
    }

    fn shift(
        &mut self,
        mnemonic: &'static str,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), IrError> {
        let rcx = Value::physical(PhysicalRegister::SHIFT_COUNT);

        let destination = self.destination(destination, mnemonic)?;
        let lhs = self.operand(lhs)?;
        let count = self.operand(rhs)?;

        if let Value::Immediate(amount) = count {
            let work = match destination.is_register() {
                true => destination.clone(),
                false => self.scratch(mnemonic)?,
            };

            self.copy(&work, lhs)?;
            self.assembler
                .instruction(mnemonic, &work.to_string(), &(amount & 63).to_string());

            return self.copy(&destination, work);
        }

        let work = if destination.is_register()
            && destination != rcx
            && (count != destination || lhs == destination)
        {
            destination.clone()
        } else {
            self.scratch(mnemonic)?
        };

        // The left hand side may live in rcx, so it moves first
        self.copy(&work, lhs)?;
        self.copy(&rcx, count)?;
        self.assembler.instruction(
            mnemonic,
            &work.to_string(),
            PhysicalRegister::SHIFT_COUNT.as_8_bit(),
        );

        self.copy(&destination, work)
    }

    fn compare(
        &mut self,
        operator: CompareOperator,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), IrError> {
        let mut lhs = self.operand(lhs)?;
        let mut rhs = self.operand(rhs)?;

        // Only one side can go through r11, so two constants are replaced
        // by a small pair with the same outcome. The flags still have to
        // come out right for the branch that reads them.
        if let (Value::Immediate(l), Value::Immediate(r)) = (&lhs, &rhs) {
            let holds = operator.evaluate(*l, *r);

            if let Some((l, r)) = [(0, 0), (0, 1), (1, 0)]
                .into_iter()
                .find(|(l, r)| operator.evaluate(*l, *r) == holds)
            {
                lhs = Value::Immediate(l);
                rhs = Value::Immediate(r);
            }
        }

        if matches!(lhs, Value::Immediate(_) | Value::Address(_))
            || (lhs.is_memory() && rhs.is_memory())
        {
            let scratch = self.scratch("cmp")?;
            self.copy(&scratch, lhs)?;
            lhs = scratch;
        }

        let rhs = self.source(rhs, "cmp")?;
        self.assembler
            .instruction("cmp", &lhs.to_string(), &rhs.to_string());

        let needed = match destination {
            Storage::Virtual(register) => self.materialized.contains(&register),
            _ => true,
        };

        if !needed {
            return Ok(());
        }

        // The flags hold the result now, so r11 is free again
        self.scratch_taken = false;
        let destination = self.destination(destination, "cmp")?;

        match destination {
            Value::Register {
                physical: Some(physical),
                ..
            } => {
                self.assembler
                    .unary(set_mnemonic(operator), physical.as_8_bit());
                self.assembler.instruction(
                    "movzx",
                    &physical.to_string(),
                    physical.as_8_bit(),
                );
                Ok(())
            }
            destination => {
                let scratch = self.scratch("cmp")?;
                let low = PhysicalRegister::SCRATCH.as_8_bit();

                self.assembler.unary(set_mnemonic(operator), low);
                self.assembler
                    .instruction("movzx", &scratch.to_string(), low);
                self.copy(&destination, scratch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::intern::InternedSymbol,
        index::Index,
        middle::lir::{Function, GlobalVariable, Module, PhiSource, StaticString},
    };

    fn emit(module: &Module, colorings: &IndexVec<FunctionId, Coloring>) -> Result<String, IrError> {
        CodeGeneratorX86_64LinuxGnu.translate_to_asm(module, colorings, &CodegenOptions::default())
    }

    /// `main` returning whatever `body` leaves in rax
    fn module_with(body: impl FnOnce(&mut Function)) -> Module {
        let mut function = Function::new("main", 0);
        body(&mut function);

        let mut module = Module::default();
        module.entry = Some(module.functions.push(function));
        module
    }

    fn jump_to_exit(function: &mut Function, from: BlockId) {
        let exit = function.exit.unwrap();
        function
            .push_instruction(from, Instruction::Jump { destination: exit })
            .unwrap();
        function
            .push_instruction(exit, Instruction::Return {
                value: Some(Operand::physical(PhysicalRegister::Rax)),
            })
            .unwrap();
    }

    #[test]
    fn sections_come_in_order() {
        let mut module = module_with(|f| {
            let entry = f.entry;
            jump_to_exit(f, entry);
        });
        module.globals.push(GlobalVariable {
            name: InternedSymbol::new("counter"),
            label: Some(InternedSymbol::new("counter")),
        });
        module.static_strings.push(StaticString {
            value: "hi\n".to_owned(),
        });

        let expected = indoc::indoc! {r#"
            default rel

            global main_entry_1
            global counter_1
            global str_1

            extern printf, scanf, puts, gets, sprintf, sscanf, getchar, strlen, strcmp, strcpy, strncpy, malloc

            SECTION .DATA_common align=8 noexecute

            counter_1: dq 0

            SECTION .DATA_cstring align=1 noexecute

            str_1:
                    dq 3
                    db 104, 105, 10, 0 ; hi\n

            SECTION .TEXT align=16 execute

            main_entry_1:
                    push    rbp
                    mov     rbp, rsp

            main_exit_1:
                    pop     rbp
                    ret


            ALIGN   16

        "#};

        assert_eq!(emit(&module, &IndexVec::new()).unwrap(), expected);
    }

    #[test]
    fn branches_fall_through_and_division_uses_rax() {
        let module = module_with(|f| {
            let entry = f.entry;
            let exit = f.exit.unwrap();
            let then = f.create_block("then");
            let [condition, quotient] = std::array::from_fn(|_| f.create_register(None));

            f.push_instruction(entry, Instruction::Compare {
                operator: CompareOperator::Less,
                destination: Storage::Virtual(condition),
                lhs: Operand::physical(PhysicalRegister::Rdi),
                rhs: Operand::Immediate(10),
            })
            .unwrap();
            f.push_instruction(entry, Instruction::Branch {
                operator: CompareOperator::Less,
                condition: Storage::Virtual(condition),
                positive: then,
                negative: exit,
            })
            .unwrap();
            f.push_instruction(then, Instruction::BinaryOperation {
                operator: BinaryOperator::Divide,
                destination: Storage::Virtual(quotient),
                lhs: Operand::physical(PhysicalRegister::Rdi),
                rhs: Operand::Immediate(3),
            })
            .unwrap();
            f.push_instruction(then, Instruction::Move {
                destination: Storage::Physical(PhysicalRegister::Rax),
                source: Operand::virtual_register(quotient),
            })
            .unwrap();
            jump_to_exit(f, then);
        });

        let mut coloring = Coloring::default();
        coloring.assign(RegisterId::new(1), Location::Register(PhysicalRegister::Rbx));
        let colorings = IndexVec::from_raw(vec![coloring]);

        let output = emit(&module, &colorings).unwrap();
        let lines = output.lines().map(str::trim).collect_vec();

        let expected = [
            "cmp     rdi, 10",
            "jge     main_exit_1",
            "",
            "then_1:",
            "mov     r11, 3",
            "mov     rax, rdi",
            "cqo",
            "idiv    r11",
            "mov     rbx, rax",
            "mov     rax, rbx",
            "",
            "main_exit_1:",
        ];
        let start = lines.iter().position(|l| *l == expected[0]).unwrap();

        assert_eq!(lines[start..start + expected.len()], expected);
        assert!(!output.contains("setl"));
        assert!(!output.contains("jmp"));
    }

    #[test]
    fn spill_slots_sit_below_temporaries() {
        let module = module_with(|f| {
            let entry = f.entry;
            let value = f.create_register(None);
            f.temporary_count = 1;
            f.argument_limit = 8;

            f.push_instruction(entry, Instruction::Move {
                destination: Storage::Virtual(value),
                source: Operand::Immediate(5),
            })
            .unwrap();
            f.push_instruction(entry, Instruction::Move {
                destination: Storage::Physical(PhysicalRegister::Rax),
                source: Operand::virtual_register(value),
            })
            .unwrap();
            jump_to_exit(f, entry);
        });

        let mut coloring = Coloring::default();
        coloring.assign(RegisterId::new(0), Location::Slot(0));

        let output = emit(&module, &IndexVec::from_raw(vec![coloring])).unwrap();

        assert!(output.contains("        sub     rsp, 32\n"));
        assert!(output.contains("        mov     qword [rbp-16], 5\n"));
        assert!(output.contains("        mov     rax, qword [rbp-16]\n"));
        assert!(output.contains("        add     rsp, 32\n        pop     rbp\n        ret\n"));
    }

    #[test]
    fn comparisons_read_elsewhere_are_materialized() {
        let module = module_with(|f| {
            let entry = f.entry;
            let flag = f.create_register(None);

            f.push_instruction(entry, Instruction::Compare {
                operator: CompareOperator::Equal,
                destination: Storage::Virtual(flag),
                lhs: Operand::Immediate(1),
                rhs: Operand::physical(PhysicalRegister::Rsi),
            })
            .unwrap();
            f.push_instruction(entry, Instruction::Move {
                destination: Storage::Physical(PhysicalRegister::Rax),
                source: Operand::virtual_register(flag),
            })
            .unwrap();
            jump_to_exit(f, entry);
        });

        let mut coloring = Coloring::default();
        coloring.assign(RegisterId::new(0), Location::Register(PhysicalRegister::Rdx));

        let output = emit(&module, &IndexVec::from_raw(vec![coloring])).unwrap();

        assert!(output.contains("mov     r11, 1\n        cmp     r11, rsi\n"));
        assert!(output.contains("sete    dl\n        movzx   rdx, dl\n"));
    }

    #[test]
    fn constant_comparisons_keep_their_outcome() {
        let module = module_with(|f| {
            let entry = f.entry;
            let exit = f.exit.unwrap();
            let taken = f.create_block("taken");
            let flag = f.create_register(None);

            f.push_instruction(entry, Instruction::Compare {
                operator: CompareOperator::Less,
                destination: Storage::Virtual(flag),
                lhs: Operand::Immediate(1),
                rhs: Operand::Immediate(5_000_000_000),
            })
            .unwrap();
            f.push_instruction(entry, Instruction::Branch {
                operator: CompareOperator::Less,
                condition: Storage::Virtual(flag),
                positive: taken,
                negative: exit,
            })
            .unwrap();
            jump_to_exit(f, taken);
        });

        let output = emit(&module, &IndexVec::new()).unwrap();

        // 1 < 5000000000 holds, and so does 0 < 1
        assert!(output.contains("mov     r11, 0\n        cmp     r11, 1\n"));
        assert!(!output.contains("5000000000"));
    }

    #[test]
    fn uncolored_registers_print_by_name() {
        let module = module_with(|f| {
            let entry = f.entry;
            let named = f.create_register(Some(InternedSymbol::new("sum")));
            let anonymous = f.create_register(None);

            f.push_instruction(entry, Instruction::BinaryOperation {
                operator: BinaryOperator::Subtract,
                destination: Storage::Virtual(anonymous),
                lhs: Operand::Immediate(7),
                rhs: Operand::virtual_register(named),
            })
            .unwrap();
            jump_to_exit(f, entry);
        });

        let output = emit(&module, &IndexVec::new()).unwrap();

        assert!(output.contains("mov     t_1, 7\n        sub     t_1, sum_1\n"));
    }

    #[test]
    fn leftover_phis_are_rejected() {
        let module = module_with(|f| {
            let entry = f.entry;
            let exit = f.exit.unwrap();
            let value = f.create_register(None);

            f.push_instruction(entry, Instruction::Jump { destination: exit })
                .unwrap();
            f.insert_phi(exit, Storage::Virtual(value), vec![PhiSource {
                block: entry,
                value: Operand::Immediate(1),
            }])
            .unwrap();
            f.push_instruction(exit, Instruction::Return { value: None })
                .unwrap();
        });

        assert!(matches!(
            emit(&module, &IndexVec::new()),
            Err(IrError::PhiAfterDestruction { .. })
        ));
    }

    #[test]
    fn operators_without_encoding_are_rejected() {
        let module = module_with(|f| {
            let entry = f.entry;
            let value = f.create_register(None);

            f.push_instruction(entry, Instruction::UnaryOperation {
                operator: UnaryOperator::LogicalNot,
                destination: Storage::Virtual(value),
                operand: Operand::Immediate(0),
            })
            .unwrap();
            jump_to_exit(f, entry);
        });

        assert_eq!(
            emit(&module, &IndexVec::new()),
            Err(IrError::UnloweredOperator(UnaryOperator::LogicalNot))
        );
    }

    #[test]
    fn spilled_address_registers_are_rejected() {
        let module = module_with(|f| {
            let entry = f.entry;
            let pointer = f.create_register(None);

            f.push_instruction(entry, Instruction::Load {
                destination: Storage::Physical(PhysicalRegister::Rax),
                source: Memory::base_offset(Register::Virtual(pointer), 8),
            })
            .unwrap();
            jump_to_exit(f, entry);
        });

        let mut coloring = Coloring::default();
        coloring.assign(RegisterId::new(0), Location::Slot(0));

        assert!(matches!(
            emit(&module, &IndexVec::from_raw(vec![coloring])),
            Err(IrError::SpilledAddressRegister { .. })
        ));
    }
}
