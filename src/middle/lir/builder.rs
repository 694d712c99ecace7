//! Lowers a checked program into LIR.
//!
//! Every local variable and parameter gets one virtual register which is
//! simply redefined on each assignment; SSA construction versions them
//! later. Every intermediate value gets a fresh register.
//!
//! Calling convention: the first six arguments travel in `rdi, rsi, rdx,
//! rcx, r8, r9`, the rest are stored at `[rsp + 8k]` by the caller and read
//! back from `[rbp + 16 + 8k]` by the callee. Results come back in `rax`.

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    error::IrError,
    frontend::{
        ast::{self, LogicalOperator, Place, Statement, StorageClass},
        intern::InternedSymbol,
    },
    index::{Index, IndexVec},
    middle::lir::{
        BinaryOperator, BlockId, Callee, CompareOperator, Function, FunctionId, GlobalId,
        GlobalVariable, Instruction, Memory, Module, Operand, PhysicalRegister, Register,
        RegisterId, StaticString, StaticStringId, Storage, UnaryOperator, operand::WORD_SIZE,
    },
};

/// Name of the synthesized function which initializes globals and calls
/// `main`
pub const INIT_FUNCTION: &str = "__init";

/// Offset from the frame pointer of the first stack-passed parameter, past
/// the saved frame pointer and the return address
const STACK_PARAMETER_OFFSET: i64 = 16;

pub fn build_module(program: &ast::Program) -> Result<Module, IrError> {
    let mut module = Module::default();
    let mut global_ids = HashMap::new();

    for global in &program.globals {
        if global_ids.contains_key(global.name.as_str()) {
            return Err(IrError::DuplicateGlobal(global.name.clone()));
        }

        let id = module.globals.push(GlobalVariable {
            name: InternedSymbol::new(&global.name),
            label: None,
        });
        global_ids.insert(global.name.clone(), id);
    }

    let has_main = program.functions.iter().any(|f| f.name == "main");

    let mut function_ids = HashMap::new();
    for (index, function) in program.functions.iter().enumerate() {
        if function.name == INIT_FUNCTION || function_ids.contains_key(function.name.as_str()) {
            return Err(IrError::DuplicateFunction(function.name.clone()));
        }

        function_ids.insert(function.name.clone(), FunctionId::new(index));
    }

    let init = has_main.then(|| initializer_function(program));
    if init.is_some() {
        function_ids.insert(
            INIT_FUNCTION.to_owned(),
            FunctionId::new(program.functions.len()),
        );
    }

    let mut strings = StringTable::default();

    for declaration in program.functions.iter().chain(init.as_ref()) {
        let context = BodyLoweringContext {
            function_ids: &function_ids,
            global_ids: &global_ids,
            strings: &mut strings,
            function: Function::new(&declaration.name, declaration.parameters.len()),
            current: BlockId::new(0),
            locals: HashMap::new(),
            parameters: Vec::new(),
            loops: Vec::new(),
        };

        module.functions.push(context.lower(declaration)?);
    }

    if init.is_some() {
        module.entry = function_ids.get(INIT_FUNCTION).copied();
    }

    module.static_strings = strings.strings;

    Ok(module)
}

/// `__init` assigns every initialized global in declaration order, then
/// returns whatever `main` returns
fn initializer_function(program: &ast::Program) -> ast::FunctionDeclaration {
    let mut body = program
        .globals
        .iter()
        .filter_map(|global| {
            global.initializer.as_ref().map(|initializer| {
                Statement::assign(ast::Variable::global(&global.name), initializer.clone())
            })
        })
        .collect::<Vec<_>>();

    body.push(Statement::Return(Some(ast::Expression::call("main", Vec::new()))));

    ast::FunctionDeclaration {
        name: INIT_FUNCTION.to_owned(),
        parameters: Vec::new(),
        returns_value: true,
        body,
    }
}

#[derive(Default)]
struct StringTable {
    strings: IndexVec<StaticStringId, StaticString>,
    ids: HashMap<String, StaticStringId>,
}

impl StringTable {
    fn intern(&mut self, value: &str) -> StaticStringId {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }

        let id = self.strings.push(StaticString {
            value: value.to_owned(),
        });
        self.ids.insert(value.to_owned(), id);
        id
    }
}

struct LoopTargets {
    continue_to: BlockId,
    break_to: BlockId,
}

struct BodyLoweringContext<'a> {
    function_ids: &'a HashMap<String, FunctionId>,
    global_ids: &'a HashMap<String, GlobalId>,
    strings: &'a mut StringTable,

    function: Function,
    /// Block new instructions are appended to. Never terminated.
    current: BlockId,
    locals: HashMap<u32, RegisterId>,
    parameters: Vec<RegisterId>,
    loops: Vec<LoopTargets>,
}

impl BodyLoweringContext<'_> {
    fn lower(mut self, declaration: &ast::FunctionDeclaration) -> Result<Function, IrError> {
        self.current = self.function.entry;

        for (index, name) in declaration.parameters.iter().enumerate() {
            let register = self.function.create_register(Some(InternedSymbol::new(name)));
            self.parameters.push(register);

            let destination = Storage::Virtual(register);

            match PhysicalRegister::ARGUMENTS.get(index) {
                Some(argument) => self.push(Instruction::Move {
                    destination,
                    source: Operand::physical(*argument),
                })?,
                None => self.push(Instruction::Load {
                    destination,
                    source: Memory::base_offset(
                        Register::Physical(PhysicalRegister::Rbp),
                        STACK_PARAMETER_OFFSET
                            + (index - PhysicalRegister::ARGUMENTS.len()) as i64 * WORD_SIZE,
                    ),
                })?,
            }
        }

        self.lower_statements(&declaration.body)?;

        let exit = self.exit()?;

        self.push(Instruction::Jump { destination: exit })?;
        self.function.push_instruction(
            exit,
            Instruction::Return {
                value: declaration
                    .returns_value
                    .then_some(Operand::physical(PhysicalRegister::RETURN)),
            },
        )?;

        debug!(
            function = %declaration.name,
            blocks = self.function.blocks.len(),
            instructions = self.function.instructions.len(),
            registers = self.function.registers.len(),
            "lowered function"
        );

        Ok(self.function)
    }

    fn push(&mut self, instruction: Instruction) -> Result<(), IrError> {
        self.function.push_instruction(self.current, instruction)?;
        Ok(())
    }

    /// Terminates the current block with a jump and continues in `next`
    fn jump_to(&mut self, destination: BlockId, next: BlockId) -> Result<(), IrError> {
        self.push(Instruction::Jump { destination })?;
        self.current = next;
        Ok(())
    }

    fn exit(&self) -> Result<BlockId, IrError> {
        self.function.exit.ok_or_else(|| IrError::MissingExit {
            function: self.function.name.value().to_owned(),
        })
    }

    fn temporary(&mut self) -> RegisterId {
        self.function.create_register(None)
    }

    fn variable_storage(&mut self, variable: &ast::Variable) -> Result<Storage, IrError> {
        match variable.storage {
            StorageClass::Global => self
                .global_ids
                .get(variable.name.as_str())
                .map(|id| Storage::Global(*id))
                .ok_or_else(|| IrError::UnknownVariable(variable.name.clone())),
            StorageClass::Parameter(index) => self
                .parameters
                .get(index as usize)
                .map(|register| Storage::Virtual(*register))
                .ok_or_else(|| IrError::UnknownVariable(variable.name.clone())),
            StorageClass::Local(id) => {
                let function = &mut self.function;
                let register = *self.locals.entry(id).or_insert_with(|| {
                    function.create_register(Some(InternedSymbol::new(&variable.name)))
                });

                Ok(Storage::Virtual(register))
            }
        }
    }

    fn lower_statements(&mut self, statements: &[Statement]) -> Result<(), IrError> {
        for statement in statements {
            self.lower_statement(statement)?;
        }

        Ok(())
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<(), IrError> {
        match statement {
            Statement::Declare {
                variable,
                initializer,
            } => {
                let StorageClass::Local(id) = variable.storage else {
                    return Err(IrError::UnknownVariable(variable.name.clone()));
                };

                let register = self
                    .function
                    .create_register(Some(InternedSymbol::new(&variable.name)));
                self.locals.insert(id, register);

                let source = match initializer {
                    Some(initializer) => self.lower_expression(initializer)?,
                    None => Operand::Immediate(0),
                };

                self.push(Instruction::Move {
                    destination: Storage::Virtual(register),
                    source,
                })
            }
            Statement::Assign { target, value } => self.lower_assignment(target, value),
            Statement::Expression(expression) => {
                self.lower_expression(expression)?;
                Ok(())
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let then_block = self.function.create_block("if_then");
                let merge = self.function.create_block("if_merge");
                let else_block = if else_branch.is_empty() {
                    merge
                } else {
                    self.function.create_block("if_else")
                };

                self.lower_condition(condition, then_block, else_block)?;

                self.current = then_block;
                self.lower_statements(then_branch)?;

                if else_block != merge {
                    self.jump_to(merge, else_block)?;
                    self.lower_statements(else_branch)?;
                }

                self.jump_to(merge, merge)
            }
            Statement::While { condition, body } => {
                let header = self.function.create_block("while_condition");
                let body_block = self.function.create_block("while_body");
                let exit = self.function.create_block("while_exit");

                self.jump_to(header, header)?;
                self.lower_condition(condition, body_block, exit)?;

                self.current = body_block;
                self.lower_loop_body(body, header, exit)?;

                self.jump_to(header, exit)
            }
            Statement::For {
                initializer,
                condition,
                step,
                body,
            } => {
                self.lower_statements(initializer)?;

                let header = self.function.create_block("for_condition");
                let body_block = self.function.create_block("for_body");
                let step_block = self.function.create_block("for_step");
                let exit = self.function.create_block("for_exit");

                self.jump_to(header, header)?;

                match condition {
                    Some(condition) => self.lower_condition(condition, body_block, exit)?,
                    None => self.push(Instruction::Jump {
                        destination: body_block,
                    })?,
                }

                self.current = body_block;
                self.lower_loop_body(body, step_block, exit)?;

                self.jump_to(step_block, step_block)?;
                self.lower_statements(step)?;

                self.jump_to(header, exit)
            }
            Statement::Return(value) => {
                if let Some(value) = value {
                    let source = self.lower_expression(value)?;
                    self.push(Instruction::Move {
                        destination: Storage::Physical(PhysicalRegister::RETURN),
                        source,
                    })?;
                }

                let exit = self.exit()?;

                let next = self.function.create_block("after_return");
                self.jump_to(exit, next)
            }
            Statement::Break => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.break_to)
                    .ok_or(IrError::OutsideLoop("break"))?;

                let next = self.function.create_block("after_break");
                self.jump_to(target, next)
            }
            Statement::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.continue_to)
                    .ok_or(IrError::OutsideLoop("continue"))?;

                let next = self.function.create_block("after_continue");
                self.jump_to(target, next)
            }
            Statement::Block(statements) => self.lower_statements(statements),
        }
    }

    fn lower_loop_body(
        &mut self,
        body: &[Statement],
        continue_to: BlockId,
        break_to: BlockId,
    ) -> Result<(), IrError> {
        self.loops.push(LoopTargets {
            continue_to,
            break_to,
        });

        let result = self.lower_statements(body);
        self.loops.pop();

        result
    }

    fn lower_assignment(&mut self, target: &Place, value: &ast::Expression) -> Result<(), IrError> {
        match target {
            Place::Variable(variable) => {
                let destination = self.variable_storage(variable)?;
                let source = self.lower_expression(value)?;

                self.push(Instruction::Move {
                    destination,
                    source,
                })
            }
            Place::Field { object, slot } => {
                let destination = self.field_address(object, *slot)?;
                let source = self.lower_expression(value)?;

                self.push(Instruction::Store {
                    destination,
                    source,
                })
            }
            Place::Index { array, index } => {
                let destination = self.element_address(array, index)?;
                let source = self.lower_expression(value)?;

                self.push(Instruction::Store {
                    destination,
                    source,
                })
            }
        }
    }

    /// Lowers `expression` as the condition of a two-way branch. Terminates
    /// the current block on every path.
    fn lower_condition(
        &mut self,
        expression: &ast::Expression,
        on_true: BlockId,
        on_false: BlockId,
    ) -> Result<(), IrError> {
        match expression {
            ast::Expression::Boolean(value) => self.push(Instruction::Jump {
                destination: if *value { on_true } else { on_false },
            }),
            ast::Expression::Unary {
                operator: ast::UnaryOperator::LogicalNot,
                operand,
            } => self.lower_condition(operand, on_false, on_true),
            ast::Expression::Logical { operator, lhs, rhs } => {
                let rhs_block = self.function.create_block(match operator {
                    LogicalOperator::And => "and_rhs",
                    LogicalOperator::Or => "or_rhs",
                });

                match operator {
                    LogicalOperator::And => self.lower_condition(lhs, rhs_block, on_false)?,
                    LogicalOperator::Or => self.lower_condition(lhs, on_true, rhs_block)?,
                }

                self.current = rhs_block;
                self.lower_condition(rhs, on_true, on_false)
            }
            ast::Expression::Compare { operator, lhs, rhs } => {
                let lhs = self.lower_operand_before(lhs, &[&**rhs])?;
                let rhs = self.lower_expression(rhs)?;
                self.compare_and_branch(*operator, lhs, rhs, on_true, on_false)
            }
            _ => {
                let value = self.lower_expression(expression)?;
                self.compare_and_branch(
                    CompareOperator::NotEqual,
                    value,
                    Operand::Immediate(0),
                    on_true,
                    on_false,
                )
            }
        }
    }

    fn compare_and_branch(
        &mut self,
        operator: CompareOperator,
        lhs: Operand,
        rhs: Operand,
        positive: BlockId,
        negative: BlockId,
    ) -> Result<(), IrError> {
        let condition = Storage::Virtual(self.temporary());

        self.push(Instruction::Compare {
            operator,
            destination: condition,
            lhs,
            rhs,
        })?;
        self.push(Instruction::Branch {
            operator,
            condition,
            positive,
            negative,
        })
    }

    /// Makes sure `operand` lives in a virtual register so it can take part
    /// in an address computation
    fn into_register(&mut self, operand: Operand) -> Result<RegisterId, IrError> {
        if let Some(register) = operand.as_virtual() {
            return Ok(register);
        }

        let register = self.temporary();
        self.push(Instruction::Move {
            destination: Storage::Virtual(register),
            source: operand,
        })?;

        Ok(register)
    }

    fn field_address(&mut self, object: &ast::Expression, slot: u32) -> Result<Memory, IrError> {
        let object = self.lower_expression(object)?;
        let base = self.into_register(object)?;

        Ok(Memory::base_offset(
            Register::Virtual(base),
            slot as i64 * WORD_SIZE,
        ))
    }

    fn element_address(
        &mut self,
        array: &ast::Expression,
        index: &ast::Expression,
    ) -> Result<Memory, IrError> {
        let array = self.lower_expression(array)?;
        let base = self.into_register(array)?;

        match self.lower_expression(index)? {
            Operand::Immediate(index) => Ok(Memory::base_offset(
                Register::Virtual(base),
                index.wrapping_mul(WORD_SIZE),
            )),
            index => {
                let index = self.into_register(index)?;

                Ok(Memory::indexed(
                    Register::Virtual(base),
                    Register::Virtual(index),
                    WORD_SIZE as u8,
                    0,
                ))
            }
        }
    }

    fn lower_expression(&mut self, expression: &ast::Expression) -> Result<Operand, IrError> {
        match expression {
            ast::Expression::Integer(value) => Ok(Operand::Immediate(*value)),
            ast::Expression::Boolean(value) => Ok(Operand::Immediate(*value as i64)),
            ast::Expression::Null => Ok(Operand::Immediate(0)),
            ast::Expression::String(value) => {
                let id = self.strings.intern(value);
                let destination = self.temporary();

                self.push(Instruction::Move {
                    destination: Storage::Virtual(destination),
                    source: Operand::Storage(Storage::StaticString(id)),
                })?;

                Ok(Operand::virtual_register(destination))
            }
            ast::Expression::Variable(variable) => {
                Ok(Operand::Storage(self.variable_storage(variable)?))
            }
            ast::Expression::Binary { operator, lhs, rhs } => {
                let lhs = self.lower_operand_before(lhs, &[&**rhs])?;
                let rhs = self.lower_expression(rhs)?;

                self.binary(*operator, lhs, rhs)
            }
            ast::Expression::Unary { operator, operand } => {
                let operand = self.lower_expression(operand)?;

                let operator = match operator {
                    ast::UnaryOperator::Positive => return Ok(operand),
                    ast::UnaryOperator::LogicalNot => {
                        return self.binary(BinaryOperator::BitwiseXor, operand, Operand::Immediate(1));
                    }
                    ast::UnaryOperator::Negate => UnaryOperator::Negate,
                    ast::UnaryOperator::BitwiseNot => UnaryOperator::BitwiseNot,
                };

                let destination = self.temporary();
                self.push(Instruction::UnaryOperation {
                    operator,
                    destination: Storage::Virtual(destination),
                    operand,
                })?;

                Ok(Operand::virtual_register(destination))
            }
            ast::Expression::Compare { operator, lhs, rhs } => {
                let lhs = self.lower_operand_before(lhs, &[&**rhs])?;
                let rhs = self.lower_expression(rhs)?;
                let destination = self.temporary();

                self.push(Instruction::Compare {
                    operator: *operator,
                    destination: Storage::Virtual(destination),
                    lhs,
                    rhs,
                })?;

                Ok(Operand::virtual_register(destination))
            }
            ast::Expression::Logical { operator, lhs, rhs } => {
                let result = self.function.create_register(None);
                let rhs_block = self.function.create_block("logical_rhs");
                let done = self.function.create_block("logical_done");

                let short_circuit = match operator {
                    LogicalOperator::And => 0,
                    LogicalOperator::Or => 1,
                };

                self.push(Instruction::Move {
                    destination: Storage::Virtual(result),
                    source: Operand::Immediate(short_circuit),
                })?;

                match operator {
                    LogicalOperator::And => self.lower_condition(lhs, rhs_block, done)?,
                    LogicalOperator::Or => self.lower_condition(lhs, done, rhs_block)?,
                }

                self.current = rhs_block;
                let rhs = self.lower_expression(rhs)?;
                self.push(Instruction::Move {
                    destination: Storage::Virtual(result),
                    source: rhs,
                })?;
                self.jump_to(done, done)?;

                Ok(Operand::virtual_register(result))
            }
            ast::Expression::Call { callee, arguments } => self.lower_call(callee, arguments),
            ast::Expression::Field { object, slot } => {
                let source = self.field_address(object, *slot)?;
                self.load(source)
            }
            ast::Expression::Index { array, index } => {
                let source = self.element_address(array, index)?;
                self.load(source)
            }
            ast::Expression::NewObject { fields } => {
                let destination = self.temporary();

                self.push(Instruction::HeapAlloc {
                    destination: Storage::Virtual(destination),
                    size: Operand::Immediate(*fields as i64 * WORD_SIZE),
                })?;

                Ok(Operand::virtual_register(destination))
            }
            ast::Expression::NewArray { length } => {
                let length = self.lower_expression(length)?;
                let bytes = self.binary(BinaryOperator::ShiftLeft, length, Operand::Immediate(3))?;
                let size = self.binary(BinaryOperator::Add, bytes, Operand::Immediate(WORD_SIZE))?;

                let raw = self.temporary();
                self.push(Instruction::HeapAlloc {
                    destination: Storage::Virtual(raw),
                    size,
                })?;
                self.push(Instruction::Store {
                    destination: Memory::base_offset(Register::Virtual(raw), 0),
                    source: length,
                })?;

                let array = self.temporary();
                self.push(Instruction::Lea {
                    destination: Storage::Virtual(array),
                    source: Memory::base_offset(Register::Virtual(raw), WORD_SIZE),
                })?;

                Ok(Operand::virtual_register(array))
            }
        }
    }

    /// Lowers an operand that is only read once `later` has been evaluated.
    /// A global is read into a register first when one of them can call a
    /// function, since that function may write it.
    fn lower_operand_before(
        &mut self,
        expression: &ast::Expression,
        later: &[&ast::Expression],
    ) -> Result<Operand, IrError> {
        let value = self.lower_expression(expression)?;

        if !matches!(value, Operand::Storage(Storage::Global(_)))
            || !later.iter().any(|e| contains_call(e))
        {
            return Ok(value);
        }

        let snapshot = self.temporary();
        self.push(Instruction::Move {
            destination: Storage::Virtual(snapshot),
            source: value,
        })?;

        Ok(Operand::virtual_register(snapshot))
    }

    fn binary(
        &mut self,
        operator: BinaryOperator,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Operand, IrError> {
        let destination = self.temporary();

        self.push(Instruction::BinaryOperation {
            operator,
            destination: Storage::Virtual(destination),
            lhs,
            rhs,
        })?;

        Ok(Operand::virtual_register(destination))
    }

    fn load(&mut self, source: Memory) -> Result<Operand, IrError> {
        let destination = self.temporary();

        self.push(Instruction::Load {
            destination: Storage::Virtual(destination),
            source,
        })?;

        Ok(Operand::virtual_register(destination))
    }

    fn lower_call(
        &mut self,
        callee: &ast::Callee,
        arguments: &[ast::Expression],
    ) -> Result<Operand, IrError> {
        let callee = match callee {
            ast::Callee::Function(name) => self
                .function_ids
                .get(name.as_str())
                .map(|id| Callee::Function(*id))
                .ok_or_else(|| IrError::UnknownFunction(name.clone()))?,
            ast::Callee::Runtime(runtime) => Callee::Runtime(*runtime),
        };

        // Nested calls clobber the argument registers, so everything is
        // evaluated before the first argument is placed
        let values = arguments
            .iter()
            .enumerate()
            .map(|(index, argument)| {
                let later = arguments[index + 1..].iter().collect::<Vec<_>>();
                self.lower_operand_before(argument, &later)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut locations = Vec::with_capacity(values.len());

        for (index, value) in values.into_iter().enumerate() {
            match PhysicalRegister::ARGUMENTS.get(index) {
                Some(register) => {
                    self.push(Instruction::Move {
                        destination: Storage::Physical(*register),
                        source: value,
                    })?;
                    locations.push(Storage::Physical(*register));
                }
                None => {
                    let slot = Memory::base_offset(
                        Register::Physical(PhysicalRegister::Rsp),
                        (index - PhysicalRegister::ARGUMENTS.len()) as i64 * WORD_SIZE,
                    );

                    self.push(Instruction::Store {
                        destination: slot,
                        source: value,
                    })?;
                    locations.push(Storage::Memory(slot));
                }
            }
        }

        self.function.argument_limit = self.function.argument_limit.max(arguments.len());

        self.push(Instruction::FunctionCall {
            callee,
            arguments: locations,
        })?;

        let result = self.temporary();
        self.push(Instruction::Move {
            destination: Storage::Virtual(result),
            source: Operand::physical(PhysicalRegister::RETURN),
        })?;

        Ok(Operand::virtual_register(result))
    }
}

/// Whether evaluating `expression` can run a user or runtime function
fn contains_call(expression: &ast::Expression) -> bool {
    match expression {
        ast::Expression::Call { .. } => true,
        ast::Expression::Binary { lhs, rhs, .. }
        | ast::Expression::Compare { lhs, rhs, .. }
        | ast::Expression::Logical { lhs, rhs, .. } => contains_call(lhs) || contains_call(rhs),
        ast::Expression::Unary { operand, .. } => contains_call(operand),
        ast::Expression::Field { object, .. } => contains_call(object),
        ast::Expression::Index { array, index } => contains_call(array) || contains_call(index),
        ast::Expression::NewArray { length } => contains_call(length),
        ast::Expression::Integer(_)
        | ast::Expression::Boolean(_)
        | ast::Expression::String(_)
        | ast::Expression::Null
        | ast::Expression::Variable(_)
        | ast::Expression::NewObject { .. } => false,
    }
}
