//! LIR (Low-level Intermediate Representation). In this form, loops and
//! conditionals are simplified to blocks and edges, expression trees are
//! flattened into ordered operations on virtual registers, and every value is
//! a single machine word.
//!
//! Blocks and instructions live in per-function arenas and are addressed by
//! typed indices. Removing something leaves a tombstone behind so that ids
//! held by a pass stay meaningful for the rest of that pass.

use serde::{Deserialize, Serialize};

use crate::{
    frontend::intern::InternedSymbol,
    index::{IndexVec, simple_index},
};

pub mod builder;
pub mod graph;
pub mod interpreter;
pub mod operand;
pub mod pretty_print;
pub mod verify;

pub use operand::{DataSymbol, Memory, Operand, PhysicalRegister, Register, Storage};

simple_index! {
    /// Identifies a function within a module
    pub struct FunctionId;
}

simple_index! {
    /// Identifies a program-level variable within a module
    pub struct GlobalId;
}

simple_index! {
    /// Identifies a deduplicated string constant within a module
    pub struct StaticStringId;
}

simple_index! {
    /// Identifies an LIR block within its function
    pub struct BlockId;
}

simple_index! {
    /// Identifies an instruction within its function
    pub struct InstructionId;
}

simple_index! {
    /// Identifies a virtual LIR register which holds a temporary value
    pub struct RegisterId;
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: IndexVec<FunctionId, Function>,
    pub globals: IndexVec<GlobalId, GlobalVariable>,
    pub static_strings: IndexVec<StaticStringId, StaticString>,
    /// Function the program starts executing in
    pub entry: Option<FunctionId>,
}

impl Module {
    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .enumerate()
            .find(|(_, f)| f.name.value() == name)
            .map(|(id, _)| id)
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .enumerate()
            .find(|(_, g)| g.name.value() == name)
            .map(|(id, _)| id)
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: InternedSymbol,
    /// Assembly label, assigned by the global resolver
    pub label: Option<InternedSymbol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticString {
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: InternedSymbol,
    pub parameter_count: usize,
    pub registers: IndexVec<RegisterId, VirtualRegister>,
    pub blocks: IndexVec<BlockId, Block>,
    pub instructions: IndexVec<InstructionId, InstructionNode>,
    pub entry: BlockId,
    /// The single block holding the return. `None` once it has been removed
    /// because the function can never return.
    pub exit: Option<BlockId>,
    /// Stack words reserved below the frame pointer before any spill slots
    pub temporary_count: usize,
    /// Largest argument count of any call this function performs
    pub argument_limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualRegister {
    /// Source-level name the register was created for, if any
    pub hint: Option<InternedSymbol>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// Label hint, made unique by the emitter
    pub name: InternedSymbol,
    pub first: Option<InstructionId>,
    pub last: Option<InstructionId>,
    /// Incoming edges, one entry per edge. Phi sources line up with this list.
    pub predecessors: Vec<BlockId>,
    /// Outgoing edges in terminator order, one entry per edge
    pub successors: Vec<BlockId>,
    /// Position in the reverse postorder computed by `number_blocks`
    pub rpo_index: Option<usize>,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct InstructionNode {
    pub kind: Instruction,
    pub block: BlockId,
    pub previous: Option<InstructionId>,
    pub next: Option<InstructionId>,
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    ShiftLeft,
    ShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    Negate,
    BitwiseNot,
    /// Boolean negation. Has no machine encoding.
    LogicalNot,
    /// Unary plus. Has no machine encoding.
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOperator {
    /// The operator which holds exactly when `self` does not
    pub fn inverse(self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::Less => Self::GreaterEqual,
            Self::LessEqual => Self::Greater,
            Self::Greater => Self::LessEqual,
            Self::GreaterEqual => Self::Less,
        }
    }

    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
            Self::Less => lhs < rhs,
            Self::LessEqual => lhs <= rhs,
            Self::Greater => lhs > rhs,
            Self::GreaterEqual => lhs >= rhs,
        }
    }
}

/// Functions provided by the C runtime the generated code links against
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFunction {
    Printf,
    Scanf,
    Puts,
    Gets,
    Sprintf,
    Sscanf,
    Getchar,
    Strlen,
    Strcmp,
    Strcpy,
    Strncpy,
    Malloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Function(FunctionId),
    Runtime(RuntimeFunction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhiSource {
    pub block: BlockId,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Allocates `size` bytes on the heap and writes the address to
    /// `destination`
    HeapAlloc {
        destination: Storage,
        size: Operand,
    },
    BinaryOperation {
        operator: BinaryOperator,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    },
    /// Conditional transfer. `condition` is the result of a `Compare` using
    /// `operator`, which the emitter uses to pick the conditional jump.
    Branch {
        operator: CompareOperator,
        condition: Storage,
        positive: BlockId,
        negative: BlockId,
    },
    /// Control transfer to another function. The arguments have already
    /// been placed in `arguments`, the result comes back in `rax`.
    FunctionCall {
        callee: Callee,
        arguments: Vec<Storage>,
    },
    /// Writes 1 to `destination` if `lhs <operator> rhs` holds, 0 otherwise
    Compare {
        operator: CompareOperator,
        destination: Storage,
        lhs: Operand,
        rhs: Operand,
    },
    Jump {
        destination: BlockId,
    },
    Load {
        destination: Storage,
        source: Memory,
    },
    Move {
        destination: Storage,
        source: Operand,
    },
    Return {
        value: Option<Operand>,
    },
    Store {
        destination: Memory,
        source: Operand,
    },
    UnaryOperation {
        operator: UnaryOperator,
        destination: Storage,
        operand: Operand,
    },
    /// `sources[i]` is the value flowing in from `predecessors[i]` of the
    /// owning block
    Phi {
        destination: Storage,
        sources: Vec<PhiSource>,
    },
    /// Writes the effective address of `source` to `destination`
    Lea {
        destination: Storage,
        source: Memory,
    },
    Push {
        source: Operand,
    },
    Pop {
        destination: Storage,
    },
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. } | Self::Jump { .. } | Self::Return { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Blocks this instruction can transfer control to, in edge order
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Self::Branch {
                positive, negative, ..
            } => vec![*positive, *negative],
            Self::Jump { destination } => vec![*destination],
            _ => Vec::new(),
        }
    }

    pub fn targets_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            Self::Branch {
                positive, negative, ..
            } => vec![positive, negative],
            Self::Jump { destination } => vec![destination],
            _ => Vec::new(),
        }
    }

    /// The location written by this instruction, if any
    pub fn destination(&self) -> Option<Storage> {
        match self {
            Self::HeapAlloc { destination, .. }
            | Self::BinaryOperation { destination, .. }
            | Self::Compare { destination, .. }
            | Self::Load { destination, .. }
            | Self::Move { destination, .. }
            | Self::UnaryOperation { destination, .. }
            | Self::Phi { destination, .. }
            | Self::Lea { destination, .. }
            | Self::Pop { destination } => Some(*destination),
            Self::Store { destination, .. } => Some(Storage::Memory(*destination)),
            Self::Branch { .. }
            | Self::FunctionCall { .. }
            | Self::Jump { .. }
            | Self::Return { .. }
            | Self::Push { .. } => None,
        }
    }

    pub fn destination_mut(&mut self) -> Option<&mut Storage> {
        match self {
            Self::HeapAlloc { destination, .. }
            | Self::BinaryOperation { destination, .. }
            | Self::Compare { destination, .. }
            | Self::Load { destination, .. }
            | Self::Move { destination, .. }
            | Self::UnaryOperation { destination, .. }
            | Self::Phi { destination, .. }
            | Self::Lea { destination, .. }
            | Self::Pop { destination } => Some(destination),
            _ => None,
        }
    }

    /// The virtual register defined by this instruction, if any
    pub fn defined_register(&self) -> Option<RegisterId> {
        self.destination().and_then(|d| d.as_virtual())
    }

    /// Calls `f` with every virtual register this instruction reads, not
    /// counting phi sources (they are read on the incoming edge, not in the
    /// block).
    pub fn visit_register_uses_mut(&mut self, f: &mut impl FnMut(&mut RegisterId)) {
        fn operand(op: &mut Operand, f: &mut impl FnMut(&mut RegisterId)) {
            if let Operand::Storage(storage) = op {
                read(storage, f);
            }
        }

        fn read(storage: &mut Storage, f: &mut impl FnMut(&mut RegisterId)) {
            match storage {
                Storage::Virtual(register) => f(register),
                Storage::Memory(memory) => address(memory, f),
                _ => {}
            }
        }

        fn address(memory: &mut Memory, f: &mut impl FnMut(&mut RegisterId)) {
            for register in memory.registers_mut() {
                if let Register::Virtual(id) = register {
                    f(id);
                }
            }
        }

        fn write(storage: &mut Storage, f: &mut impl FnMut(&mut RegisterId)) {
            if let Storage::Memory(memory) = storage {
                address(memory, f);
            }
        }

        match self {
            Self::HeapAlloc { destination, size } => {
                write(destination, f);
                operand(size, f);
            }
            Self::BinaryOperation {
                destination,
                lhs,
                rhs,
                ..
            }
            | Self::Compare {
                destination,
                lhs,
                rhs,
                ..
            } => {
                write(destination, f);
                operand(lhs, f);
                operand(rhs, f);
            }
            Self::Branch { condition, .. } => read(condition, f),
            Self::FunctionCall { arguments, .. } => {
                for argument in arguments {
                    read(argument, f);
                }
            }
            Self::Jump { .. } | Self::Phi { .. } => {}
            Self::Load {
                destination,
                source,
            }
            | Self::Lea {
                destination,
                source,
            } => {
                write(destination, f);
                address(source, f);
            }
            Self::Move {
                destination,
                source,
            } => {
                write(destination, f);
                operand(source, f);
            }
            Self::Return { value } => {
                if let Some(value) = value {
                    operand(value, f);
                }
            }
            Self::Store {
                destination,
                source,
            } => {
                address(destination, f);
                operand(source, f);
            }
            Self::UnaryOperation {
                destination,
                operand: value,
                ..
            } => {
                write(destination, f);
                operand(value, f);
            }
            Self::Push { source } => operand(source, f),
            Self::Pop { destination } => write(destination, f),
        }
    }

    /// Every virtual register read by this instruction, phi sources included
    pub fn used_registers(&self) -> Vec<RegisterId> {
        let mut registers = Vec::new();
        let mut copy = self.clone();

        copy.visit_register_uses_mut(&mut |r| registers.push(*r));

        if let Self::Phi { sources, .. } = self {
            registers.extend(sources.iter().filter_map(|s| s.value.as_virtual()));
        }

        registers
    }

    /// Whether the instruction touches global state, so it has to stay even
    /// when nothing reads its result
    pub fn has_side_effects(&self) -> bool {
        match self {
            Self::HeapAlloc { .. }
            | Self::Branch { .. }
            | Self::FunctionCall { .. }
            | Self::Jump { .. }
            | Self::Return { .. }
            | Self::Store { .. }
            | Self::Push { .. }
            | Self::Pop { .. } => true,
            _ => self
                .destination()
                .is_some_and(|d| !matches!(d, Storage::Virtual(_))),
        }
    }

    /// Calls `f` with every storage operand of this instruction: written
    /// locations, read locations, call arguments and phi sources. Memory
    /// operands which can only ever be memory (`Load` sources and `Store`
    /// destinations) are not visited.
    pub fn visit_storages_mut(&mut self, f: &mut impl FnMut(&mut Storage)) {
        fn operand(op: &mut Operand, f: &mut impl FnMut(&mut Storage)) {
            if let Operand::Storage(storage) = op {
                f(storage);
            }
        }

        match self {
            Self::HeapAlloc { destination, size } => {
                f(destination);
                operand(size, f);
            }
            Self::BinaryOperation {
                destination,
                lhs,
                rhs,
                ..
            }
            | Self::Compare {
                destination,
                lhs,
                rhs,
                ..
            } => {
                f(destination);
                operand(lhs, f);
                operand(rhs, f);
            }
            Self::Branch { condition, .. } => f(condition),
            Self::FunctionCall { arguments, .. } => arguments.iter_mut().for_each(f),
            Self::Load { destination, .. }
            | Self::Lea { destination, .. }
            | Self::Pop { destination } => f(destination),
            Self::Move {
                destination,
                source,
            } => {
                f(destination);
                operand(source, f);
            }
            Self::Return { value } => {
                if let Some(value) = value {
                    operand(value, f);
                }
            }
            Self::Store { source, .. } | Self::Push { source } => operand(source, f),
            Self::UnaryOperation {
                destination,
                operand: value,
                ..
            } => {
                f(destination);
                operand(value, f);
            }
            Self::Phi {
                destination,
                sources,
            } => {
                f(destination);
                for source in sources {
                    operand(&mut source.value, f);
                }
            }
            Self::Jump { .. } => {}
        }
    }

    /// Whether an abstract `Storage::Global` reference is still mentioned
    pub fn references_global(&self) -> bool {
        let mut found = false;

        self.clone().visit_storages_mut(&mut |storage| {
            found |= matches!(storage, Storage::Global(_));
        });

        found
    }
}
