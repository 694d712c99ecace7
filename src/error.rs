use thiserror::Error;

use crate::middle::lir::{BlockId, InstructionId, RegisterId, UnaryOperator};

/// Internal invariant violations detected while building, transforming or
/// emitting IR. None of these are recoverable: the pipeline stops at the
/// first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// An instruction was appended to a block that already ends in a
    /// terminator
    #[error("block {block:?} of `{function}` is already terminated")]
    InstructionAfterTerminator { function: String, block: BlockId },

    #[error("`{function}` has no exit block")]
    MissingExit { function: String },

    #[error("block {block:?} of `{function}` has no terminator")]
    MissingTerminator { function: String, block: BlockId },

    #[error("terminator in block {block:?} of `{function}` is not the last instruction")]
    MisplacedTerminator { function: String, block: BlockId },

    /// Terminators own the outgoing edges of a block and can only be swapped
    /// through `replace_instruction`
    #[error("instruction {instruction:?} of `{function}` is a terminator and cannot be removed")]
    RemoveTerminator {
        function: String,
        instruction: InstructionId,
    },

    #[error("instruction {instruction:?} of `{function}` was already removed")]
    StaleInstruction {
        function: String,
        instruction: InstructionId,
    },

    #[error("block {block:?} of `{function}` was already removed")]
    StaleBlock { function: String, block: BlockId },

    #[error("no edge {from:?} -> {to:?} in `{function}`")]
    MissingEdge {
        function: String,
        from: BlockId,
        to: BlockId,
    },

    #[error("cannot splice {from:?} into {into:?} in `{function}`: not a straight-line pair")]
    InvalidSplice {
        function: String,
        into: BlockId,
        from: BlockId,
    },

    #[error("edge lists of `{function}` disagree with the terminator of {block:?}")]
    InconsistentEdges { function: String, block: BlockId },

    #[error("phi in {block:?} of `{function}` does not match the predecessor list")]
    PhiMismatch { function: String, block: BlockId },

    #[error("phi in {block:?} of `{function}` follows a non-phi instruction")]
    MisplacedPhi { function: String, block: BlockId },

    #[error("register {register:?} of `{function}` is defined more than once")]
    MultipleDefinitions {
        function: String,
        register: RegisterId,
    },

    #[error("use of {register:?} in {block:?} of `{function}` is not dominated by its definition")]
    UndominatedUse {
        function: String,
        register: RegisterId,
        block: BlockId,
    },

    #[error("block {block:?} of `{function}` is unreachable from the entry")]
    UnreachableBlock { function: String, block: BlockId },

    #[error("phi survived SSA destruction in {block:?} of `{function}`")]
    PhiAfterDestruction { function: String, block: BlockId },

    #[error("operator `{0}` has no machine encoding and must be lowered before emission")]
    UnloweredOperator(UnaryOperator),

    #[error("abstract global reference reached `{function}` after global resolution")]
    UnresolvedGlobal { function: String },

    #[error("register {register:?} of `{function}` addresses memory but is not colored to a machine register")]
    SpilledAddressRegister {
        function: String,
        register: RegisterId,
    },

    #[error("invalid operand for `{mnemonic}` in `{function}`")]
    InvalidOperand {
        function: String,
        mnemonic: &'static str,
    },

    #[error("function `{0}` is defined more than once")]
    DuplicateFunction(String),

    #[error("global `{0}` is defined more than once")]
    DuplicateGlobal(String),

    #[error("reference to unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("call to unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`{0}` outside of a loop")]
    OutsideLoop(&'static str),
}
