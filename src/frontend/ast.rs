//! The checked program handed over by semantic analysis. Names are already
//! resolved: every variable reference says where the variable lives, and
//! every call says whether it targets a user function or the runtime. All
//! values lower to a single machine word, so no further type information is
//! carried.

use serde::{Deserialize, Serialize};

pub use crate::middle::lir::{BinaryOperator, CompareOperator, RuntimeFunction};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub globals: Vec<GlobalDeclaration>,
    #[serde(default)]
    pub functions: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDeclaration {
    pub name: String,
    #[serde(default)]
    pub initializer: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    /// Parameter names, in order. Methods receive the object as parameter 0.
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub returns_value: bool,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Global,
    /// Index into the enclosing function's parameter list
    Parameter(u32),
    /// Function-unique id of a local variable
    Local(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub storage: StorageClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Declare {
        variable: Variable,
        #[serde(default)]
        initializer: Option<Expression>,
    },
    Assign {
        target: Place,
        value: Expression,
    },
    Expression(Expression),
    If {
        condition: Expression,
        then_branch: Vec<Statement>,
        #[serde(default)]
        else_branch: Vec<Statement>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    For {
        #[serde(default)]
        initializer: Vec<Statement>,
        #[serde(default)]
        condition: Option<Expression>,
        #[serde(default)]
        step: Vec<Statement>,
        body: Vec<Statement>,
    },
    Return(Option<Expression>),
    Break,
    Continue,
    Block(Vec<Statement>),
}

/// Something that can be assigned to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
    Variable(Variable),
    /// Word `slot` of the object `object` points to
    Field {
        object: Box<Expression>,
        slot: u32,
    },
    Index {
        array: Box<Expression>,
        index: Box<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    Negate,
    BitwiseNot,
    LogicalNot,
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Function(String),
    Runtime(RuntimeFunction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Integer(i64),
    Boolean(bool),
    String(String),
    Null,
    Variable(Variable),
    Binary {
        operator: BinaryOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    Compare {
        operator: CompareOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// Short-circuiting `&&` / `||`
    Logical {
        operator: LogicalOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        arguments: Vec<Expression>,
    },
    Field {
        object: Box<Expression>,
        slot: u32,
    },
    Index {
        array: Box<Expression>,
        index: Box<Expression>,
    },
    /// Allocates an object with `fields` word-sized slots
    NewObject {
        fields: u32,
    },
    /// Allocates an array, storing its length in the word before element 0
    NewArray {
        length: Box<Expression>,
    },
}

impl Variable {
    pub fn local(name: &str, id: u32) -> Self {
        Self {
            name: name.to_owned(),
            storage: StorageClass::Local(id),
        }
    }

    pub fn parameter(name: &str, index: u32) -> Self {
        Self {
            name: name.to_owned(),
            storage: StorageClass::Parameter(index),
        }
    }

    pub fn global(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            storage: StorageClass::Global,
        }
    }
}

impl Expression {
    pub fn binary(operator: BinaryOperator, lhs: Expression, rhs: Expression) -> Self {
        Self::Binary {
            operator,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn compare(operator: CompareOperator, lhs: Expression, rhs: Expression) -> Self {
        Self::Compare {
            operator,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(name: &str, arguments: Vec<Expression>) -> Self {
        Self::Call {
            callee: Callee::Function(name.to_owned()),
            arguments,
        }
    }

    pub fn runtime(function: RuntimeFunction, arguments: Vec<Expression>) -> Self {
        Self::Call {
            callee: Callee::Runtime(function),
            arguments,
        }
    }
}

impl Statement {
    pub fn assign(variable: Variable, value: Expression) -> Self {
        Self::Assign {
            target: Place::Variable(variable),
            value,
        }
    }
}
