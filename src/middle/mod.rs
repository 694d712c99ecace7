//! The middle of the compiler works on LIR: it is built from the checked
//! AST, has its global references resolved and is then optimized in and out
//! of SSA form before the backend emits it.

pub mod lir;
pub mod optimization;
pub mod resolve;
