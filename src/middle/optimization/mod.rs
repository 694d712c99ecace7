//! Passes over LIR. They run in a fixed order, each on one function at a
//! time: control flow simplification, SSA construction, dead code
//! elimination and SSA destruction.

pub mod cfg_simplify;
pub mod dce;
pub mod dominators;
pub mod ssa;

use crate::{error::IrError, middle::lir::Module};

/// Runs `pass` over every function of the module
pub fn for_each_function<T>(
    module: &mut Module,
    mut pass: impl FnMut(&mut crate::middle::lir::Function) -> Result<T, IrError>,
) -> Result<(), IrError> {
    for function in module.functions.iter_mut() {
        pass(function)?;
    }

    Ok(())
}
