//! Runs the passes in order: build, resolve globals, simplify the control
//! flow graph, construct SSA, eliminate dead code, destruct SSA and emit.
//! Each step can be followed by a verification of the IR it produced.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    backend::{
        CodegenOptions,
        coloring::Coloring,
        targets::{CodeGenerator, Target},
    },
    error::IrError,
    frontend::ast::Program,
    index::IndexVec,
    middle::{
        lir::{
            FunctionId, Module,
            builder::build_module,
            pretty_print::pretty_print_module,
            verify::{VerifyLevel, verify_module},
        },
        optimization::{
            cfg_simplify::simplify_cfg,
            dce::eliminate_dead_code,
            for_each_function,
            ssa::{construct_ssa, destruct_ssa},
        },
        resolve::resolve_globals,
    },
};

/// Last step the pipeline runs
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// IR as built, with globals resolved and the CFG simplified
    Raw,
    /// IR in SSA form, after dead code elimination
    Ssa,
    /// IR after SSA destruction, ready for register allocation
    Ir,
    #[default]
    Asm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub stop_after: Stage,
    pub eliminate_dead_code: bool,
    /// Verify the IR after every step
    pub verify: bool,
    pub target: Target,
    pub codegen: CodegenOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            stop_after: Stage::default(),
            eliminate_dead_code: true,
            verify: true,
            target: Target::default(),
            codegen: CodegenOptions::default(),
        }
    }
}

fn check(module: &Module, options: &CompileOptions, level: VerifyLevel) -> Result<(), IrError> {
    if options.verify {
        verify_module(module, level)?;
    }

    Ok(())
}

/// Runs the middle of the pipeline up to `options.stop_after`, or all of it
/// when the stage is `Asm`
pub fn lower(program: &Program, options: &CompileOptions) -> Result<Module, IrError> {
    let mut module = build_module(program)?;
    check(&module, options, VerifyLevel::Structure)?;

    resolve_globals(&mut module)?;
    for_each_function(&mut module, simplify_cfg)?;
    check(&module, options, VerifyLevel::Simplified)?;

    if options.stop_after == Stage::Raw {
        return Ok(module);
    }

    for_each_function(&mut module, construct_ssa)?;
    check(&module, options, VerifyLevel::Ssa)?;

    if options.eliminate_dead_code {
        for_each_function(&mut module, eliminate_dead_code)?;
        check(&module, options, VerifyLevel::Ssa)?;
    }

    if options.stop_after == Stage::Ssa {
        return Ok(module);
    }

    for_each_function(&mut module, destruct_ssa)?;
    check(&module, options, VerifyLevel::Destructed)?;

    debug!(functions = module.functions.len(), "lowered program");

    Ok(module)
}

/// Lines a per-name coloring map up with the module's functions
pub fn colorings_for(
    module: &Module,
    colorings: &BTreeMap<String, Coloring>,
) -> IndexVec<FunctionId, Coloring> {
    module
        .functions
        .iter()
        .map(|f| colorings.get(f.name.value()).cloned().unwrap_or_default())
        .collect()
}

/// Compiles a checked program. Stages before `Asm` produce the pretty
/// printed IR instead of assembly.
pub fn compile(
    program: &Program,
    colorings: &BTreeMap<String, Coloring>,
    options: &CompileOptions,
) -> Result<String, IrError> {
    let module = lower(program, options)?;

    if options.stop_after < Stage::Asm {
        return Ok(pretty_print_module(&module));
    }

    options.target.get_code_generator().translate_to_asm(
        &module,
        &colorings_for(&module, colorings),
        &options.codegen,
    )
}
