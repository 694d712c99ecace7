//! Structural and SSA checks run between passes. Each check returns the
//! first violation found as an `IrError`.

use hashbrown::HashMap;

use crate::{
    error::IrError,
    middle::{
        lir::{BlockId, Function, Instruction, InstructionId, Module, RegisterId},
        optimization::dominators::DominatorTree,
    },
};

/// How much of the pipeline's guarantees a function is expected to satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// Terminators, edges and phi alignment are consistent
    Structure,
    /// Additionally every live block is reachable from the entry
    Simplified,
    /// Additionally every virtual register has one definition which
    /// dominates all of its uses
    Ssa,
    /// Structure and reachability hold and no phi is left
    Destructed,
}

pub fn verify_module(module: &Module, level: VerifyLevel) -> Result<(), IrError> {
    for function in module.functions.iter() {
        verify_function(function, level)?;
    }

    Ok(())
}

pub fn verify_function(function: &Function, level: VerifyLevel) -> Result<(), IrError> {
    check_structure(function)?;

    if level >= VerifyLevel::Simplified {
        check_reachability(function)?;
    }

    match level {
        VerifyLevel::Ssa => check_ssa(function),
        VerifyLevel::Destructed => check_no_phis(function),
        _ => Ok(()),
    }
}

fn name(function: &Function) -> String {
    function.name.value().to_owned()
}

fn check_structure(function: &Function) -> Result<(), IrError> {
    for block in function.live_blocks() {
        let info = function.block(block);
        let mut previous = None;
        let mut seen_non_phi = false;

        for (id, instruction) in function.instructions_in(block) {
            let node = &function.instructions[id];

            if node.block != block || node.previous != previous || node.removed {
                return Err(IrError::InconsistentEdges {
                    function: name(function),
                    block,
                });
            }

            if instruction.is_terminator() && node.next.is_some() {
                return Err(IrError::MisplacedTerminator {
                    function: name(function),
                    block,
                });
            }

            if instruction.is_phi() && seen_non_phi {
                return Err(IrError::MisplacedPhi {
                    function: name(function),
                    block,
                });
            }

            seen_non_phi |= !instruction.is_phi();
            previous = Some(id);
        }

        if info.last != previous {
            return Err(IrError::InconsistentEdges {
                function: name(function),
                block,
            });
        }

        let terminator = function
            .terminator(block)
            .ok_or_else(|| IrError::MissingTerminator {
                function: name(function),
                block,
            })?;

        if function.instruction(terminator).targets() != info.successors {
            return Err(IrError::InconsistentEdges {
                function: name(function),
                block,
            });
        }

        for successor in &info.successors {
            let outgoing = info.successors.iter().filter(|s| *s == successor).count();
            let incoming = function
                .predecessors(*successor)
                .iter()
                .filter(|p| **p == block)
                .count();

            if outgoing != incoming || function.block(*successor).removed {
                return Err(IrError::InconsistentEdges {
                    function: name(function),
                    block,
                });
            }
        }

        for predecessor in &info.predecessors {
            if function.block(*predecessor).removed
                || !function.successors(*predecessor).contains(&block)
            {
                return Err(IrError::InconsistentEdges {
                    function: name(function),
                    block,
                });
            }
        }

        for phi in function.phis(block) {
            let Instruction::Phi { sources, .. } = function.instruction(phi) else {
                continue;
            };

            let aligned = sources.len() == info.predecessors.len()
                && sources
                    .iter()
                    .zip(&info.predecessors)
                    .all(|(s, p)| s.block == *p);

            if !aligned {
                return Err(IrError::PhiMismatch {
                    function: name(function),
                    block,
                });
            }
        }
    }

    Ok(())
}

fn check_reachability(function: &Function) -> Result<(), IrError> {
    let reachable = function.reachable_blocks();

    match function
        .live_blocks()
        .into_iter()
        .find(|b| !reachable.contains(b))
    {
        Some(block) => Err(IrError::UnreachableBlock {
            function: name(function),
            block,
        }),
        None => Ok(()),
    }
}

fn check_no_phis(function: &Function) -> Result<(), IrError> {
    for block in function.live_blocks() {
        if !function.phis(block).is_empty() {
            return Err(IrError::PhiAfterDestruction {
                function: name(function),
                block,
            });
        }
    }

    Ok(())
}

fn check_ssa(function: &Function) -> Result<(), IrError> {
    let mut definitions: HashMap<RegisterId, InstructionId> = HashMap::new();

    for id in function.all_instructions() {
        if let Some(register) = function.instruction(id).defined_register()
            && definitions.insert(register, id).is_some()
        {
            return Err(IrError::MultipleDefinitions {
                function: name(function),
                register,
            });
        }
    }

    let tree = DominatorTree::compute(function);

    // Whether the definition of `register` is available at the end of
    // `block` (`at_end`) or right before instruction `user`
    let available = |register: RegisterId, block: BlockId, user: Option<InstructionId>| {
        let Some(definition) = definitions.get(&register) else {
            // Values flowing in from outside the function (none today) or
            // undefined upstream; either way there is nothing to dominate
            return true;
        };

        let definition_block = function.instructions[*definition].block;

        if definition_block != block {
            return tree.dominates(definition_block, block);
        }

        match user {
            None => true,
            Some(user) => function
                .instructions_in(block)
                .map(|(id, _)| id)
                .take_while(|id| *id != user)
                .any(|id| id == *definition),
        }
    };

    for block in function.live_blocks() {
        for (id, instruction) in function.instructions_in(block) {
            if let Instruction::Phi { sources, .. } = instruction {
                for source in sources {
                    if let Some(register) = source.value.as_virtual()
                        && !available(register, source.block, None)
                    {
                        return Err(IrError::UndominatedUse {
                            function: name(function),
                            register,
                            block,
                        });
                    }
                }

                continue;
            }

            for register in instruction.used_registers() {
                if !available(register, block, Some(id)) {
                    return Err(IrError::UndominatedUse {
                        function: name(function),
                        register,
                        block,
                    });
                }
            }
        }
    }

    Ok(())
}
