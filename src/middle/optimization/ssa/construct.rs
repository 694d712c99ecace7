//! SSA construction: phis are placed at the iterated dominance frontier of
//! every register's definitions, then a walk over the dominator tree gives
//! each definition its own register.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::{
    error::IrError,
    middle::{
        lir::{BlockId, Function, Instruction, InstructionId, Operand, PhiSource, RegisterId, Storage},
        optimization::dominators::DominatorTree,
    },
};

pub fn construct_ssa(function: &mut Function) -> Result<(), IrError> {
    let tree = DominatorTree::compute(function);
    let frontiers = tree.dominance_frontiers(function);

    let mut definition_blocks: BTreeMap<RegisterId, BTreeSet<BlockId>> = BTreeMap::new();
    let mut definition_counts: HashMap<RegisterId, usize> = HashMap::new();

    for block in tree.reverse_postorder() {
        for (_, instruction) in function.instructions_in(*block) {
            if let Some(register) = instruction.defined_register() {
                definition_blocks.entry(register).or_default().insert(*block);
                *definition_counts.entry(register).or_default() += 1;
            }
        }
    }

    // Registers defined exactly once are already in SSA form
    let versioned = definition_counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(register, _)| *register)
        .collect::<HashSet<_>>();

    let mut phi_origins = HashMap::new();

    for (register, blocks) in &definition_blocks {
        if !versioned.contains(register) {
            continue;
        }

        for block in DominatorTree::iterated_frontier(&frontiers, blocks.iter().copied()) {
            let sources = function
                .predecessors(block)
                .iter()
                .map(|predecessor| PhiSource {
                    block: *predecessor,
                    value: Operand::virtual_register(*register),
                })
                .collect();

            let phi = function.insert_phi(block, Storage::Virtual(*register), sources)?;
            phi_origins.insert(phi, *register);
        }
    }

    let renamed = rename(function, &tree, &versioned, &phi_origins);

    debug!(
        function = %function.name,
        phis = phi_origins.len(),
        versioned = versioned.len(),
        renamed,
        "constructed SSA form"
    );

    Ok(())
}

enum Visit {
    Enter(BlockId),
    /// Leaving a block pops the definitions it pushed
    Exit(Vec<RegisterId>),
}

/// Walks the dominator tree in preorder, keeping a stack of the current
/// version of every versioned register. Returns how many definitions got a
/// new register.
fn rename(
    function: &mut Function,
    tree: &DominatorTree,
    versioned: &HashSet<RegisterId>,
    phi_origins: &HashMap<InstructionId, RegisterId>,
) -> usize {
    let mut stacks: HashMap<RegisterId, Vec<RegisterId>> = HashMap::new();
    let mut visits = vec![Visit::Enter(tree.entry())];
    let mut renamed = 0;

    while let Some(visit) = visits.pop() {
        let block = match visit {
            Visit::Enter(block) => block,
            Visit::Exit(pushed) => {
                for original in pushed {
                    if let Some(stack) = stacks.get_mut(&original) {
                        stack.pop();
                    }
                }
                continue;
            }
        };

        let mut pushed = Vec::new();

        for id in function.instruction_ids(block) {
            let origin = phi_origins.get(&id).copied();

            if origin.is_none() {
                function.instruction_mut(id).visit_register_uses_mut(&mut |register| {
                    if let Some(current) = stacks.get(register).and_then(|s| s.last()) {
                        *register = *current;
                    }
                });
            }

            let original = match origin {
                Some(original) => original,
                None => match function.instruction(id).defined_register() {
                    Some(register) if versioned.contains(&register) => register,
                    _ => continue,
                },
            };

            let version = function.create_version_of(original);
            if let Some(destination) = function.instruction_mut(id).destination_mut() {
                *destination = Storage::Virtual(version);
            }

            stacks.entry(original).or_default().push(version);
            pushed.push(original);
            renamed += 1;
        }

        // Fill in the phi sources this block provides to its successors
        let mut successors = function.successors(block).to_vec();
        successors.dedup();

        for successor in successors {
            for phi in function.phis(successor) {
                let Some(original) = phi_origins.get(&phi) else {
                    continue;
                };

                let value = stacks
                    .get(original)
                    .and_then(|s| s.last())
                    .map(|current| Operand::virtual_register(*current))
                    .unwrap_or(Operand::Immediate(0));

                if let Instruction::Phi { sources, .. } = function.instruction_mut(phi) {
                    for source in sources.iter_mut().filter(|s| s.block == block) {
                        source.value = value;
                    }
                }
            }
        }

        visits.push(Visit::Exit(pushed));
        visits.extend(tree.children(block).iter().rev().map(|child| Visit::Enter(*child)));
    }

    renamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        lir::{
            BinaryOperator, CompareOperator,
            verify::{VerifyLevel, verify_function},
        },
        optimization::cfg_simplify::simplify_cfg,
    };

    fn set(function: &mut Function, block: BlockId, register: RegisterId, source: Operand) {
        function
            .push_instruction(
                block,
                Instruction::Move {
                    destination: Storage::Virtual(register),
                    source,
                },
            )
            .unwrap();
    }

    fn phis(function: &Function) -> Vec<Vec<PhiSource>> {
        function
            .all_instructions()
            .into_iter()
            .filter_map(|id| match function.instruction(id) {
                Instruction::Phi { sources, .. } => Some(sources.clone()),
                _ => None,
            })
            .collect()
    }

    /// x = 0; if (c) { x = 1 } return x
    #[test]
    fn diamond_gets_one_phi() {
        let mut function = Function::new("choose", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let then = function.create_block("then");
        let merge = function.create_block("merge");
        let x = function.create_register(None);
        let condition = function.create_register(None);

        set(&mut function, entry, x, Operand::Immediate(0));
        function
            .push_instruction(
                entry,
                Instruction::Branch {
                    operator: CompareOperator::NotEqual,
                    condition: Storage::Virtual(condition),
                    positive: then,
                    negative: merge,
                },
            )
            .unwrap();
        set(&mut function, then, x, Operand::Immediate(1));
        function
            .push_instruction(then, Instruction::Jump { destination: merge })
            .unwrap();
        function
            .push_instruction(merge, Instruction::Jump { destination: exit })
            .unwrap();
        function
            .push_instruction(
                exit,
                Instruction::Return {
                    value: Some(Operand::virtual_register(x)),
                },
            )
            .unwrap();

        simplify_cfg(&mut function).unwrap();
        construct_ssa(&mut function).unwrap();

        let phis = phis(&function);
        assert_eq!(phis.len(), 1);
        assert_eq!(phis[0].len(), 2);
        assert!(phis[0].iter().all(|s| s.value.as_virtual().is_some()));
        verify_function(&function, VerifyLevel::Ssa).unwrap();
    }

    /// i = 0; while (i < 10) { i = i + 1 } return i
    #[test]
    fn loop_counter_is_versioned() {
        let mut function = Function::new("count", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let header = function.create_block("header");
        let body = function.create_block("body");
        let i = function.create_register(None);
        let condition = function.create_register(None);

        set(&mut function, entry, i, Operand::Immediate(0));
        function
            .push_instruction(entry, Instruction::Jump { destination: header })
            .unwrap();
        function
            .push_instruction(
                header,
                Instruction::Compare {
                    operator: CompareOperator::Less,
                    destination: Storage::Virtual(condition),
                    lhs: Operand::virtual_register(i),
                    rhs: Operand::Immediate(10),
                },
            )
            .unwrap();
        function
            .push_instruction(
                header,
                Instruction::Branch {
                    operator: CompareOperator::Less,
                    condition: Storage::Virtual(condition),
                    positive: body,
                    negative: exit,
                },
            )
            .unwrap();
        function
            .push_instruction(
                body,
                Instruction::BinaryOperation {
                    operator: BinaryOperator::Add,
                    destination: Storage::Virtual(i),
                    lhs: Operand::virtual_register(i),
                    rhs: Operand::Immediate(1),
                },
            )
            .unwrap();
        function
            .push_instruction(body, Instruction::Jump { destination: header })
            .unwrap();
        function
            .push_instruction(
                exit,
                Instruction::Return {
                    value: Some(Operand::virtual_register(i)),
                },
            )
            .unwrap();

        construct_ssa(&mut function).unwrap();

        let phis = phis(&function);
        assert_eq!(phis.len(), 1);
        assert_eq!(function.phis(header).len(), 1);
        verify_function(&function, VerifyLevel::Ssa).unwrap();
    }

    /// A register assigned on only one side of a diamond has no reaching
    /// definition along the other side
    #[test]
    fn missing_definitions_become_zero() {
        let mut function = Function::new("partial", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let left = function.create_block("left");
        let right = function.create_block("right");
        let x = function.create_register(None);
        let condition = function.create_register(None);

        function
            .push_instruction(
                entry,
                Instruction::Branch {
                    operator: CompareOperator::Equal,
                    condition: Storage::Virtual(condition),
                    positive: left,
                    negative: right,
                },
            )
            .unwrap();
        set(&mut function, left, x, Operand::Immediate(1));
        set(&mut function, left, x, Operand::Immediate(2));
        function
            .push_instruction(left, Instruction::Jump { destination: exit })
            .unwrap();
        function
            .push_instruction(right, Instruction::Jump { destination: exit })
            .unwrap();
        function
            .push_instruction(
                exit,
                Instruction::Return {
                    value: Some(Operand::virtual_register(x)),
                },
            )
            .unwrap();

        construct_ssa(&mut function).unwrap();

        let phis = phis(&function);
        assert_eq!(phis.len(), 1);
        assert!(phis[0].iter().any(|s| s.block == right && s.value == Operand::Immediate(0)));
        verify_function(&function, VerifyLevel::Ssa).unwrap();
    }
}
