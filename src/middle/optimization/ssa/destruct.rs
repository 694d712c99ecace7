//! SSA destruction. Every phi is replaced by copies on its incoming edges.
//! The copies bound for one edge happen "at the same time", so they are
//! sequenced to never clobber a value another copy still has to read. An
//! edge leaving a block with several successors gets a block of its own for
//! its copies, otherwise they would also run when control takes one of the
//! other successors.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::{
    error::IrError,
    middle::{
        lir::{BlockId, Function, Instruction, InstructionId, Operand, RegisterId, Storage},
        optimization::dominators::DominatorTree,
    },
};

pub fn destruct_ssa(function: &mut Function) -> Result<(), IrError> {
    let coalesced = coalesce_phi_destinations(function);
    let copies = collect_copies(function)?;

    let mut inserted = 0;
    let mut split = 0;

    for ((predecessor, target), parallel) in copies {
        let block = if function.successors(predecessor).len() > 1 {
            split += 1;
            function.split_edge(predecessor, target)?
        } else {
            predecessor
        };

        let terminator = function
            .terminator(block)
            .ok_or_else(|| IrError::MissingTerminator {
                function: function.name.value().to_owned(),
                block,
            })?;

        let mut spare = None;
        let sequence = schedule_parallel_copy(&parallel, || {
            *spare.get_or_insert_with(|| function.create_register(None))
        });

        for (destination, source) in sequence {
            function.insert_before(
                terminator,
                Instruction::Move {
                    destination: Storage::Virtual(destination),
                    source,
                },
            )?;
            inserted += 1;
        }
    }

    let mut removed = 0;
    for block in function.live_blocks() {
        for phi in function.phis(block) {
            function.remove_instruction(phi)?;
            removed += 1;
        }
    }

    debug!(
        function = %function.name,
        phis = removed,
        coalesced,
        split,
        copies = inserted,
        "destructed SSA form"
    );

    Ok(())
}

/// Gives a phi's destination the register of one of its sources, which
/// saves the copy along that edge. The source has to be defined outside of
/// any phi in a block strictly dominating the phi's block, and this phi has
/// to be its only reader, so overwriting it on the other edges loses
/// nothing.
fn coalesce_phi_destinations(function: &mut Function) -> usize {
    let tree = DominatorTree::compute(function);

    let mut definitions: HashMap<RegisterId, (BlockId, bool)> = HashMap::new();
    let mut readers: HashMap<RegisterId, HashSet<InstructionId>> = HashMap::new();

    for id in function.all_instructions() {
        let instruction = function.instruction(id);
        let block = function.instructions[id].block;

        if let Some(register) = instruction.defined_register() {
            definitions.insert(register, (block, instruction.is_phi()));
        }

        for register in instruction.used_registers() {
            readers.entry(register).or_default().insert(id);
        }
    }

    let mut chosen = HashSet::new();
    let mut pairs = Vec::new();

    for block in function.live_blocks() {
        for phi in function.phis(block) {
            let Instruction::Phi {
                destination: Storage::Virtual(destination),
                sources,
            } = function.instruction(phi)
            else {
                continue;
            };

            let candidate = sources.iter().filter_map(|s| s.value.as_virtual()).find(|source| {
                source != destination
                    && !chosen.contains(source)
                    && definitions.get(source).is_some_and(|(defined_in, is_phi)| {
                        !is_phi && tree.strictly_dominates(*defined_in, block)
                    })
                    && readers
                        .get(source)
                        .is_some_and(|r| r.len() == 1 && r.contains(&phi))
            });

            if let Some(source) = candidate {
                chosen.insert(source);
                pairs.push((*destination, source));
            }
        }
    }

    for (destination, source) in &pairs {
        function.replace_register(*destination, *source);
    }

    pairs.len()
}

/// The copies each edge has to perform, keyed by (predecessor, phi block)
fn collect_copies(
    function: &Function,
) -> Result<BTreeMap<(BlockId, BlockId), Vec<(RegisterId, Operand)>>, IrError> {
    let mut copies: BTreeMap<(BlockId, BlockId), Vec<(RegisterId, Operand)>> = BTreeMap::new();

    for block in function.live_blocks() {
        for phi in function.phis(block) {
            let Instruction::Phi {
                destination,
                sources,
            } = function.instruction(phi)
            else {
                continue;
            };

            let Storage::Virtual(destination) = *destination else {
                return Err(IrError::PhiMismatch {
                    function: function.name.value().to_owned(),
                    block,
                });
            };

            for source in sources {
                if source.value == Operand::virtual_register(destination) {
                    continue;
                }

                let parallel = copies.entry((source.block, block)).or_default();

                // Parallel edges from one predecessor carry the same value
                if !parallel.iter().any(|(d, _)| *d == destination) {
                    parallel.push((destination, source.value));
                }
            }
        }
    }

    Ok(copies)
}

/// Orders a set of simultaneous copies `(destination, source)` so that
/// running them one after another has the same effect. A copy may run once
/// no other pending copy reads its destination; when only cycles remain, one
/// value is parked in a register from `temporary` to break them.
pub fn schedule_parallel_copy(
    copies: &[(RegisterId, Operand)],
    mut temporary: impl FnMut() -> RegisterId,
) -> Vec<(RegisterId, Operand)> {
    let mut pending = copies
        .iter()
        .filter(|(destination, source)| *source != Operand::virtual_register(*destination))
        .copied()
        .collect::<BTreeMap<_, _>>();

    let mut sequence = Vec::with_capacity(pending.len());

    while let Some((&first, _)) = pending.first_key_value() {
        let ready = pending
            .keys()
            .copied()
            .find(|d| !pending.values().any(|s| s.as_virtual() == Some(*d)));

        if let Some(destination) = ready
            && let Some(source) = pending.remove(&destination)
        {
            sequence.push((destination, source));
            continue;
        }

        // Every destination is still read by some copy: only cycles are left
        let parked = temporary();
        sequence.push((parked, Operand::virtual_register(first)));

        for source in pending.values_mut() {
            if source.as_virtual() == Some(first) {
                *source = Operand::virtual_register(parked);
            }
        }
    }

    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::Index,
        middle::lir::{
            BinaryOperator, CompareOperator, Module, PhiSource,
            interpreter::run_module,
            verify::{VerifyLevel, verify_function},
        },
    };

    fn register(n: usize) -> RegisterId {
        RegisterId::new(n)
    }

    fn value(n: usize) -> Operand {
        Operand::virtual_register(register(n))
    }

    /// Runs a sequence on a register file to see what the copies did
    fn simulate(sequence: &[(RegisterId, Operand)], initial: &[i64]) -> HashMap<RegisterId, i64> {
        let mut file = initial
            .iter()
            .enumerate()
            .map(|(n, v)| (register(n), *v))
            .collect::<HashMap<_, _>>();

        for (destination, source) in sequence {
            let value = match source {
                Operand::Immediate(value) => *value,
                other => file[&other.as_virtual().unwrap()],
            };
            file.insert(*destination, value);
        }

        file
    }

    #[test]
    fn chains_are_ordered_back_to_front() {
        // r0 <- r1, r1 <- r2, r2 <- 7
        let copies = [
            (register(0), value(1)),
            (register(1), value(2)),
            (register(2), Operand::Immediate(7)),
        ];

        let sequence = schedule_parallel_copy(&copies, || unreachable!());
        let file = simulate(&sequence, &[10, 11, 12]);

        assert_eq!(sequence.len(), 3);
        assert_eq!(file[&register(0)], 11);
        assert_eq!(file[&register(1)], 12);
        assert_eq!(file[&register(2)], 7);
    }

    #[test]
    fn swaps_go_through_a_temporary() {
        let copies = [(register(0), value(1)), (register(1), value(0))];

        let sequence = schedule_parallel_copy(&copies, || register(9));
        let file = simulate(&sequence, &[10, 11]);

        assert_eq!(sequence.len(), 3);
        assert_eq!(file[&register(0)], 11);
        assert_eq!(file[&register(1)], 10);
    }

    #[test]
    fn self_copies_are_dropped() {
        let copies = [(register(0), value(0)), (register(1), Operand::Immediate(3))];

        assert_eq!(
            schedule_parallel_copy(&copies, || unreachable!()),
            vec![(register(1), Operand::Immediate(3))]
        );
    }

    /// a, b = 1, 2; for n in 0..3 { a, b = b, a } return a * 10 + b
    fn swapping_loop() -> Function {
        let mut function = Function::new("main", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let header = function.create_block("header");
        let body = function.create_block("body");

        let [a0, b0, n0, a, b, n, n1, condition, scaled, result] =
            std::array::from_fn(|_| function.create_register(None));

        for (register, value) in [(a0, 1), (b0, 2), (n0, 0)] {
            function
                .push_instruction(
                    entry,
                    Instruction::Move {
                        destination: Storage::Virtual(register),
                        source: Operand::Immediate(value),
                    },
                )
                .unwrap();
        }
        function
            .push_instruction(entry, Instruction::Jump { destination: header })
            .unwrap();

        function
            .push_instruction(
                body,
                Instruction::BinaryOperation {
                    operator: BinaryOperator::Add,
                    destination: Storage::Virtual(n1),
                    lhs: Operand::virtual_register(n),
                    rhs: Operand::Immediate(1),
                },
            )
            .unwrap();
        function
            .push_instruction(body, Instruction::Jump { destination: header })
            .unwrap();

        for (destination, initial, next) in [(a, a0, b), (b, b0, a), (n, n0, n1)] {
            function
                .insert_phi(
                    header,
                    Storage::Virtual(destination),
                    vec![
                        PhiSource {
                            block: entry,
                            value: Operand::virtual_register(initial),
                        },
                        PhiSource {
                            block: body,
                            value: Operand::virtual_register(next),
                        },
                    ],
                )
                .unwrap();
        }

        function
            .push_instruction(
                header,
                Instruction::Compare {
                    operator: CompareOperator::Less,
                    destination: Storage::Virtual(condition),
                    lhs: Operand::virtual_register(n),
                    rhs: Operand::Immediate(3),
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
                exit,
                Instruction::BinaryOperation {
                    operator: BinaryOperator::Multiply,
                    destination: Storage::Virtual(scaled),
                    lhs: Operand::virtual_register(a),
                    rhs: Operand::Immediate(10),
                },
            )
            .unwrap();
        function
            .push_instruction(
                exit,
                Instruction::BinaryOperation {
                    operator: BinaryOperator::Add,
                    destination: Storage::Virtual(result),
                    lhs: Operand::virtual_register(scaled),
                    rhs: Operand::virtual_register(b),
                },
            )
            .unwrap();
        function
            .push_instruction(
                exit,
                Instruction::Return {
                    value: Some(Operand::virtual_register(result)),
                },
            )
            .unwrap();

        function
    }

    fn run(function: &Function) -> i64 {
        let mut module = Module::default();
        module.functions.push(function.clone());

        run_module(&module, 1_000).unwrap().return_value
    }

    #[test]
    fn swapping_phis_keep_their_meaning() {
        let mut function = swapping_loop();
        verify_function(&function, VerifyLevel::Ssa).unwrap();

        let before = run(&function);
        destruct_ssa(&mut function).unwrap();
        let after = run(&function);

        assert_eq!(before, 21);
        assert_eq!(after, before);
        verify_function(&function, VerifyLevel::Destructed).unwrap();
    }

    /// x = 0; do { previous = x; x = x + 1 } while (x < 3); return previous
    ///
    /// The loop branch is the only way back into the header, so the copy for
    /// the back edge must not run when the loop is left.
    fn value_read_after_leaving_loop() -> Function {
        let mut function = Function::new("main", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let header = function.create_block("header");
        let [initial, previous, next, condition] =
            std::array::from_fn(|_| function.create_register(None));

        function
            .push_instruction(
                entry,
                Instruction::Move {
                    destination: Storage::Virtual(initial),
                    source: Operand::Immediate(0),
                },
            )
            .unwrap();
        function
            .push_instruction(entry, Instruction::Jump { destination: header })
            .unwrap();

        function
            .push_instruction(
                header,
                Instruction::BinaryOperation {
                    operator: BinaryOperator::Add,
                    destination: Storage::Virtual(next),
                    lhs: Operand::virtual_register(previous),
                    rhs: Operand::Immediate(1),
                },
            )
            .unwrap();
        function
            .push_instruction(
                header,
                Instruction::Compare {
                    operator: CompareOperator::Less,
                    destination: Storage::Virtual(condition),
                    lhs: Operand::virtual_register(next),
                    rhs: Operand::Immediate(3),
                },
            )
            .unwrap();
        function
            .push_instruction(
                header,
                Instruction::Branch {
                    operator: CompareOperator::Less,
                    condition: Storage::Virtual(condition),
                    positive: header,
                    negative: exit,
                },
            )
            .unwrap();
        function
            .insert_phi(header, Storage::Virtual(previous), vec![
                PhiSource {
                    block: entry,
                    value: Operand::virtual_register(initial),
                },
                PhiSource {
                    block: header,
                    value: Operand::virtual_register(next),
                },
            ])
            .unwrap();

        function
            .push_instruction(
                exit,
                Instruction::Return {
                    value: Some(Operand::virtual_register(previous)),
                },
            )
            .unwrap();

        function
    }

    #[test]
    fn copies_on_a_branching_edge_get_their_own_block() {
        let mut function = value_read_after_leaving_loop();
        verify_function(&function, VerifyLevel::Ssa).unwrap();

        let header = function.successors(function.entry)[0];
        let before = run(&function);
        destruct_ssa(&mut function).unwrap();

        assert_eq!(before, 2);
        assert_eq!(run(&function), before);
        assert_eq!(function.live_blocks().len(), 4);
        assert!(!function.successors(header).contains(&header));
        verify_function(&function, VerifyLevel::Destructed).unwrap();
    }

    #[test]
    fn dominating_sources_are_coalesced() {
        let mut function = swapping_loop();
        let entry = function.entry;

        destruct_ssa(&mut function).unwrap();

        // a, b and n reuse the registers initialized in the entry block, so
        // nothing has to be copied there
        assert_eq!(function.instruction_ids(entry).len(), 4);
    }
}
