use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::{
    error::IrError,
    middle::{
        lir::{Function, Instruction, InstructionId, Operand, RegisterId, Storage},
        optimization::cfg_simplify::remove_unreachable_blocks,
    },
};

// Dead code elimination over SSA form. Instructions whose results nobody
// observes are deleted, then blocks nothing reaches anymore and phis which
// can only ever produce one value. Each of those can make more code dead, so
// this repeats until a round changes nothing. Returns whether anything was
// removed at all.
pub fn eliminate_dead_code(function: &mut Function) -> Result<bool, IrError> {
    let mut changed = false;

    loop {
        let swept = sweep_unused_instructions(function)?;
        let blocks = remove_unreachable_blocks(function)?;
        let phis = remove_trivial_phis(function)?;

        if swept + blocks + phis == 0 {
            break;
        }

        debug!(
            function = %function.name,
            swept,
            blocks,
            phis,
            "eliminated dead code"
        );

        changed = true;
    }

    Ok(changed)
}

/// Mark and sweep. Side effecting instructions are live; so is every
/// definition of a register a live instruction reads, phi sources and
/// address registers included.
fn sweep_unused_instructions(function: &mut Function) -> Result<usize, IrError> {
    let all = function.all_instructions();

    let mut definitions: HashMap<RegisterId, Vec<InstructionId>> = HashMap::new();
    for id in &all {
        if let Some(register) = function.instruction(*id).defined_register() {
            definitions.entry(register).or_default().push(*id);
        }
    }

    let mut live = HashSet::new();
    let mut worklist = all
        .iter()
        .copied()
        .filter(|id| function.instruction(*id).has_side_effects())
        .collect::<Vec<_>>();

    while let Some(id) = worklist.pop() {
        if !live.insert(id) {
            continue;
        }

        for register in function.instruction(id).used_registers() {
            if let Some(defining) = definitions.get(&register) {
                worklist.extend(defining.iter().filter(|d| !live.contains(*d)));
            }
        }
    }

    let mut swept = 0;
    for id in all {
        if !live.contains(&id) {
            function.remove_instruction(id)?;
            swept += 1;
        }
    }

    Ok(swept)
}

/// A phi whose sources, ignoring the phi itself, are all the same value is
/// that value. Removes one such phi at a time until none is left.
fn remove_trivial_phis(function: &mut Function) -> Result<usize, IrError> {
    let mut removed = 0;

    while let Some((phi, destination, value)) = find_trivial_phi(function) {
        let block = function.instructions[phi].block;
        function.remove_instruction(phi)?;

        match value.as_virtual() {
            Some(register) => function.replace_register(destination, register),
            None => {
                function.insert_after_phis(
                    block,
                    Instruction::Move {
                        destination: Storage::Virtual(destination),
                        source: value,
                    },
                )?;
            }
        }

        removed += 1;
    }

    Ok(removed)
}

fn find_trivial_phi(function: &Function) -> Option<(InstructionId, RegisterId, Operand)> {
    for block in function.live_blocks() {
        for phi in function.phis(block) {
            let Instruction::Phi {
                destination: Storage::Virtual(destination),
                sources,
            } = function.instruction(phi)
            else {
                continue;
            };

            let itself = Operand::virtual_register(*destination);
            let mut values = sources.iter().map(|s| s.value).filter(|v| *v != itself);

            let Some(first) = values.next() else {
                // Only reachable through itself, so it never has a value
                if !sources.is_empty() {
                    return Some((phi, *destination, Operand::Immediate(0)));
                }
                continue;
            };

            if values.all(|v| v == first) {
                return Some((phi, *destination, first));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::lir::{
        BinaryOperator, BlockId, CompareOperator, PhiSource, PhysicalRegister,
        verify::{VerifyLevel, verify_function},
    };

    fn push(function: &mut Function, block: BlockId, instruction: Instruction) -> InstructionId {
        function.push_instruction(block, instruction).unwrap()
    }

    #[test]
    fn unused_chains_are_swept_in_one_call() {
        let mut function = Function::new("unused", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let [a, b, kept] = std::array::from_fn(|_| function.create_register(None));

        push(&mut function, entry, Instruction::Move {
            destination: Storage::Virtual(a),
            source: Operand::Immediate(1),
        });
        push(&mut function, entry, Instruction::BinaryOperation {
            operator: BinaryOperator::Add,
            destination: Storage::Virtual(b),
            lhs: Operand::virtual_register(a),
            rhs: Operand::Immediate(2),
        });
        push(&mut function, entry, Instruction::Move {
            destination: Storage::Virtual(kept),
            source: Operand::Immediate(3),
        });
        push(&mut function, entry, Instruction::Move {
            destination: Storage::Physical(PhysicalRegister::Rax),
            source: Operand::virtual_register(kept),
        });
        push(&mut function, entry, Instruction::Jump { destination: exit });
        push(&mut function, exit, Instruction::Return {
            value: Some(Operand::physical(PhysicalRegister::Rax)),
        });

        assert!(eliminate_dead_code(&mut function).unwrap());

        assert_eq!(function.instruction_ids(entry).len(), 3);
        assert!(!eliminate_dead_code(&mut function).unwrap());
        verify_function(&function, VerifyLevel::Ssa).unwrap();
    }

    #[test]
    fn trivial_phis_forward_their_value() {
        // Build the loop edge before the phi so the sources line up
        let mut function = Function::new("forward", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let header = function.create_block("header");
        let [x, looped] = std::array::from_fn(|_| function.create_register(None));

        push(&mut function, entry, Instruction::Move {
            destination: Storage::Virtual(x),
            source: Operand::Immediate(4),
        });
        push(&mut function, entry, Instruction::Jump { destination: header });
        push(&mut function, header, Instruction::Branch {
            operator: CompareOperator::NotEqual,
            condition: Storage::Physical(PhysicalRegister::Rdi),
            positive: header,
            negative: exit,
        });
        function
            .insert_phi(header, Storage::Virtual(looped), vec![
                PhiSource {
                    block: entry,
                    value: Operand::virtual_register(x),
                },
                PhiSource {
                    block: header,
                    value: Operand::virtual_register(looped),
                },
            ])
            .unwrap();
        push(&mut function, exit, Instruction::Return {
            value: Some(Operand::virtual_register(looped)),
        });

        assert!(eliminate_dead_code(&mut function).unwrap());

        assert!(function.phis(header).is_empty());
        assert_eq!(
            *function.instruction(function.terminator(exit).unwrap()),
            Instruction::Return {
                value: Some(Operand::virtual_register(x)),
            }
        );
        verify_function(&function, VerifyLevel::Ssa).unwrap();
    }
}
