use hashbrown::HashSet;
use tracing::debug;

use crate::{
    error::IrError,
    middle::lir::{Function, Instruction},
};

// Cleans up the control flow graph produced by lowering: unreachable blocks
// are deleted, branches to a single target become jumps, blocks which only
// jump somewhere else are bypassed and straight-line chains of blocks are
// merged. Repeats until nothing changes, since each step can expose work for
// the others.
pub fn simplify_cfg(function: &mut Function) -> Result<bool, IrError> {
    let mut changed = false;
    let mut rounds = 0;

    loop {
        let removed = remove_unreachable_blocks(function)?;
        let collapsed = collapse_branches(function)?;
        let threaded = thread_jumps(function)?;
        let merged = merge_blocks(function)?;

        if removed + collapsed + threaded + merged == 0 {
            break;
        }

        changed = true;
        rounds += 1;

        debug!(
            function = %function.name,
            removed,
            collapsed,
            threaded,
            merged,
            "simplified control flow"
        );
    }

    if changed {
        debug!(function = %function.name, rounds, "control flow reached a fixpoint");
    }

    Ok(changed)
}

/// Deletes every block the entry cannot reach. Returns how many went away.
pub fn remove_unreachable_blocks(function: &mut Function) -> Result<usize, IrError> {
    let reachable = function.reachable_blocks();

    let dead = function
        .live_blocks()
        .into_iter()
        .filter(|b| !reachable.contains(b))
        .collect::<HashSet<_>>();

    if !dead.is_empty() {
        function.remove_blocks(&dead)?;
    }

    Ok(dead.len())
}

/// A branch whose targets are the same block is just a jump
fn collapse_branches(function: &mut Function) -> Result<usize, IrError> {
    let mut collapsed = 0;

    for block in function.live_blocks() {
        let Some(terminator) = function.terminator(block) else {
            continue;
        };

        if let Instruction::Branch {
            positive, negative, ..
        } = *function.instruction(terminator)
            && positive == negative
        {
            function.replace_instruction(
                terminator,
                Instruction::Jump {
                    destination: positive,
                },
            )?;
            collapsed += 1;
        }
    }

    Ok(collapsed)
}

/// Jump threading. Predecessors of a block which is nothing but a jump are
/// pointed straight at the jump's destination. The bypassed block becomes
/// unreachable and is collected by the next round.
fn thread_jumps(function: &mut Function) -> Result<usize, IrError> {
    let mut threaded = 0;

    for block in function.live_blocks() {
        if block == function.entry || function.block(block).removed {
            continue;
        }

        let mut instructions = function.instructions_in(block);

        let (Some((_, Instruction::Jump { destination })), None) =
            (instructions.next(), instructions.next())
        else {
            continue;
        };

        // A jump to itself has nowhere better to go
        let destination = *destination;
        if destination == block {
            continue;
        }

        let mut predecessors = function.predecessors(block).to_vec();
        predecessors.dedup();

        for predecessor in predecessors {
            if predecessor == block || !function.can_redirect_edge(predecessor, block, destination)
            {
                continue;
            }

            function.redirect_edge(predecessor, block, destination)?;
            threaded += 1;
        }
    }

    Ok(threaded)
}

/// Merges a block into its predecessor when they form a straight line: the
/// predecessor only leads to the block and the block is only reached from
/// the predecessor.
fn merge_blocks(function: &mut Function) -> Result<usize, IrError> {
    let mut merged = 0;

    for block in function.live_blocks() {
        if block == function.entry || function.block(block).removed {
            continue;
        }

        let [predecessor] = *function.predecessors(block) else {
            continue;
        };

        if predecessor == block || function.successors(predecessor) != [block] {
            continue;
        }

        function.splice_block(predecessor, block)?;
        merged += 1;
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::lir::{
        BlockId, CompareOperator, Operand, Storage, verify::{VerifyLevel, verify_function},
    };

    fn jump(function: &mut Function, from: BlockId, to: BlockId) {
        function
            .push_instruction(from, Instruction::Jump { destination: to })
            .unwrap();
    }

    fn ret(function: &mut Function, block: BlockId) {
        function
            .push_instruction(block, Instruction::Return { value: None })
            .unwrap();
    }

    fn set(function: &mut Function, block: BlockId, value: i64) {
        let register = function.create_register(None);
        function
            .push_instruction(
                block,
                Instruction::Move {
                    destination: Storage::Virtual(register),
                    source: Operand::Immediate(value),
                },
            )
            .unwrap();
    }

    fn branch(function: &mut Function, from: BlockId, positive: BlockId, negative: BlockId) {
        let condition = function.create_register(None);
        function
            .push_instruction(
                from,
                Instruction::Branch {
                    operator: CompareOperator::Less,
                    condition: Storage::Virtual(condition),
                    positive,
                    negative,
                },
            )
            .unwrap();
    }

    #[test]
    fn straight_line_chain_collapses_into_the_entry() {
        let mut function = Function::new("chain", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let middle = function.create_block("middle");

        set(&mut function, entry, 1);
        jump(&mut function, entry, middle);
        set(&mut function, middle, 2);
        jump(&mut function, middle, exit);
        ret(&mut function, exit);

        assert!(simplify_cfg(&mut function).unwrap());

        assert_eq!(function.live_blocks(), vec![entry]);
        assert_eq!(function.exit, Some(entry));
        assert_eq!(function.instruction_ids(entry).len(), 3);
        verify_function(&function, VerifyLevel::Simplified).unwrap();
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let mut function = Function::new("dead", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let orphan = function.create_block("orphan");

        jump(&mut function, entry, exit);
        set(&mut function, orphan, 5);
        jump(&mut function, orphan, exit);
        ret(&mut function, exit);

        simplify_cfg(&mut function).unwrap();

        assert!(function.block(orphan).removed);
        verify_function(&function, VerifyLevel::Simplified).unwrap();
    }

    #[test]
    fn jump_only_blocks_are_threaded() {
        let mut function = Function::new("threaded", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let left = function.create_block("left");
        let hop = function.create_block("hop");
        let join = function.create_block("join");

        branch(&mut function, entry, left, hop);
        set(&mut function, left, 1);
        jump(&mut function, left, join);
        jump(&mut function, hop, join);
        set(&mut function, join, 2);
        jump(&mut function, join, exit);
        ret(&mut function, exit);

        simplify_cfg(&mut function).unwrap();

        assert!(function.block(hop).removed);
        assert_eq!(function.successors(entry), [left, join]);
        assert_eq!(function.predecessors(join), [left, entry]);
        verify_function(&function, VerifyLevel::Simplified).unwrap();
    }

    #[test]
    fn branch_to_one_target_becomes_a_jump() {
        let mut function = Function::new("same", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let body = function.create_block("body");

        branch(&mut function, entry, body, body);
        set(&mut function, body, 1);
        jump(&mut function, body, exit);
        ret(&mut function, exit);

        simplify_cfg(&mut function).unwrap();

        assert_eq!(function.live_blocks(), vec![entry]);
        assert!(function.all_instructions().iter().all(|id| !matches!(
            function.instruction(*id),
            Instruction::Branch { .. }
        )));
    }

    #[test]
    fn jump_cycles_end_as_a_self_loop() {
        let mut function = Function::new("spin", 0);
        let entry = function.entry;
        let first = function.create_block("first");
        let second = function.create_block("second");

        set(&mut function, entry, 0);
        jump(&mut function, entry, first);
        jump(&mut function, first, second);
        jump(&mut function, second, first);

        simplify_cfg(&mut function).unwrap();

        let live = function.live_blocks();
        let looping = live
            .iter()
            .copied()
            .find(|b| *b != entry)
            .unwrap();

        assert_eq!(live.len(), 2);
        assert_eq!(function.successors(looping), [looping]);
        assert_eq!(function.exit, None);
        verify_function(&function, VerifyLevel::Simplified).unwrap();
    }
}
