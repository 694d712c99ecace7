//! Dominator tree and dominance frontiers, computed with the iterative
//! algorithm of Cooper, Harvey and Kennedy over the reverse postorder.

use std::collections::BTreeSet;

use crate::{
    index::IndexVec,
    middle::lir::{BlockId, Function},
};

#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: BlockId,
    /// Immediate dominator of each reachable block. The entry is its own.
    idom: IndexVec<BlockId, Option<BlockId>>,
    children: IndexVec<BlockId, Vec<BlockId>>,
    rpo: Vec<BlockId>,
    rpo_position: IndexVec<BlockId, Option<usize>>,
}

impl DominatorTree {
    pub fn compute(function: &Function) -> Self {
        let rpo = function.reverse_postorder();
        let block_count = function.blocks.len();

        let mut rpo_position: IndexVec<BlockId, Option<usize>> =
            IndexVec::from_elem_n(None, block_count);
        for (position, block) in rpo.iter().enumerate() {
            rpo_position[*block] = Some(position);
        }

        let mut idom: IndexVec<BlockId, Option<BlockId>> = IndexVec::from_elem_n(None, block_count);
        idom[function.entry] = Some(function.entry);

        let intersect = |idom: &IndexVec<BlockId, Option<BlockId>>, mut a: BlockId, mut b: BlockId| {
            while a != b {
                while rpo_position[a] > rpo_position[b] {
                    a = idom[a].unwrap_or(function.entry);
                }
                while rpo_position[b] > rpo_position[a] {
                    b = idom[b].unwrap_or(function.entry);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;

            for block in rpo.iter().skip(1).copied() {
                let mut processed = function
                    .predecessors(block)
                    .iter()
                    .copied()
                    .filter(|p| idom[*p].is_some());

                let Some(first) = processed.next() else {
                    continue;
                };

                let new_idom = processed.fold(first, |current, p| intersect(&idom, p, current));

                if idom[block] != Some(new_idom) {
                    idom[block] = Some(new_idom);
                    changed = true;
                }
            }
        }

        let mut children: IndexVec<BlockId, Vec<BlockId>> =
            IndexVec::from_elem_n(Vec::new(), block_count);
        for block in rpo.iter().skip(1).copied() {
            if let Some(parent) = idom[block] {
                children[parent].push(block);
            }
        }

        Self {
            entry: function.entry,
            idom,
            children,
            rpo,
            rpo_position,
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// `None` for the entry and for unreachable blocks
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        if block == self.entry {
            return None;
        }

        self.idom.get(block).copied().flatten()
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_position.get(block).copied().flatten().is_some()
    }

    /// Whether every path from the entry to `b` passes through `a`. A block
    /// dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }

        let mut current = b;
        loop {
            if current == a {
                return true;
            }

            match self.immediate_dominator(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Children in the dominator tree, in reverse postorder
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        &self.children[block]
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Blocks of the dominator tree in preorder, starting at the entry
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.rpo.len());
        let mut stack = vec![self.entry];

        while let Some(block) = stack.pop() {
            order.push(block);
            stack.extend(self.children(block).iter().rev().copied());
        }

        order
    }

    /// The dominance frontier of every block: the blocks where its dominance
    /// ends
    pub fn dominance_frontiers(&self, function: &Function) -> IndexVec<BlockId, BTreeSet<BlockId>> {
        let mut frontiers = IndexVec::from_elem_n(BTreeSet::new(), function.blocks.len());

        for block in self.rpo.iter().copied() {
            let predecessors = function
                .predecessors(block)
                .iter()
                .copied()
                .filter(|p| self.is_reachable(*p))
                .collect::<BTreeSet<_>>();

            if predecessors.len() < 2 {
                continue;
            }

            let Some(idom) = self.immediate_dominator(block) else {
                continue;
            };

            for predecessor in predecessors {
                let mut runner = predecessor;

                while runner != idom {
                    frontiers[runner].insert(block);

                    match self.immediate_dominator(runner) {
                        Some(parent) => runner = parent,
                        None => break,
                    }
                }
            }
        }

        frontiers
    }

    /// Iterated dominance frontier of a set of blocks
    pub fn iterated_frontier(
        frontiers: &IndexVec<BlockId, BTreeSet<BlockId>>,
        blocks: impl IntoIterator<Item = BlockId>,
    ) -> BTreeSet<BlockId> {
        let mut result = BTreeSet::new();
        let mut worklist = blocks.into_iter().collect::<Vec<_>>();

        while let Some(block) = worklist.pop() {
            for frontier in &frontiers[block] {
                if result.insert(*frontier) {
                    worklist.push(*frontier);
                }
            }
        }

        result
    }

    /// Position of `block` in the reverse postorder
    pub fn position(&self, block: BlockId) -> Option<usize> {
        self.rpo_position.get(block).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::lir::{CompareOperator, Instruction, Storage};

    fn jump(function: &mut Function, from: BlockId, to: BlockId) {
        function
            .push_instruction(from, Instruction::Jump { destination: to })
            .unwrap();
    }

    fn branch(function: &mut Function, from: BlockId, positive: BlockId, negative: BlockId) {
        let condition = function.create_register(None);
        function
            .push_instruction(
                from,
                Instruction::Branch {
                    operator: CompareOperator::Equal,
                    condition: Storage::Virtual(condition),
                    positive,
                    negative,
                },
            )
            .unwrap();
    }

    /// entry -> (left | right) -> exit
    fn diamond() -> (Function, [BlockId; 4]) {
        let mut function = Function::new("diamond", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let left = function.create_block("left");
        let right = function.create_block("right");

        branch(&mut function, entry, left, right);
        jump(&mut function, left, exit);
        jump(&mut function, right, exit);

        (function, [entry, left, right, exit])
    }

    #[test]
    fn diamond_join_is_dominated_by_the_fork() {
        let (function, [entry, left, right, exit]) = diamond();
        let tree = DominatorTree::compute(&function);

        assert_eq!(tree.immediate_dominator(exit), Some(entry));
        assert_eq!(tree.immediate_dominator(left), Some(entry));
        assert!(tree.dominates(entry, right));
        assert!(!tree.dominates(left, exit));
        assert!(tree.dominates(exit, exit));
        assert!(!tree.strictly_dominates(exit, exit));
    }

    #[test]
    fn diamond_frontiers() {
        let (function, [entry, left, right, exit]) = diamond();
        let tree = DominatorTree::compute(&function);
        let frontiers = tree.dominance_frontiers(&function);

        assert_eq!(frontiers[left], BTreeSet::from([exit]));
        assert_eq!(frontiers[right], BTreeSet::from([exit]));
        assert!(frontiers[entry].is_empty());
        assert!(frontiers[exit].is_empty());
    }

    #[test]
    fn loop_header_is_in_its_own_frontier() {
        let mut function = Function::new("looping", 0);
        let entry = function.entry;
        let exit = function.exit.unwrap();
        let header = function.create_block("header");
        let body = function.create_block("body");

        jump(&mut function, entry, header);
        branch(&mut function, header, body, exit);
        jump(&mut function, body, header);

        let tree = DominatorTree::compute(&function);
        let frontiers = tree.dominance_frontiers(&function);

        assert_eq!(tree.immediate_dominator(body), Some(header));
        assert_eq!(tree.immediate_dominator(exit), Some(header));
        assert_eq!(frontiers[body], BTreeSet::from([header]));
        assert_eq!(frontiers[header], BTreeSet::from([header]));
        assert_eq!(
            DominatorTree::iterated_frontier(&frontiers, [body]),
            BTreeSet::from([header])
        );
        assert_eq!(tree.preorder()[0], entry);
    }

    #[test]
    fn unreachable_blocks_have_no_dominator() {
        let (mut function, [_, _, _, exit]) = diamond();
        let orphan = function.create_block("orphan");
        jump(&mut function, orphan, exit);

        let tree = DominatorTree::compute(&function);

        assert_eq!(tree.immediate_dominator(orphan), None);
        assert!(!tree.dominates(orphan, exit));
        assert_eq!(tree.immediate_dominator(exit), Some(function.entry));
    }
}
