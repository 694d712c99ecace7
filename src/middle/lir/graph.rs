//! Construction, traversal and mutation of the per-function control flow
//! graph. Every primitive here keeps the instruction links, the edge lists
//! and the phi sources consistent with each other, or refuses to act.

use hashbrown::HashSet;

use crate::{
    error::IrError,
    frontend::intern::InternedSymbol,
    index::{Index, IndexVec},
    middle::lir::{
        Block, BlockId, Function, Instruction, InstructionId, InstructionNode, Operand, PhiSource,
        RegisterId, Storage, VirtualRegister,
    },
};

impl Function {
    /// Creates a function with an empty entry block and an empty exit block
    pub fn new(name: &str, parameter_count: usize) -> Self {
        let mut function = Self {
            name: InternedSymbol::new(name),
            parameter_count,
            registers: IndexVec::new(),
            blocks: IndexVec::new(),
            instructions: IndexVec::new(),
            entry: BlockId::new(0),
            exit: None,
            temporary_count: 0,
            argument_limit: 0,
        };

        function.entry = function.create_block(&format!("{name}_entry"));
        function.exit = Some(function.create_block(&format!("{name}_exit")));

        function
    }

    fn describe(&self) -> String {
        self.name.value().to_owned()
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        let id = self.blocks.next_index();
        self.blocks.push(Block {
            id,
            name: InternedSymbol::new(name),
            first: None,
            last: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
            rpo_index: None,
            removed: false,
        })
    }

    pub fn create_register(&mut self, hint: Option<InternedSymbol>) -> RegisterId {
        self.registers.push(VirtualRegister { hint })
    }

    /// Creates a new register carrying the same name hint as `register`
    pub fn create_version_of(&mut self, register: RegisterId) -> RegisterId {
        let hint = self.registers.get(register).and_then(|r| r.hint);
        self.create_register(hint)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn instruction(&self, id: InstructionId) -> &Instruction {
        &self.instructions[id].kind
    }

    pub fn instruction_mut(&mut self, id: InstructionId) -> &mut Instruction {
        &mut self.instructions[id].kind
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].predecessors
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].successors
    }

    /// Ids of every block which has not been removed, in creation order
    pub fn live_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .enumerate()
            .filter(|(_, b)| !b.removed)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn instructions_in(&self, block: BlockId) -> BlockInstructions<'_> {
        BlockInstructions {
            function: self,
            next: self.blocks[block].first,
        }
    }

    pub fn instruction_ids(&self, block: BlockId) -> Vec<InstructionId> {
        self.instructions_in(block).map(|(id, _)| id).collect()
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstructionId> {
        self.blocks[block]
            .last
            .filter(|id| self.instruction(*id).is_terminator())
    }

    pub fn phis(&self, block: BlockId) -> Vec<InstructionId> {
        self.instructions_in(block)
            .take_while(|(_, i)| i.is_phi())
            .map(|(id, _)| id)
            .collect()
    }

    /// Every live instruction of the function in block creation order
    pub fn all_instructions(&self) -> Vec<InstructionId> {
        self.live_blocks()
            .into_iter()
            .flat_map(|b| self.instruction_ids(b))
            .collect()
    }

    fn check_block(&self, block: BlockId) -> Result<(), IrError> {
        if self.blocks.get(block).is_none_or(|b| b.removed) {
            return Err(IrError::StaleBlock {
                function: self.describe(),
                block,
            });
        }

        Ok(())
    }

    fn check_instruction(&self, instruction: InstructionId) -> Result<(), IrError> {
        if self.instructions.get(instruction).is_none_or(|i| i.removed) {
            return Err(IrError::StaleInstruction {
                function: self.describe(),
                instruction,
            });
        }

        Ok(())
    }

    /// Links a new node into `block` right after `after`, or at the front
    /// when `after` is `None`. Performs no validation.
    fn link_after(
        &mut self,
        block: BlockId,
        after: Option<InstructionId>,
        kind: Instruction,
    ) -> InstructionId {
        let next = match after {
            Some(after) => self.instructions[after].next,
            None => self.blocks[block].first,
        };

        let id = self.instructions.push(InstructionNode {
            kind,
            block,
            previous: after,
            next,
            removed: false,
        });

        match after {
            Some(after) => self.instructions[after].next = Some(id),
            None => self.blocks[block].first = Some(id),
        }

        match next {
            Some(next) => self.instructions[next].previous = Some(id),
            None => self.blocks[block].last = Some(id),
        }

        id
    }

    /// Detaches a node from its block and turns it into a tombstone
    fn unlink(&mut self, id: InstructionId) -> Instruction {
        let InstructionNode {
            block,
            previous,
            next,
            ..
        } = self.instructions[id];

        match previous {
            Some(previous) => self.instructions[previous].next = next,
            None => self.blocks[block].first = next,
        }

        match next {
            Some(next) => self.instructions[next].previous = previous,
            None => self.blocks[block].last = previous,
        }

        let node = &mut self.instructions[id];
        node.removed = true;
        node.previous = None;
        node.next = None;

        std::mem::replace(&mut node.kind, Instruction::Return { value: None })
    }

    /// Appends `kind` to the end of `block`. Appending a terminator creates
    /// the outgoing edges of the block.
    pub fn push_instruction(
        &mut self,
        block: BlockId,
        kind: Instruction,
    ) -> Result<InstructionId, IrError> {
        self.check_block(block)?;

        if self.terminator(block).is_some() {
            return Err(IrError::InstructionAfterTerminator {
                function: self.describe(),
                block,
            });
        }

        if kind.is_phi() && self.blocks[block].last.is_some_and(|l| !self.instruction(l).is_phi())
        {
            return Err(IrError::MisplacedPhi {
                function: self.describe(),
                block,
            });
        }

        let targets = kind.targets();
        for target in &targets {
            self.check_block(*target)?;

            if !self.phis(*target).is_empty() {
                return Err(IrError::PhiMismatch {
                    function: self.describe(),
                    block: *target,
                });
            }
        }

        let last = self.blocks[block].last;
        let id = self.link_after(block, last, kind);

        for target in targets {
            self.blocks[block].successors.push(target);
            self.blocks[target].predecessors.push(block);
        }

        Ok(id)
    }

    /// Inserts a non-terminator, non-phi instruction in front of `anchor`
    pub fn insert_before(
        &mut self,
        anchor: InstructionId,
        kind: Instruction,
    ) -> Result<InstructionId, IrError> {
        self.check_instruction(anchor)?;

        let block = self.instructions[anchor].block;

        if kind.is_terminator() {
            return Err(IrError::MisplacedTerminator {
                function: self.describe(),
                block,
            });
        }

        if kind.is_phi() || self.instruction(anchor).is_phi() {
            return Err(IrError::MisplacedPhi {
                function: self.describe(),
                block,
            });
        }

        let previous = self.instructions[anchor].previous;
        Ok(self.link_after(block, previous, kind))
    }

    /// Inserts a non-terminator instruction right after the phis of `block`
    pub fn insert_after_phis(
        &mut self,
        block: BlockId,
        kind: Instruction,
    ) -> Result<InstructionId, IrError> {
        self.check_block(block)?;

        if kind.is_terminator() || kind.is_phi() {
            return Err(IrError::MisplacedPhi {
                function: self.describe(),
                block,
            });
        }

        let after = self.phis(block).last().copied();
        Ok(self.link_after(block, after, kind))
    }

    /// Appends a phi to the phi prefix of `block`. `sources` must line up
    /// with the predecessor list.
    pub fn insert_phi(
        &mut self,
        block: BlockId,
        destination: Storage,
        sources: Vec<PhiSource>,
    ) -> Result<InstructionId, IrError> {
        self.check_block(block)?;

        let aligned = sources.len() == self.blocks[block].predecessors.len()
            && sources
                .iter()
                .zip(&self.blocks[block].predecessors)
                .all(|(s, p)| s.block == *p);

        if !aligned {
            return Err(IrError::PhiMismatch {
                function: self.describe(),
                block,
            });
        }

        let after = self.phis(block).last().copied();
        Ok(self.link_after(
            block,
            after,
            Instruction::Phi {
                destination,
                sources,
            },
        ))
    }

    /// Removes a non-terminator instruction, returning what it was
    pub fn remove_instruction(&mut self, id: InstructionId) -> Result<Instruction, IrError> {
        self.check_instruction(id)?;

        if self.instruction(id).is_terminator() {
            return Err(IrError::RemoveTerminator {
                function: self.describe(),
                instruction: id,
            });
        }

        Ok(self.unlink(id))
    }

    /// Swaps the instruction at `id` for `kind`, returning the old one. A
    /// terminator can only be replaced by a terminator, and the outgoing
    /// edges of the block follow the new one.
    pub fn replace_instruction(
        &mut self,
        id: InstructionId,
        kind: Instruction,
    ) -> Result<Instruction, IrError> {
        self.check_instruction(id)?;

        let block = self.instructions[id].block;
        let old = self.instruction(id);

        if old.is_terminator() != kind.is_terminator() {
            return Err(IrError::MisplacedTerminator {
                function: self.describe(),
                block,
            });
        }

        if old.is_phi() != kind.is_phi() {
            return Err(IrError::MisplacedPhi {
                function: self.describe(),
                block,
            });
        }

        if kind.is_terminator() {
            let mut removed = old.targets();
            let mut added = Vec::new();

            for target in kind.targets() {
                match removed.iter().position(|t| *t == target) {
                    Some(position) => {
                        removed.remove(position);
                    }
                    None => added.push(target),
                }
            }

            for target in &added {
                self.check_block(*target)?;

                if !self.phis(*target).is_empty() {
                    return Err(IrError::PhiMismatch {
                        function: self.describe(),
                        block: *target,
                    });
                }
            }

            for target in removed {
                self.remove_edge(block, target)?;
            }

            for target in added {
                self.blocks[target].predecessors.push(block);
            }

            self.blocks[block].successors = kind.targets();
        }

        Ok(std::mem::replace(&mut self.instructions[id].kind, kind))
    }

    /// Drops one `from -> to` edge from both edge lists along with the
    /// matching phi sources of `to`. The terminator is left untouched.
    fn remove_edge(&mut self, from: BlockId, to: BlockId) -> Result<(), IrError> {
        let missing = || IrError::MissingEdge {
            function: self.describe(),
            from,
            to,
        };

        let successor = self.blocks[from]
            .successors
            .iter()
            .rposition(|s| *s == to)
            .ok_or_else(missing)?;
        let predecessor = self.blocks[to]
            .predecessors
            .iter()
            .rposition(|p| *p == from)
            .ok_or_else(missing)?;

        self.blocks[from].successors.remove(successor);
        self.blocks[to].predecessors.remove(predecessor);

        for phi in self.phis(to) {
            if let Instruction::Phi { sources, .. } = self.instruction_mut(phi) {
                sources.remove(predecessor);
            }
        }

        Ok(())
    }

    /// The phi sources `block` receives along the edge from `predecessor`,
    /// in phi order
    fn phi_values_from(&self, block: BlockId, predecessor: BlockId) -> Option<Vec<Operand>> {
        let index = self.blocks[block]
            .predecessors
            .iter()
            .position(|p| *p == predecessor)?;

        Some(
            self.phis(block)
                .into_iter()
                .filter_map(|phi| match self.instruction(phi) {
                    Instruction::Phi { sources, .. } => Some(sources[index].value),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Whether redirecting the `from -> old` edge(s) to `new` keeps the phis
    /// of `new` well defined: `new` must either have no phis, or receive its
    /// phi values through `old` and agree with any edge `from` already has
    /// into it.
    pub fn can_redirect_edge(&self, from: BlockId, old: BlockId, new: BlockId) -> bool {
        if self.phis(new).is_empty() {
            return true;
        }

        let Some(through_old) = self.phi_values_from(new, old) else {
            return false;
        };

        match self.phi_values_from(new, from) {
            Some(existing) => existing == through_old,
            None => true,
        }
    }

    /// Retargets every `from -> old` edge to `new`. Phis in `new` receive,
    /// for `from`, the values they were receiving from `old`. A branch whose
    /// targets end up equal collapses into a jump.
    pub fn redirect_edge(&mut self, from: BlockId, old: BlockId, new: BlockId) -> Result<(), IrError> {
        self.check_block(from)?;
        self.check_block(old)?;
        self.check_block(new)?;

        let terminator = self.terminator(from).ok_or_else(|| IrError::MissingTerminator {
            function: self.describe(),
            block: from,
        })?;

        let occurrences = self.blocks[from]
            .successors
            .iter()
            .filter(|s| **s == old)
            .count();

        if occurrences == 0 {
            return Err(IrError::MissingEdge {
                function: self.describe(),
                from,
                to: old,
            });
        }

        if !self.can_redirect_edge(from, old, new) {
            return Err(IrError::PhiMismatch {
                function: self.describe(),
                block: new,
            });
        }

        let values = self.phi_values_from(new, old).unwrap_or_default();

        for _ in 0..occurrences {
            self.remove_edge(from, old)?;
        }

        for target in self.instruction_mut(terminator).targets_mut() {
            if *target == old {
                *target = new;
            }
        }

        for _ in 0..occurrences {
            self.blocks[new].predecessors.push(from);

            for (phi, value) in self.phis(new).into_iter().zip(&values) {
                if let Instruction::Phi { sources, .. } = self.instruction_mut(phi) {
                    sources.push(PhiSource {
                        block: from,
                        value: *value,
                    });
                }
            }
        }

        self.blocks[from].successors = self.instruction(terminator).targets();

        if let Instruction::Branch {
            positive, negative, ..
        } = *self.instruction(terminator)
            && positive == negative
        {
            self.replace_instruction(
                terminator,
                Instruction::Jump {
                    destination: positive,
                },
            )?;
        }

        Ok(())
    }

    /// Places a new block on the `from -> to` edge(s). The new block jumps
    /// to `to` and takes the place of `from` in its predecessor list and
    /// phi sources, so the phis of `to` keep their values.
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> Result<BlockId, IrError> {
        self.check_block(from)?;
        self.check_block(to)?;

        let terminator = self.terminator(from).ok_or_else(|| IrError::MissingTerminator {
            function: self.describe(),
            block: from,
        })?;

        let positions = self.blocks[to]
            .predecessors
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == from)
            .map(|(position, _)| position)
            .collect::<Vec<_>>();

        let Some((&first, rest)) = positions.split_first() else {
            return Err(IrError::MissingEdge {
                function: self.describe(),
                from,
                to,
            });
        };

        let split = self.create_block("split");

        // Parallel edges carry the same phi values, one of them is enough
        for phi in self.phis(to) {
            if let Instruction::Phi { sources, .. } = self.instruction_mut(phi) {
                sources[first].block = split;

                for position in rest.iter().rev() {
                    sources.remove(*position);
                }
            }
        }

        let predecessors = &mut self.blocks[to].predecessors;
        predecessors[first] = split;
        for position in rest.iter().rev() {
            predecessors.remove(*position);
        }

        for target in self.instruction_mut(terminator).targets_mut() {
            if *target == to {
                *target = split;
            }
        }

        self.blocks[from].successors = self.instruction(terminator).targets();
        self.blocks[split].predecessors = vec![from; positions.len()];
        self.link_after(split, None, Instruction::Jump { destination: to });
        self.blocks[split].successors.push(to);

        Ok(split)
    }

    /// Appends the body of `from` to `into` and deletes `from`. `into` must
    /// end in a jump to `from`, and that jump must be the only way into
    /// `from`.
    pub fn splice_block(&mut self, into: BlockId, from: BlockId) -> Result<(), IrError> {
        self.check_block(into)?;
        self.check_block(from)?;

        let invalid = || IrError::InvalidSplice {
            function: self.describe(),
            into,
            from,
        };

        let jump = self.terminator(into).ok_or_else(invalid)?;

        if into == from
            || from == self.entry
            || *self.instruction(jump) != (Instruction::Jump { destination: from })
            || self.blocks[from].predecessors != [into]
        {
            return Err(invalid());
        }

        // With a single predecessor every phi just forwards its only source
        for phi in self.phis(from) {
            if let Instruction::Phi {
                destination,
                sources,
            } = self.instruction(phi).clone()
            {
                self.instructions[phi].kind = Instruction::Move {
                    destination,
                    source: sources[0].value,
                };
            }
        }

        self.unlink(jump);
        self.blocks[into].successors.clear();
        self.blocks[from].predecessors.clear();

        let moved = self.instruction_ids(from);
        for id in &moved {
            self.instructions[*id].block = into;
        }

        if let (Some(first), Some(last)) = (self.blocks[from].first, self.blocks[from].last) {
            match self.blocks[into].last {
                Some(tail) => {
                    self.instructions[tail].next = Some(first);
                    self.instructions[first].previous = Some(tail);
                }
                None => self.blocks[into].first = Some(first),
            }
            self.blocks[into].last = Some(last);
        }

        let successors = std::mem::take(&mut self.blocks[from].successors);

        let mut seen = HashSet::new();
        for successor in &successors {
            if !seen.insert(*successor) {
                continue;
            }

            for predecessor in &mut self.blocks[*successor].predecessors {
                if *predecessor == from {
                    *predecessor = into;
                }
            }

            for phi in self.phis(*successor) {
                if let Instruction::Phi { sources, .. } = self.instruction_mut(phi) {
                    for source in sources.iter_mut().filter(|s| s.block == from) {
                        source.block = into;
                    }
                }
            }
        }

        self.blocks[into].successors = successors;

        let block = &mut self.blocks[from];
        block.removed = true;
        block.first = None;
        block.last = None;

        if self.exit == Some(from) {
            self.exit = Some(into);
        }

        Ok(())
    }

    /// Deletes a set of blocks which no block outside the set can reach. The
    /// entry block is never deleted.
    pub fn remove_blocks(&mut self, blocks: &HashSet<BlockId>) -> Result<(), IrError> {
        let mut ordered = blocks
            .iter()
            .copied()
            .filter(|b| *b != self.entry)
            .collect::<Vec<_>>();
        ordered.sort();

        for block in &ordered {
            self.check_block(*block)?;

            if self.blocks[*block]
                .predecessors
                .iter()
                .any(|p| !blocks.contains(p))
            {
                return Err(IrError::InconsistentEdges {
                    function: self.describe(),
                    block: *block,
                });
            }
        }

        for block in &ordered {
            for successor in self.blocks[*block].successors.clone() {
                if !blocks.contains(&successor) {
                    self.remove_edge(*block, successor)?;
                }
            }
        }

        for block in ordered {
            for id in self.instruction_ids(block) {
                let node = &mut self.instructions[id];
                node.removed = true;
                node.previous = None;
                node.next = None;
            }

            let removed = &mut self.blocks[block];
            removed.removed = true;
            removed.first = None;
            removed.last = None;
            removed.predecessors.clear();
            removed.successors.clear();
            removed.rpo_index = None;

            if self.exit == Some(block) {
                self.exit = None;
            }
        }

        Ok(())
    }

    /// Live blocks reachable from the entry along successor edges, in
    /// reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = IndexVec::<BlockId, bool>::from_elem_n(false, self.blocks.len());
        let mut postorder = Vec::new();
        let mut stack = vec![(self.entry, 0usize)];

        visited[self.entry] = true;

        while let Some((block, next)) = stack.last_mut() {
            let block = *block;

            match self.blocks[block].successors.get(*next) {
                Some(successor) => {
                    *next += 1;

                    if !visited[*successor] {
                        visited[*successor] = true;
                        stack.push((*successor, 0));
                    }
                }
                None => {
                    postorder.push(block);
                    stack.pop();
                }
            }
        }

        postorder.reverse();
        postorder
    }

    /// Records each reachable block's position in the reverse postorder and
    /// returns that order
    pub fn number_blocks(&mut self) -> Vec<BlockId> {
        let order = self.reverse_postorder();

        for block in self.blocks.iter_mut() {
            block.rpo_index = None;
        }

        for (index, block) in order.iter().enumerate() {
            self.blocks[*block].rpo_index = Some(index);
        }

        order
    }

    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        self.reverse_postorder().into_iter().collect()
    }

    /// Rewrites every definition and use of `old`, phi sources included, to
    /// refer to `new` instead
    pub fn replace_register(&mut self, old: RegisterId, new: RegisterId) {
        for id in self.all_instructions() {
            let kind = self.instruction_mut(id);

            kind.visit_register_uses_mut(&mut |r| {
                if *r == old {
                    *r = new;
                }
            });

            if let Some(Storage::Virtual(destination)) = kind.destination_mut()
                && *destination == old
            {
                *destination = new;
            }

            if let Instruction::Phi { sources, .. } = kind {
                for source in sources {
                    if source.value == Operand::virtual_register(old) {
                        source.value = Operand::virtual_register(new);
                    }
                }
            }
        }
    }
}

/// Walks the instruction list of a block front to back
pub struct BlockInstructions<'f> {
    function: &'f Function,
    next: Option<InstructionId>,
}

impl<'f> Iterator for BlockInstructions<'f> {
    type Item = (InstructionId, &'f Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = &self.function.instructions[id];

        self.next = node.next;

        Some((id, &node.kind))
    }
}
