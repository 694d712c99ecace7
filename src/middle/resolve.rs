//! Global variable resolution. Abstract `Storage::Global` references are
//! rewritten into labeled memory operands, and every global receives the
//! label its storage is emitted under.

use hashbrown::HashSet;
use tracing::debug;

use crate::{
    error::IrError,
    frontend::intern::InternedSymbol,
    middle::lir::{Function, Instruction, Memory, Module, Operand, Storage},
};

/// Resolves every global of the module. Running it again on a resolved
/// module changes nothing.
pub fn resolve_globals(module: &mut Module) -> Result<(), IrError> {
    assign_labels(module);

    for function in module.functions.iter_mut() {
        let rewritten = resolve_function(function)?;

        if rewritten != 0 {
            debug!(function = %function.name, rewritten, "resolved global references");
        }
    }

    Ok(())
}

/// Gives every global without a label one, in declaration order. A label is
/// the global's own name unless a function or an earlier label already
/// claims it.
fn assign_labels(module: &mut Module) {
    let mut taken = module
        .functions
        .iter()
        .map(|f| f.name.value())
        .chain(module.globals.iter().filter_map(|g| g.label.map(|l| l.value())))
        .collect::<HashSet<_>>();

    for global in module.globals.iter_mut() {
        if global.label.is_some() {
            continue;
        }

        let base = global.name.value();
        let mut label = base.to_owned();
        let mut counter = 0;

        while taken.contains(label.as_str()) {
            counter += 1;
            label = format!("{base}_g{counter}");
        }

        let symbol = InternedSymbol::new(&label);
        taken.insert(symbol.value());
        global.label = Some(symbol);
    }
}

/// Rewrites the instructions of one function, returning how many changed
fn resolve_function(function: &mut Function) -> Result<usize, IrError> {
    let mut rewritten = 0;

    for id in function.all_instructions() {
        let original = function.instruction(id).clone();

        if !original.references_global() {
            continue;
        }

        let mut kind = original;
        kind.visit_storages_mut(&mut |storage| {
            if let Storage::Global(global) = *storage {
                *storage = Storage::Memory(Memory::global(global));
            }
        });

        let kind = match kind {
            Instruction::Move {
                destination: Storage::Memory(destination),
                source: Operand::Storage(Storage::Memory(source)),
            } => {
                // Memory to memory goes through a fresh register
                let temporary = function.create_register(None);

                function.insert_before(
                    id,
                    Instruction::Load {
                        destination: Storage::Virtual(temporary),
                        source,
                    },
                )?;

                Instruction::Store {
                    destination,
                    source: Operand::virtual_register(temporary),
                }
            }
            Instruction::Move {
                destination: Storage::Memory(destination),
                source,
            } => Instruction::Store {
                destination,
                source,
            },
            Instruction::Move {
                destination,
                source: Operand::Storage(Storage::Memory(source)),
            } => Instruction::Load {
                destination,
                source,
            },
            other => other,
        };

        function.replace_instruction(id, kind)?;
        rewritten += 1;
    }

    Ok(rewritten)
}
