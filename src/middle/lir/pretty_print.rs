use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    index::Index,
    middle::lir::{self, Callee, DataSymbol, Operand, Register, Storage},
};

/// Renders a whole module: globals, strings, then each function
pub fn pretty_print_module(module: &lir::Module) -> String {
    let mut output = String::new();

    for (id, global) in module.globals.enumerate() {
        let _ = writeln!(
            output,
            "{} {} {}",
            "global".magenta(),
            id,
            global.name.value().blue()
        );
    }

    for (id, string) in module.static_strings.enumerate() {
        let _ = writeln!(
            output,
            "{} {} {}",
            "string".magenta(),
            id,
            format!("{:?}", string.value).green()
        );
    }

    for (id, function) in module.functions.enumerate() {
        if !output.is_empty() {
            output.push('\n');
        }

        if module.entry == Some(id) {
            let _ = writeln!(output, "{}", "; program entry".bright_black());
        }

        output.push_str(&pretty_print_function(function));
    }

    output
}

pub fn pretty_print_function(function: &lir::Function) -> String {
    let mut output = String::new();

    let _ = writeln!(
        output,
        "{} {}{}{}{}",
        "fn".magenta(),
        function.name.value().blue(),
        "(".white(),
        function.parameter_count.to_string().purple(),
        ") {".white()
    );

    let order = function.reverse_postorder();
    let unreachable = function
        .live_blocks()
        .into_iter()
        .filter(|b| !order.contains(b));

    for block in order.iter().copied().chain(unreachable) {
        let info = &function.blocks[block];

        let mut header = format!("{block} ({}):", info.name.value());
        if !info.predecessors.is_empty() {
            header.push_str(&format!(
                " ; preds {}",
                info.predecessors.iter().join(", ")
            ));
        }

        let _ = writeln!(output, "{}", header.bright_red());

        for (_, instruction) in function.instructions_in(block) {
            let _ = writeln!(output, "    {instruction}");
        }
    }

    let _ = writeln!(output, "{}", "}".white());

    output
}

impl core::fmt::Display for lir::Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Instruction::HeapAlloc { destination, size } => {
                write!(f, "{destination} {} {} {size}", "=".white(), "alloc".cyan())
            }
            lir::Instruction::BinaryOperation {
                operator,
                destination,
                lhs,
                rhs,
            } => write!(
                f,
                "{destination} {} {} {lhs}, {rhs}",
                "=".white(),
                operator.to_string().white()
            ),
            lir::Instruction::Branch {
                operator,
                condition,
                positive,
                negative,
            } => write!(
                f,
                "{} {condition} {} {}, {}",
                "br".cyan(),
                operator.to_string().white(),
                positive.to_string().blue(),
                negative.to_string().blue()
            ),
            lir::Instruction::FunctionCall { callee, arguments } => {
                let callee = match callee {
                    Callee::Function(id) => format!("@f{}", id.index()),
                    Callee::Runtime(runtime) => format!("@{runtime}"),
                };

                write!(
                    f,
                    "{} {}{}{}{}",
                    "call".cyan(),
                    callee.blue(),
                    "(".white(),
                    arguments.iter().join(", "),
                    ")".white()
                )
            }
            lir::Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => write!(
                f,
                "{destination} {} {} {} {lhs}, {rhs}",
                "=".white(),
                "cmp".cyan(),
                operator.to_string().white()
            ),
            lir::Instruction::Jump { destination } => {
                write!(f, "{} {}", "jmp".cyan(), destination.to_string().blue())
            }
            lir::Instruction::Load {
                destination,
                source,
            } => write!(
                f,
                "{destination} {} {} {}",
                "=".white(),
                "load".cyan(),
                Storage::Memory(*source)
            ),
            lir::Instruction::Move {
                destination,
                source,
            } => write!(f, "{destination} {} {source}", "=".white()),
            lir::Instruction::Return { value: Some(value) } => {
                write!(f, "{} {value}", "ret".cyan())
            }
            lir::Instruction::Return { value: None } => write!(f, "{}", "ret".cyan()),
            lir::Instruction::Store {
                destination,
                source,
            } => write!(
                f,
                "{} {} {} {source}",
                "store".cyan(),
                Storage::Memory(*destination),
                "<-".white()
            ),
            lir::Instruction::UnaryOperation {
                operator,
                destination,
                operand,
            } => write!(
                f,
                "{destination} {} {} {operand}",
                "=".white(),
                operator.to_string().white()
            ),
            lir::Instruction::Phi {
                destination,
                sources,
            } => write!(
                f,
                "{destination} {} {}{}{}{}",
                "=".white(),
                "phi".bright_green(),
                "(".white(),
                sources
                    .iter()
                    .map(|s| format!("{} -> {}", s.block.to_string().blue(), s.value))
                    .join(", "),
                ")".white()
            ),
            lir::Instruction::Lea {
                destination,
                source,
            } => write!(
                f,
                "{destination} {} {} {}",
                "=".white(),
                "lea".cyan(),
                Storage::Memory(*source)
            ),
            lir::Instruction::Push { source } => write!(f, "{} {source}", "push".cyan()),
            lir::Instruction::Pop { destination } => {
                write!(f, "{} {destination}", "pop".cyan())
            }
        }
    }
}

impl core::fmt::Display for lir::RegisterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%{}", self.index()).yellow())
    }
}

impl core::fmt::Display for lir::BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".bb{}", self.index())
    }
}

impl core::fmt::Display for lir::GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@g{}", self.index())
    }
}

impl core::fmt::Display for lir::StaticStringId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@str{}", self.index())
    }
}

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Register::Virtual(id) => write!(f, "{id}"),
            Register::Physical(register) => write!(f, "{}", register.to_string().red()),
        }
    }
}

impl core::fmt::Display for lir::Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();

        match self.symbol {
            Some(DataSymbol::Global(id)) => parts.push(id.to_string()),
            Some(DataSymbol::StaticString(id)) => parts.push(id.to_string()),
            None => {}
        }

        if let Some(base) = self.base {
            parts.push(base.to_string());
        }

        if let Some(index) = self.index {
            parts.push(format!("{index}*{}", self.scale));
        }

        if self.offset != 0 || parts.is_empty() {
            parts.push(self.offset.to_string().purple().to_string());
        }

        write!(f, "[{}]", parts.join(" + "))
    }
}

impl core::fmt::Display for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Virtual(id) => write!(f, "{id}"),
            Storage::Physical(register) => write!(f, "{}", register.to_string().red()),
            Storage::Memory(memory) => write!(f, "{memory}"),
            Storage::Global(id) => write!(f, "{}", id.to_string().blue()),
            Storage::StaticString(id) => write!(f, "{}", id.to_string().green()),
        }
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Immediate(value) => write!(f, "{}", value.to_string().purple()),
            Operand::Storage(storage) => write!(f, "{storage}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::lir::{Function, Instruction, PhysicalRegister};

    #[test]
    fn prints_blocks_in_layout_order() {
        let mut function = Function::new("printed", 0);
        let exit = function.exit.unwrap();
        let register = function.create_register(None);

        function
            .push_instruction(
                function.entry,
                Instruction::Move {
                    destination: Storage::Physical(PhysicalRegister::Rax),
                    source: Operand::virtual_register(register),
                },
            )
            .unwrap();
        function
            .push_instruction(function.entry, Instruction::Jump { destination: exit })
            .unwrap();
        function
            .push_instruction(exit, Instruction::Return { value: None })
            .unwrap();

        let text = strip_ansi_escapes::strip_str(pretty_print_function(&function));

        assert!(text.starts_with("fn printed(0) {"));
        assert!(text.contains("rax = %0"));
        assert!(text.find("printed_entry").unwrap() < text.find("printed_exit").unwrap());
    }
}
