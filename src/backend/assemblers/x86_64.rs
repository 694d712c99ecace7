use serde::{Deserialize, Serialize};

/// Indentation used for everything that is not a label
const INDENT: &str = "        ";

/// Line oriented NASM text buffer
#[derive(Debug, Default)]
pub struct Assembler {
    output: String,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_output(self) -> String {
        self.output
    }

    pub fn push_line(&mut self, string: impl AsRef<str>) {
        self.output.push_str(string.as_ref());
        self.output.push('\n');
    }

    pub fn blank_line(&mut self) {
        self.output.push('\n');
    }

    /// An indented instruction or data directive
    pub fn emit(&mut self, string: impl AsRef<str>) {
        self.output.push_str(INDENT);
        self.push_line(string);
    }

    /// A two-operand instruction
    pub fn instruction(&mut self, mnemonic: &str, destination: &str, source: &str) {
        self.emit(format!("{mnemonic:<8}{destination}, {source}"));
    }

    /// A one-operand instruction
    pub fn unary(&mut self, mnemonic: &str, operand: &str) {
        self.emit(format!("{mnemonic:<8}{operand}"));
    }

    pub fn label(&mut self, name: impl AsRef<str>) {
        self.push_line(format!("{}:", name.as_ref()));
    }

    pub fn comment(&mut self, comment: impl AsRef<str>) {
        self.emit(format!("; {}", comment.as_ref()));
    }

    pub fn section(&mut self, header: impl AsRef<str>) {
        self.push_line(format!("SECTION {}", header.as_ref()));
    }
}

/// General purpose 64-bit register
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PhysicalRegister {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl PhysicalRegister {
    /// Registers carrying the first six integer arguments, in order
    pub const ARGUMENTS: [Self; 6] = [Self::Rdi, Self::Rsi, Self::Rdx, Self::Rcx, Self::R8, Self::R9];

    /// Holds a function's result
    pub const RETURN: Self = Self::Rax;

    /// Variable shift counts have to live in the low byte of this register
    pub const SHIFT_COUNT: Self = Self::Rcx;

    /// Reserved for the code emitter. Colorings must not use it.
    pub const SCRATCH: Self = Self::R11;

    pub fn as_8_bit(self) -> &'static str {
        match self {
            Self::Rax => "al",
            Self::Rbx => "bl",
            Self::Rcx => "cl",
            Self::Rdx => "dl",
            Self::Rsi => "sil",
            Self::Rdi => "dil",
            Self::Rbp => "bpl",
            Self::Rsp => "spl",
            Self::R8 => "r8b",
            Self::R9 => "r9b",
            Self::R10 => "r10b",
            Self::R11 => "r11b",
            Self::R12 => "r12b",
            Self::R13 => "r13b",
            Self::R14 => "r14b",
            Self::R15 => "r15b",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_are_aligned() {
        let mut assembler = Assembler::new();

        assembler.label("main_entry_1");
        assembler.instruction("mov", "rax", "1");
        assembler.unary("push", "rbp");
        assembler.emit("ret");

        assert_eq!(
            assembler.into_output(),
            "main_entry_1:\n        mov     rax, 1\n        push    rbp\n        ret\n"
        );
    }

    #[test]
    fn register_names_are_lowercase() {
        assert_eq!(PhysicalRegister::R11.to_string(), "r11");
        assert_eq!(PhysicalRegister::Rcx.as_8_bit(), "cl");
    }
}
