//! Operand and storage descriptors. Everything here is a small `Copy` value:
//! an instruction that reads or writes a location carries the description of
//! that location by value, so passes can freely rewrite operands without
//! worrying about shared ownership.

pub use crate::backend::assemblers::x86_64::PhysicalRegister;
use crate::middle::lir::{GlobalId, RegisterId, StaticStringId};

/// Width in bytes of every value the IR manipulates
pub const WORD_SIZE: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Immediate(i64),
    Storage(Storage),
}

/// A location a value can be read from and (except for static strings)
/// written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Unbounded per-function register, assigned a location by the register
    /// allocator
    Virtual(RegisterId),
    Physical(PhysicalRegister),
    Memory(Memory),
    /// Abstract reference to a program-level variable. Only valid until the
    /// global resolver has run.
    Global(GlobalId),
    /// Address of a static string constant
    StaticString(StaticStringId),
}

/// A register which can take part in an address computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Virtual(RegisterId),
    Physical(PhysicalRegister),
}

/// Labeled data a memory operand can be relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSymbol {
    Global(GlobalId),
    StaticString(StaticStringId),
}

/// `[symbol + base + index * scale + offset]`, every component optional
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Memory {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub offset: i64,
    pub symbol: Option<DataSymbol>,
}

impl Memory {
    pub fn base_offset(base: Register, offset: i64) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            offset,
            symbol: None,
        }
    }

    pub fn indexed(base: Register, index: Register, scale: u8, offset: i64) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            offset,
            symbol: None,
        }
    }

    pub fn global(global: GlobalId) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            offset: 0,
            symbol: Some(DataSymbol::Global(global)),
        }
    }

    pub fn registers(&self) -> impl Iterator<Item = Register> {
        self.base.into_iter().chain(self.index)
    }

    pub fn registers_mut(&mut self) -> impl Iterator<Item = &mut Register> {
        self.base.iter_mut().chain(self.index.iter_mut())
    }
}

impl Operand {
    pub const fn virtual_register(register: RegisterId) -> Self {
        Self::Storage(Storage::Virtual(register))
    }

    pub const fn physical(register: PhysicalRegister) -> Self {
        Self::Storage(Storage::Physical(register))
    }

    pub fn as_storage(&self) -> Option<Storage> {
        match self {
            Operand::Immediate(_) => None,
            Operand::Storage(storage) => Some(*storage),
        }
    }

    pub fn as_virtual(&self) -> Option<RegisterId> {
        self.as_storage().and_then(|s| s.as_virtual())
    }
}

impl Storage {
    pub fn as_virtual(&self) -> Option<RegisterId> {
        match self {
            Storage::Virtual(register) => Some(*register),
            _ => None,
        }
    }

    /// Virtual registers read when this storage is accessed. Writing to a
    /// memory location still reads its address registers.
    pub fn address_registers(&self) -> impl Iterator<Item = RegisterId> {
        let memory = match self {
            Storage::Memory(memory) => Some(*memory),
            _ => None,
        };

        memory
            .into_iter()
            .flat_map(|m| m.registers().collect::<Vec<_>>())
            .filter_map(|r| match r {
                Register::Virtual(id) => Some(id),
                Register::Physical(_) => None,
            })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Storage::Memory(_))
    }
}

impl From<Storage> for Operand {
    fn from(value: Storage) -> Self {
        Self::Storage(value)
    }
}

impl From<Register> for Storage {
    fn from(value: Register) -> Self {
        match value {
            Register::Virtual(id) => Storage::Virtual(id),
            Register::Physical(register) => Storage::Physical(register),
        }
    }
}

impl From<RegisterId> for Storage {
    fn from(value: RegisterId) -> Self {
        Storage::Virtual(value)
    }
}

impl From<PhysicalRegister> for Storage {
    fn from(value: PhysicalRegister) -> Self {
        Storage::Physical(value)
    }
}

impl From<Memory> for Storage {
    fn from(value: Memory) -> Self {
        Storage::Memory(value)
    }
}
