use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{backend::assemblers::x86_64::PhysicalRegister, index::Index, middle::lir::RegisterId};

/// Where the register allocator placed each virtual register of one
/// function. Registers without an entry are printed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coloring {
    /// Keyed by register index
    pub assignments: BTreeMap<usize, Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Register(PhysicalRegister),
    /// A word-sized stack slot below the function's temporaries
    Slot(u32),
}

impl Coloring {
    pub fn assign(&mut self, register: RegisterId, location: Location) {
        self.assignments.insert(register.index(), location);
    }

    pub fn location(&self, register: RegisterId) -> Option<Location> {
        self.assignments.get(&register.index()).copied()
    }

    /// Number of stack slots the frame has to reserve
    pub fn slot_count(&self) -> usize {
        self.assignments
            .values()
            .filter_map(|l| match l {
                Location::Slot(slot) => Some(*slot as usize + 1),
                Location::Register(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorings_read_from_json() {
        let coloring: Coloring =
            serde_json::from_str(r#"{ "0": { "register": "rbx" }, "3": { "slot": 2 } }"#).unwrap();

        assert_eq!(
            coloring.location(RegisterId::new(0)),
            Some(Location::Register(PhysicalRegister::Rbx))
        );
        assert_eq!(coloring.location(RegisterId::new(1)), None);
        assert_eq!(coloring.slot_count(), 3);
    }
}
