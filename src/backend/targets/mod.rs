use crate::{
    backend::{CodegenOptions, coloring::Coloring},
    error::IrError,
    index::IndexVec,
    middle::lir::{self, FunctionId},
};

mod x86_64_linux_gnu;

pub trait CodeGenerator {
    /// Emits the whole module. `colorings` is indexed by function; missing
    /// entries count as empty colorings.
    fn translate_to_asm(
        &self,
        module: &lir::Module,
        colorings: &IndexVec<FunctionId, Coloring>,
        options: &CodegenOptions,
    ) -> Result<String, IrError>;
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    x86_64LinuxGnu,
}

impl Target {
    pub fn get_code_generator(self) -> impl CodeGenerator {
        match self {
            Target::x86_64LinuxGnu => x86_64_linux_gnu::CodeGeneratorX86_64LinuxGnu,
        }
    }
}
