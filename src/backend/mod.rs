//! The backend turns optimized, SSA-destructed and register colored LIR into
//! assembly text. Register allocation itself happens outside of this crate:
//! its result arrives as a [`coloring::Coloring`] per function.

pub mod assemblers {
    pub mod x86_64;
}
pub mod coloring;
pub mod targets;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Precede every emitted instruction with a comment holding the LIR
    /// instruction it was lowered from
    pub annotate: bool,
}
