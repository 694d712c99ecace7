//! The compiler front end ends at semantic analysis, which hands over a
//! checked AST serialized as JSON. This module only holds that AST and the
//! string interner shared by everything after it.

pub mod ast;
pub mod intern;

/// Reads a checked program from its JSON form
pub fn parse_program(json: &str) -> serde_json::Result<ast::Program> {
    serde_json::from_str(json)
}
