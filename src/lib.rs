pub mod backend;
pub mod error;
pub mod frontend;
pub mod index;
pub mod middle;
pub mod pipeline;
