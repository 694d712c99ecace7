//! Conversion into and out of static single assignment form. Between the
//! two, every virtual register has exactly one definition and phis at block
//! entries select values by incoming edge.

mod construct;
mod destruct;

pub use construct::construct_ssa;
pub use destruct::{destruct_ssa, schedule_parallel_copy};
