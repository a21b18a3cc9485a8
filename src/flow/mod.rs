//! Question flow: the static question graph and the navigator walking it.
//!
//! This module provides:
//! - `FlowCatalog`: situations, questions and branch pointers, validated on load
//! - `FlowNavigator`: the state machine that records answers and picks the next step
//! - `Navigation`: the outcome of one answer

mod catalog;
mod navigator;

pub use catalog::*;
pub use navigator::*;
