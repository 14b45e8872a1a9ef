//! Model module - Fixed-layout records read out of the target's memory

mod member;

pub use member::*;
