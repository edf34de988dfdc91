//! Tensor-level helpers shared by the detection crates.

pub mod bbox;
mod common;
pub mod random;
pub mod tensor;

pub use bbox::*;
pub use random::*;
pub use tensor::*;
