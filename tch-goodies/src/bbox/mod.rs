//! Box tensors packed in the last dimension.

mod cxcywh;
mod xyxy;

pub use cxcywh::*;
pub use xyxy::*;
