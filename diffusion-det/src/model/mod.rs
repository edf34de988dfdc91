//! The stacked detection head.

mod head;
mod head_series;

pub use head::*;
pub use head_series::*;
