//! Neural network building blocks for query-based detection heads.

mod common;

pub mod attention;
pub mod dynamic_conv;
pub mod init;
pub mod linear_norm_act;
pub mod roi_align;
pub mod roi_pooler;
pub mod sinusoidal;

pub use attention::*;
pub use dynamic_conv::*;
pub use init::*;
pub use linear_norm_act::*;
pub use roi_align::*;
pub use roi_pooler::*;
pub use sinusoidal::*;
