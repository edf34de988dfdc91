pub use anyhow::{ensure, format_err, Error, Result};
pub use getset::Getters;
pub use itertools::Itertools as _;
pub use log::debug;
pub use std::borrow::Borrow;
pub use tch::{Device, Kind, Tensor};
