pub use anyhow::{ensure, Context as _, Result};
pub use getset::CopyGetters;
pub use itertools::{izip, Itertools as _};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use tch::{
    nn::{self, Module as _},
    Device, Kind, Tensor,
};
pub use tch_act::{Activation, TensorActivationExt as _};
pub use tch_goodies::{TensorExt as _, XYXYTensor};
