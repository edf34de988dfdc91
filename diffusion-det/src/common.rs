pub use anyhow::{bail, ensure, format_err, Context as _, Result};
pub use bbox::HW;
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::Rng;
pub use serde::{Deserialize, Serialize};
pub use std::{borrow::Borrow, cell::RefCell, iter, path::Path};
pub use tch::{
    nn::{self, Module as _},
    Device, Kind, Tensor,
};
pub use tch_act::{Activation, TensorActivationExt as _};
pub use tch_goodies::{randn_tensor, CxCyWHTensor, TensorExt as _, XYXYTensor};
