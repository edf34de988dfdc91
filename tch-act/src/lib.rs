#[cfg(feature = "tch")]
pub use impls::*;
#[cfg(feature = "tch")]
mod impls;

#[cfg(feature = "tch")]
pub use r#trait::*;
#[cfg(feature = "tch")]
mod r#trait;

/// Element-wise activation selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Relu,
    Gelu,
    Silu,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Relu
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn activation_names_are_snake_case() {
        let act: Activation = serde_json::from_str(r#""gelu""#).unwrap();
        assert_eq!(act, Activation::Gelu);
        assert_eq!(serde_json::to_string(&Activation::Silu).unwrap(), r#""silu""#);
        assert!(serde_json::from_str::<Activation>(r#""mish""#).is_err());
        assert!(serde_json::from_str::<Activation>(r#""linear""#).is_err());
    }
}
