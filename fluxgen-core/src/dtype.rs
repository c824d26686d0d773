use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Precision the model weights are loaded in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    #[default]
    F16,
    BF16,
    F32,
}

serde_plain::derive_display_from_serialize!(ModelDType);
serde_plain::derive_fromstr_from_deserialize!(ModelDType);

impl ModelDType {
    pub fn as_dtype(&self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}
