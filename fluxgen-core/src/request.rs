use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_WIDTH: usize = 512;
pub const DEFAULT_HEIGHT: usize = 512;
pub const DEFAULT_STEPS: usize = 4;
pub const DEFAULT_GUIDANCE: f64 = 0.0;

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("guidance scale must be a finite, non-negative number (got {0})")]
    Guidance(f64),
    #[error("{name} of {value} is not a multiple of {alignment}")]
    Unaligned {
        name: &'static str,
        value: usize,
        alignment: usize,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    /// 0.0 for guidance-distilled variants such as schnell, around 3.5 for dev.
    pub guidance: f64,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            guidance: DEFAULT_GUIDANCE,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.prompt.is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("steps", self.steps),
        ] {
            if value == 0 {
                return Err(RequestError::Zero { name });
            }
        }
        if !self.guidance.is_finite() || self.guidance < 0.0 {
            return Err(RequestError::Guidance(self.guidance));
        }
        Ok(())
    }

    /// Checks that both dimensions are multiples of `alignment`.
    pub fn check_alignment(&self, alignment: usize) -> Result<(), RequestError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value % alignment != 0 {
                return Err(RequestError::Unaligned {
                    name,
                    value,
                    alignment,
                });
            }
        }
        Ok(())
    }
}
