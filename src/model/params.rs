use alloc::{string::String, vec::Vec};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Convolution kernel, `[out, in / groups, k, k]`.
    ConvWeight,
    /// Learned per-channel additive term, `[out]`.
    ChannelBias,
}

/// Name, shape and optimizer attributes of a learnable parameter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: ParamKind,
    /// Multiplier applied to the global learning rate.
    pub learning_rate: f64,
    /// L2 regularization coefficient.
    pub l2_decay: f64,
}

impl ParamSpec {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}
