use alloc::{format, string::String};

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Device, Tensor},
};

use super::{
    conv_norm::{Activation, ConvNorm, ConvNormConfig},
    params::ParamSpec,
};

/// Auxiliary downsampling stage: 1x1 conv then a stride 2 3x3 conv, both ReLU6.
#[derive(Module, Debug)]
pub struct ExtraBlock<B: Backend> {
    pointwise: ConvNorm<B>,
    conv: ConvNorm<B>,
}

impl<B: Backend> ExtraBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pointwise.forward(x);
        self.conv.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn units(&self) -> [&ConvNorm<B>; 2] {
        [&self.pointwise, &self.conv]
    }
}

/// [Extra block](ExtraBlock) configuration. Channel counts are not width scaled.
#[derive(Config, Debug)]
pub struct ExtraBlockConfig {
    pub name: String,
    pub in_channels: usize,
    pub num_filters1: usize,
    pub num_filters2: usize,

    #[config(default = "1.0")]
    pub learning_rate: f64,

    #[config(default = "0.0")]
    pub weight_decay: f64,

    #[config(default = "0.0")]
    pub bias_decay: f64,
}

impl ExtraBlockConfig {
    pub fn units(&self) -> [ConvNormConfig; 2] {
        let pointwise = ConvNormConfig::new(
            format!("{}_extra1", self.name),
            self.in_channels,
            self.num_filters1,
        )
        .with_kernel_size(1)
        .with_stride(1)
        .with_padding(0);
        let conv = ConvNormConfig::new(
            format!("{}_extra2", self.name),
            self.num_filters1,
            self.num_filters2,
        )
        .with_kernel_size(3)
        .with_stride(2)
        .with_padding(1);

        [pointwise, conv].map(|unit| {
            unit.with_activation(Activation::Relu6)
                .with_learning_rate(self.learning_rate)
                .with_weight_decay(self.weight_decay)
                .with_bias_decay(self.bias_decay)
        })
    }

    /// Initialize a new [extra block](ExtraBlock) module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ExtraBlock<B> {
        let [pointwise, conv] = self.units();

        ExtraBlock {
            pointwise: pointwise.init(device),
            conv: conv.init(device),
        }
    }

    pub fn param_specs(&self) -> impl Iterator<Item = ParamSpec> {
        self.units().into_iter().flat_map(|unit| unit.param_specs())
    }
}
